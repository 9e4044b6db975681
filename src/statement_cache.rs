use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::udbc::statement::{Statement, StatementKey};

struct Entry {
    statement: Box<dyn Statement>,
    tick: u64,
}

/// Bounded cache of prepared statements for one physical connection.
///
/// `get` checks a statement out (removes it), so a cached statement is
/// never shared. When full, `put` evicts the least recently cached entry
/// and closes it.
pub struct StatementCache {
    capacity: usize,
    entries: HashMap<StatementKey, Entry>,
    // tick -> key, oldest first
    order: BTreeMap<u64, StatementKey>,
    tick: u64,
    evictions: u64,
}

fn close_quietly(key: &StatementKey, mut statement: Box<dyn Statement>) {
    if let Err(e) = statement.close() {
        warn!(sql = %key.sql, error = %e, "failed to close evicted statement");
    }
}

impl StatementCache {
    /// Returns `None` for capacity 0: statement caching disabled.
    pub fn new(capacity: usize) -> Option<Self> {
        (capacity > 0).then(|| Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: BTreeMap::new(),
            tick: 0,
            evictions: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn get(&mut self, key: &StatementKey) -> Option<Box<dyn Statement>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry.statement)
    }

    /// Caches `statement`. A statement already cached under the same key is
    /// replaced and closed.
    pub fn put(&mut self, key: StatementKey, statement: Box<dyn Statement>) {
        if let Some(old) = self.get(&key) {
            close_quietly(&key, old);
        }
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.tick += 1;
        self.order.insert(self.tick, key.clone());
        self.entries.insert(
            key,
            Entry {
                statement,
                tick: self.tick,
            },
        );
    }

    /// Drops and closes the entry for `key`, used when a statement went stale.
    pub fn remove(&mut self, key: &StatementKey) -> bool {
        match self.get(key) {
            Some(stmt) => {
                close_quietly(key, stmt);
                true
            }
            None => false,
        }
    }

    fn evict_oldest(&mut self) {
        let Some((_, key)) = self.order.pop_first() else {
            return;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.evictions += 1;
            debug!(sql = %key.sql, "evicting cached statement");
            close_quietly(&key, entry.statement);
        }
    }

    /// Closes every cached statement.
    pub fn clear(&mut self) {
        let drained: Vec<_> = self.entries.drain().collect();
        self.order.clear();
        for (key, entry) in drained {
            close_quietly(&key, entry.statement);
        }
    }

    /// Moves entries into a cache of `capacity`, most recently used first,
    /// closing whatever no longer fits. Capacity 0 drains everything.
    pub fn resize(mut self, capacity: usize) -> Option<StatementCache> {
        let Some(mut resized) = StatementCache::new(capacity) else {
            self.clear();
            return None;
        };
        let mut keep: Vec<(StatementKey, Box<dyn Statement>)> = Vec::new();
        while let Some((_, key)) = self.order.pop_last() {
            if let Some(entry) = self.entries.remove(&key) {
                if keep.len() < capacity {
                    keep.push((key, entry.statement));
                } else {
                    close_quietly(&key, entry.statement);
                }
            }
        }
        for (key, statement) in keep.into_iter().rev() {
            resized.put(key, statement);
        }
        resized.evictions = self.evictions;
        Some(resized)
    }
}

impl Drop for StatementCache {
    fn drop(&mut self) {
        self.clear();
    }
}
