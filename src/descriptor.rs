//! Connection request descriptors and the matching rules used to decide
//! whether a pooled connection can serve a request.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;

use crate::error::DbError;
use crate::udbc::connection::{Holdability, IsolationLevel, TypeMap};
use crate::udbc::value::ShardingKey;

/// Property values the driver uses when a property is never set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriverDefaults {
    pub isolation: Option<IsolationLevel>,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub read_only: Option<bool>,
    pub type_map: Option<TypeMap>,
    pub holdability: Option<Holdability>,
    pub network_timeout: u32,
}

/// Describes the connection a request wants.
///
/// Once frozen (for example when it becomes the key of a pooled
/// connection) a descriptor can no longer change in place; the `with_*`
/// methods always return a mutable copy instead.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRequestInfo {
    user: Option<String>,
    #[serde(skip)]
    password: Option<String>,
    isolation: Option<IsolationLevel>,
    catalog: Option<String>,
    schema: Option<String>,
    read_only: Option<bool>,
    type_map: Option<TypeMap>,
    holdability: Option<Holdability>,
    sharding_key: Option<ShardingKey>,
    super_sharding_key: Option<ShardingKey>,
    network_timeout: u32,
    config_id: u32,
    #[serde(skip)]
    defaults: Arc<DriverDefaults>,
    mutable: bool,
    hash: u64,
}

fn identity_hash(user: Option<&str>, password: Option<&str>, config_id: u32) -> u64 {
    let mut h = DefaultHasher::new();
    user.hash(&mut h);
    password.hash(&mut h);
    config_id.hash(&mut h);
    h.finish()
}

/// Unset matches set when the set value equals either side's default.
fn field_matches<T: PartialEq>(a: Option<&T>, b: Option<&T>, da: Option<&T>, db: Option<&T>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x == y,
        (None, Some(v)) | (Some(v), None) => da == Some(v) || db == Some(v),
    }
}

fn timeout(ms: u32) -> Option<u32> {
    (ms != 0).then_some(ms)
}

macro_rules! setter {
    ($set:ident, $with:ident, $field:ident, $ty:ty) => {
        pub fn $set(&mut self, value: Option<$ty>) -> Result<(), DbError> {
            self.check_mutable()?;
            self.$field = value;
            Ok(())
        }

        pub fn $with(&self, value: Option<$ty>) -> ConnectionRequestInfo {
            let mut copy = self.mutable_copy();
            copy.$field = value;
            copy
        }
    };
}

impl ConnectionRequestInfo {
    pub fn new(user: Option<&str>, password: Option<&str>, config_id: u32) -> Self {
        Self {
            user: user.map(str::to_string),
            password: password.map(str::to_string),
            isolation: None,
            catalog: None,
            schema: None,
            read_only: None,
            type_map: None,
            holdability: None,
            sharding_key: None,
            super_sharding_key: None,
            network_timeout: 0,
            config_id,
            defaults: Arc::new(DriverDefaults::default()),
            mutable: true,
            hash: identity_hash(user, password, config_id),
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn read_only(&self) -> Option<bool> {
        self.read_only
    }

    pub fn type_map(&self) -> Option<&TypeMap> {
        self.type_map.as_ref()
    }

    pub fn holdability(&self) -> Option<Holdability> {
        self.holdability
    }

    pub fn sharding_key(&self) -> Option<&ShardingKey> {
        self.sharding_key.as_ref()
    }

    pub fn super_sharding_key(&self) -> Option<&ShardingKey> {
        self.super_sharding_key.as_ref()
    }

    pub fn network_timeout(&self) -> u32 {
        self.network_timeout
    }

    pub fn config_id(&self) -> u32 {
        self.config_id
    }

    pub fn defaults(&self) -> &DriverDefaults {
        &self.defaults
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Bucket hash. Only covers the identity fields, which never change on
    /// a frozen descriptor.
    pub fn descriptor_hash(&self) -> u64 {
        self.hash
    }

    pub fn freeze(&mut self) {
        self.mutable = false;
    }

    pub fn frozen(mut self) -> Self {
        self.mutable = false;
        self
    }

    pub fn mutable_copy(&self) -> ConnectionRequestInfo {
        let mut copy = self.clone();
        copy.mutable = true;
        copy
    }

    fn check_mutable(&self) -> Result<(), DbError> {
        if self.mutable {
            Ok(())
        } else {
            Err(DbError::DescriptorImmutable)
        }
    }

    setter!(set_isolation, with_isolation, isolation, IsolationLevel);
    setter!(set_catalog, with_catalog, catalog, String);
    setter!(set_schema, with_schema, schema, String);
    setter!(set_read_only, with_read_only, read_only, bool);
    setter!(set_type_map, with_type_map, type_map, TypeMap);
    setter!(set_holdability, with_holdability, holdability, Holdability);
    setter!(set_sharding_key, with_sharding_key, sharding_key, ShardingKey);
    setter!(
        set_super_sharding_key,
        with_super_sharding_key,
        super_sharding_key,
        ShardingKey
    );

    pub fn set_network_timeout(&mut self, millis: u32) -> Result<(), DbError> {
        self.check_mutable()?;
        self.network_timeout = millis;
        Ok(())
    }

    pub fn with_network_timeout(&self, millis: u32) -> ConnectionRequestInfo {
        let mut copy = self.mutable_copy();
        copy.network_timeout = millis;
        copy
    }

    pub fn set_defaults(&mut self, defaults: DriverDefaults) -> Result<(), DbError> {
        self.check_mutable()?;
        self.defaults = Arc::new(defaults);
        Ok(())
    }

    pub fn with_defaults(&self, defaults: DriverDefaults) -> ConnectionRequestInfo {
        let mut copy = self.mutable_copy();
        copy.defaults = Arc::new(defaults);
        copy
    }

    /// Whether any property that can be pushed to a live connection is set.
    pub fn has_reconfigurable_properties(&self, include_isolation: bool) -> bool {
        (include_isolation && self.isolation.is_some())
            || self.catalog.is_some()
            || self.schema.is_some()
            || self.read_only.is_some()
            || self.type_map.is_some()
            || self.holdability.is_some()
            || self.network_timeout != 0
    }

    /// Fields that can never be changed on an open connection.
    pub fn is_reconfigurable(&self, other: &ConnectionRequestInfo) -> bool {
        self.hash == other.hash
            && self.config_id == other.config_id
            && self.user == other.user
            && self.password == other.password
            && self.sharding_key == other.sharding_key
            && self.super_sharding_key == other.super_sharding_key
    }

    /// A pooled connection created for `self` serves `other` as is.
    ///
    /// With `isolation_switchable` the isolation level is left out of the
    /// comparison since it can be switched per request.
    pub fn matches(&self, other: &ConnectionRequestInfo, isolation_switchable: bool) -> bool {
        if !self.is_reconfigurable(other) {
            return false;
        }
        if isolation_switchable
            && !self.has_reconfigurable_properties(false)
            && !other.has_reconfigurable_properties(false)
        {
            return true;
        }
        let (da, db) = (&*self.defaults, &*other.defaults);
        (isolation_switchable
            || field_matches(
                self.isolation.as_ref(),
                other.isolation.as_ref(),
                da.isolation.as_ref(),
                db.isolation.as_ref(),
            ))
            && field_matches(
                self.catalog.as_ref(),
                other.catalog.as_ref(),
                da.catalog.as_ref(),
                db.catalog.as_ref(),
            )
            && field_matches(
                self.schema.as_ref(),
                other.schema.as_ref(),
                da.schema.as_ref(),
                db.schema.as_ref(),
            )
            && field_matches(
                self.read_only.as_ref(),
                other.read_only.as_ref(),
                da.read_only.as_ref(),
                db.read_only.as_ref(),
            )
            && field_matches(
                self.type_map.as_ref(),
                other.type_map.as_ref(),
                da.type_map.as_ref(),
                db.type_map.as_ref(),
            )
            && field_matches(
                self.holdability.as_ref(),
                other.holdability.as_ref(),
                da.holdability.as_ref(),
                db.holdability.as_ref(),
            )
            && field_matches(
                timeout(self.network_timeout).as_ref(),
                timeout(other.network_timeout).as_ref(),
                timeout(da.network_timeout).as_ref(),
                timeout(db.network_timeout).as_ref(),
            )
    }
}

impl PartialEq for ConnectionRequestInfo {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other, false)
    }
}

impl Hash for ConnectionRequestInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}
