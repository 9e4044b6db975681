pub mod events;
pub mod handle;
pub mod state;
pub mod xa;

mod connection;

use std::sync::{Arc, Mutex, MutexGuard};

pub use connection::{ConnectionContext, ConnectionDump, ConnectionProperties, ManagedConnection};

/// 池与句柄共享的托管连接
pub type SharedConnection = Arc<Mutex<ManagedConnection>>;

/// Locks a managed connection. A panic on another thread does not make the
/// connection unusable for cleanup, so poisoning is ignored.
pub fn lock(conn: &SharedConnection) -> MutexGuard<'_, ManagedConnection> {
    conn.lock().unwrap_or_else(|e| e.into_inner())
}
