use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::channel::connection::BinaryChannelConnection;
use crate::net::peer::PoolKey;

struct PoolInner {
    open: bool,
    connections: FxHashMap<PoolKey, Arc<BinaryChannelConnection>>,
}

/// Registry of the connections that are currently in use, by pool key.
///
/// The pool has its own lifecycle: it accepts connections only between `open()` and `close()`.
///  Closing the pool closes all connections in it.
pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        ConnectionPool {
            inner: Mutex::new(PoolInner {
                open: false,
                connections: FxHashMap::default(),
            }),
        }
    }
}

impl ConnectionPool {
    pub fn new() -> ConnectionPool {
        ConnectionPool::default()
    }

    pub fn open(&self) {
        self.inner.lock().unwrap().open = true;
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    /// Stops accepting connections and closes all pooled connections. The connections are
    ///  closed after releasing the pool's lock.
    pub async fn close(&self) {
        let connections = {
            let mut inner = self.inner.lock().unwrap();
            inner.open = false;
            std::mem::take(&mut inner.connections)
        };

        debug!("closing connection pool with {} connections", connections.len());
        for connection in connections.into_values() {
            connection.close().await;
        }
    }

    pub fn get(&self, key: &PoolKey) -> Option<Arc<BinaryChannelConnection>> {
        self.inner.lock().unwrap().connections.get(key).cloned()
    }

    /// Returns the connection previously registered under the key. If the pool is closed,
    ///  nothing is stored and the connection passed in is returned instead.
    pub fn add(&self, key: PoolKey, connection: Arc<BinaryChannelConnection>) -> Option<Arc<BinaryChannelConnection>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Some(connection);
        }
        inner.connections.insert(key, connection)
    }

    pub fn remove(&self, key: &PoolKey) -> Option<Arc<BinaryChannelConnection>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return None;
        }
        inner.connections.remove(key)
    }

    /// Removes the entry for `key` only if it is `connection` itself, leaving a connection
    ///  that superseded it in place
    pub fn remove_if_same(&self, key: &PoolKey, connection: &BinaryChannelConnection) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return false;
        }
        match inner.connections.get(key) {
            Some(pooled) if std::ptr::eq(Arc::as_ptr(pooled), connection) => {
                inner.connections.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().connections.is_empty()
    }

    pub fn keys(&self) -> Vec<PoolKey> {
        self.inner.lock().unwrap().connections.keys().cloned().collect()
    }
}
