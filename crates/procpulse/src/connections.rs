//! Open connection counting
//!
//! A server hands the reporter something that implements
//! [`ConnectionCounter`]. [`ConnectionTracker`] is the built-in
//! implementation: wrap every accepted socket in a [`ConnectionGuard`] and
//! the tracker always knows how many are still open.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Query for the number of currently open connections
#[async_trait]
pub trait ConnectionCounter: Send + Sync {
    async fn connection_count(&self) -> Result<u64>;
}

/// Counts open connections with drop guards
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    open: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a connection until the returned guard is dropped
    pub fn track(&self) -> ConnectionGuard {
        self.open.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            open: self.open.clone(),
        }
    }

    pub fn open_connections(&self) -> u64 {
        self.open.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ConnectionCounter for ConnectionTracker {
    async fn connection_count(&self) -> Result<u64> {
        Ok(self.open_connections())
    }
}

/// Keeps one connection counted while alive
#[derive(Debug)]
pub struct ConnectionGuard {
    open: Arc<AtomicU64>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::Relaxed);
    }
}
