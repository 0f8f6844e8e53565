//! Bounded pool of transport endpoint ports.
//!
//! Ports are the scarce resource bounding concurrent outstanding bus
//! commands per node: every command proxy holds exactly one reserved
//! port for its full lifetime and returns it on drop.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::BusError;

/// How long `acquire` waits for a free port before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// FIFO pool of endpoint ports in an inclusive range.
pub struct PortPool {
    free: Mutex<VecDeque<u16>>,
    available: Semaphore,
    lo: u16,
    hi: u16,
    self_ref: OnceLock<Weak<PortPool>>,
}

impl PortPool {
    /// Creates a pool over the inclusive range `[lo, hi]`.
    pub fn new(lo: u16, hi: u16) -> Result<Arc<Self>, BusError> {
        if lo > hi {
            return Err(BusError::Lifecycle(format!(
                "invalid port range [{}..{}]",
                lo, hi
            )));
        }
        let count = (hi - lo) as usize + 1;
        tracing::info!(lo, hi, "port pool initialised");
        let pool = Arc::new(Self {
            free: Mutex::new((lo..=hi).collect()),
            available: Semaphore::new(count),
            lo,
            hi,
            self_ref: OnceLock::new(),
        });
        let _ = pool.self_ref.set(Arc::downgrade(&pool));
        Ok(pool)
    }

    /// Waits for a free port, FIFO-fair across waiters. Fails with
    /// [`BusError::PortExhausted`] after a bounded wait.
    pub async fn acquire(&self) -> Result<PortGuard, BusError> {
        let permit = tokio::time::timeout(ACQUIRE_TIMEOUT, self.available.acquire())
            .await
            .map_err(|_| BusError::PortExhausted {
                lo: self.lo,
                hi: self.hi,
            })?
            .expect("port pool semaphore is never closed");
        permit.forget();
        let port = self
            .free
            .lock()
            .pop_front()
            .expect("semaphore permit implies a free port");
        tracing::debug!(port, "port acquired");
        Ok(PortGuard {
            port,
            pool: self
                .self_ref
                .get()
                .expect("pools are always built through new()")
                .clone(),
        })
    }

    /// Number of ports currently free.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn range(&self) -> (u16, u16) {
        (self.lo, self.hi)
    }

    fn release(&self, port: u16) {
        let mut free = self.free.lock();
        if free.contains(&port) {
            // Releasing an unowned port is a programmer error; keep the
            // pool consistent instead of double-counting it.
            tracing::error!(port, "double release of endpoint port ignored");
            return;
        }
        free.push_back(port);
        drop(free);
        self.available.add_permits(1);
        tracing::debug!(port, "port released");
    }
}

/// RAII reservation of one port; returns it to the pool on drop.
///
/// Holds only a weak pool reference so a guard outliving its pool does
/// not keep the pool alive.
pub struct PortGuard {
    port: u16,
    pool: Weak<PortPool>,
}

impl PortGuard {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.port);
        }
    }
}

impl std::fmt::Debug for PortGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortGuard").field("port", &self.port).finish()
    }
}
