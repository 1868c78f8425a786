//! Process-unique ephemeral host ports.
//!
//! Containers don't bind their published ports until they actually start,
//! so the OS can hand the same "free" port to two instances created in
//! quick succession. The allocator remembers every port it has ever leased
//! and never returns one twice.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::{Error, Result};

/// Bind attempts per acquisition before giving up.
pub const MAX_ATTEMPTS: usize = 10;

/// A port handed out by [`PortAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortLease {
    /// Host port number.
    pub port: u16,
    /// Allocation order within this allocator, starting at 1.
    pub sequence: u64,
}

/// Hands out loopback ports that have never been leased before.
#[derive(Debug, Default)]
pub struct PortAllocator {
    allocated: Mutex<HashSet<u16>>,
    sequence: AtomicU64,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease a fresh ephemeral port.
    ///
    /// Exclusivity is process-local only: an unrelated process may still
    /// bind the port between now and the instance starting.
    pub fn acquire(&self) -> Result<PortLease> {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        self.acquire_locked(&mut allocated)
    }

    /// Lease `count` distinct fresh ports under a single lock acquisition.
    pub fn acquire_many(&self, count: usize) -> Result<Vec<PortLease>> {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        (0..count)
            .map(|_| self.acquire_locked(&mut allocated))
            .collect()
    }

    /// Whether `port` has been leased by this allocator.
    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }

    /// Number of ports leased so far.
    pub fn allocated_count(&self) -> usize {
        self.allocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn acquire_locked(&self, allocated: &mut HashSet<u16>) -> Result<PortLease> {
        // Rejected listeners stay bound until we return, so the OS can't
        // hand back the same port on the next attempt.
        let mut held = Vec::with_capacity(MAX_ATTEMPTS);

        for attempt in 1..=MAX_ATTEMPTS {
            let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
            let port = listener.local_addr()?.port();

            if allocated.insert(port) {
                let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(port, attempt, "leased host port");
                return Ok(PortLease { port, sequence });
            }

            tracing::trace!(port, attempt, "port already leased, retrying");
            held.push(listener);
        }

        Err(Error::PortExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }
}
