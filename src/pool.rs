//! Bounded pool of wire sessions.
//!
//! Sessions are stateful and single-threaded, so the pool hands out
//! exclusive checkouts: last-in-first-out from a free list, creating new
//! sessions while under capacity, and lending a transient "overflow"
//! session (closed on return) once the pool is full. The free-list mutex is
//! only held to pop or push — never across a wire round-trip.
//!
//! Checkin never validates (too costly per operation); a session is trusted
//! until its first failing operation, at which point it is closed and its
//! slot freed so the next checkout creates a replacement. Explicit liveness
//! echoes are available through [`ConnPool::check_health`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::config::FolioConfig;
use crate::error::{Error, Result};
use crate::wire::WireClient;

struct PoolState {
    free: Vec<WireClient>,
    /// Count of pooled sessions alive or checked out (overflow excluded).
    live: usize,
}

enum Checkout {
    /// Popped from the free list.
    Reused(WireClient),
    /// A capacity slot was claimed; the session is opened outside the lock.
    Claimed,
    /// Pool at capacity; lend a transient session closed on return.
    Overflow,
}

/// Bounded pool of [`WireClient`]s for one endpoint.
pub struct ConnPool {
    config: Arc<FolioConfig>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
    errors: AtomicU64,
}

impl ConnPool {
    /// Creates an empty pool; sessions are opened lazily on first checkout.
    pub fn new(config: Arc<FolioConfig>) -> Self {
        ConnPool {
            config,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                live: 0,
            }),
            closed: AtomicBool::new(false),
            errors: AtomicU64::new(0),
        }
    }

    /// Checks out a session, runs `f`, and returns the session to the pool.
    ///
    /// On failure the session is closed, the error counter is bumped, and
    /// the slot is released so the next checkout opens a replacement.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut WireClient) -> Result<T>) -> Result<T> {
        let (mut client, overflow) = self.checkout()?;

        match f(&mut client) {
            Ok(value) => {
                self.checkin(client, overflow);
                Ok(value)
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                client.close();
                if !overflow {
                    self.release_slot();
                }
                Err(e)
            }
        }
    }

    fn checkout(&self) -> Result<(WireClient, bool)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let slot = {
            let mut state = self.state.lock().expect("pool mutex poisoned");
            if let Some(client) = state.free.pop() {
                Checkout::Reused(client)
            } else if state.live < self.config.pool_size {
                // Claim the slot before connecting so concurrent checkouts
                // cannot overshoot capacity.
                state.live += 1;
                Checkout::Claimed
            } else {
                Checkout::Overflow
            }
        };

        match slot {
            Checkout::Reused(client) => Ok((client, false)),
            Checkout::Claimed => match WireClient::open(&self.config) {
                Ok(client) => Ok((client, false)),
                Err(e) => {
                    self.release_slot();
                    Err(e)
                }
            },
            Checkout::Overflow => Ok((WireClient::open(&self.config)?, true)),
        }
    }

    fn checkin(&self, client: WireClient, overflow: bool) {
        if overflow {
            client.close();
            return;
        }
        if client.is_poisoned() || self.closed.load(Ordering::Acquire) {
            client.close();
            self.release_slot();
            return;
        }
        let mut state = self.state.lock().expect("pool mutex poisoned");
        state.free.push(client);
    }

    fn release_slot(&self) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        state.live = state.live.saturating_sub(1);
    }

    /// Issues a liveness echo on every free session; any non-PONG reply or
    /// error closes the session and opens a replacement.
    ///
    /// Returns how many sessions were replaced.
    pub fn check_health(&self) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let free = {
            let mut state = self.state.lock().expect("pool mutex poisoned");
            std::mem::take(&mut state.free)
        };

        let mut healthy = Vec::with_capacity(free.len());
        let mut replaced = 0;
        for mut client in free {
            match client.ping() {
                Ok(true) => healthy.push(client),
                _ => {
                    client.close();
                    replaced += 1;
                    match WireClient::open(&self.config) {
                        Ok(fresh) => healthy.push(fresh),
                        Err(e) => {
                            warn!(
                                pool = %self.config.name,
                                error = %e,
                                "failed to replace unhealthy session"
                            );
                            self.release_slot();
                        }
                    }
                }
            }
        }

        let mut state = self.state.lock().expect("pool mutex poisoned");
        state.free.extend(healthy);
        Ok(replaced)
    }

    /// Total operations that failed on a pooled session.
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Closes the pool: future checkouts fail with [`Error::PoolClosed`],
    /// free sessions are closed now, and checked-out sessions are closed as
    /// they return.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let free = {
            let mut state = self.state.lock().expect("pool mutex poisoned");
            std::mem::take(&mut state.free)
        };
        for client in free {
            client.close();
        }
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("pool mutex poisoned");
        f.debug_struct("ConnPool")
            .field("endpoint", &self.config.endpoint)
            .field("free", &state.free.len())
            .field("live", &state.live)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
