//! Port allocation for tenant backends
//!
//! Ports come from a half-open range `[start, end)` and are never handed out
//! twice during the lifetime of the process, even after the backend holding
//! one has exited. Two strategies are supported:
//!
//! - `counter`: issue the next integer in range, without looking at the OS
//! - `bind`: walk forward from the last issued port, binding and releasing
//!   each candidate until one is free at OS level
//!
//! Both draw from a [`ResourcePool`] whose factory is the strategy; nothing is
//! ever put back, which is what keeps ports from being recycled.

use crate::resource_pool::ResourcePool;
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortStrategy {
    /// Monotonic counter, caller verifies bindability (default)
    #[default]
    Counter,
    /// Bind-and-release check of successive ports
    Bind,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no more ports available in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
}

pub struct PortAllocator {
    ports: ResourcePool<u16>,
    start: u16,
    end: u16,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16, strategy: PortStrategy) -> Self {
        // Next candidate. Shared with the factory so allocation is serialized
        // by a single lock regardless of how many callers race.
        let next = Arc::new(Mutex::new(start));

        let factory = move || -> Option<u16> {
            let mut next = next.lock();
            while *next < end {
                let candidate = *next;
                *next += 1;
                match strategy {
                    PortStrategy::Counter => return Some(candidate),
                    PortStrategy::Bind => {
                        if is_bindable(candidate) {
                            return Some(candidate);
                        }
                        debug!(port = candidate, "Port in use, trying next");
                    }
                }
            }
            None
        };

        Self {
            ports: ResourcePool::new(0, factory),
            start,
            end,
        }
    }

    /// Allocate the next unused port
    pub fn allocate_port(&self) -> Result<u16, PortError> {
        match self.ports.get() {
            Some(port) => {
                debug!(port, "Allocated port");
                Ok(port)
            }
            None => {
                warn!(start = self.start, end = self.end, "Port range exhausted");
                Err(PortError::Exhausted {
                    start: self.start,
                    end: self.end,
                })
            }
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
