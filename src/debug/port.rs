//! Debugger port assignment
//!
//! Every engine that asks for a debugger gets `base + n`, where `n` comes
//! from a process-wide counter, so engines on different threads never try
//! to listen on the same port. The counter is never reset.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::util::config::ConfigError;

static SHARED: Lazy<Arc<DebugPortAllocator>> = Lazy::new(|| Arc::new(DebugPortAllocator::new()));

/// Monotonic port offset counter
#[derive(Debug, Default)]
pub struct DebugPortAllocator {
    counter: AtomicU16,
}

impl DebugPortAllocator {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU16::new(0),
        }
    }

    /// The process-wide allocator
    pub fn shared() -> Arc<Self> {
        SHARED.clone()
    }

    /// Next port for an engine whose configured base port is `base`
    ///
    /// Each call consumes one offset, even when the result is out of range.
    pub fn next_port(
        &self,
        base: u16,
    ) -> Result<u16, ConfigError> {
        let offset = self.counter.fetch_add(1, Ordering::AcqRel);
        base.checked_add(offset)
            .ok_or(ConfigError::PortOverflow { base, offset })
    }

    /// Number of offsets handed out so far (wraps at 65536)
    pub fn issued(&self) -> u16 {
        self.counter.load(Ordering::Acquire)
    }
}
