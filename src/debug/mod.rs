//! Debugger plumbing
//!
//! ```text
//! rhai debugger callback ─▶ DebugHook ─▶ DebugSession ─▶ dyn DebugChannel
//!                                                          (DebugTransport: TCP)
//! ```
//!
//! The transport is a transparent byte pipe to a single remote client. The
//! session is the engine-side driver that talks over it; it only needs the
//! three [`DebugChannel`] operations, so the transport is handed over as a
//! trait object when the debugger is attached.

pub mod port;
pub mod session;
pub mod transport;

pub use port::DebugPortAllocator;
pub use session::{DebugHook, DebugSession, SessionCommand};
pub use transport::{DebugTransport, TransportError};

/// Byte-level capability the debugger session drives
///
/// All three operations report failure as "nothing": a broken connection is
/// indistinguishable from an idle one to the caller.
pub trait DebugChannel: Send {
    /// Read up to `buf.len()` bytes; 0 means no data / connection gone.
    fn read(
        &mut self,
        buf: &mut [u8],
    ) -> usize;

    /// Write up to `buf.len()` bytes; 0 means the connection is gone.
    fn write(
        &mut self,
        buf: &[u8],
    ) -> usize;

    /// 1 if a read would not block, 0 otherwise. Never blocks.
    fn peek(&mut self) -> usize;
}
