//! The abstract byte-duplex capability the host protocol client is
//! polymorphic over. See `spec.md` §4.6 — `tcp` and `ble-gatt`
//! implementations are collaborators, not part of this crate.

use crate::error::CoreResult;

/// A reliable, ordered, bidirectional byte stream to the adapter.
///
/// Implementations own their own reconnection policy; this trait only
/// asks for the capability surface [`crate::client::ProtocolClient`]
/// needs: connect, send, a timed receive, and a way to ask what went
/// wrong last.
pub trait Transport: Send {
    /// Establishes the underlying connection.
    fn connect(&mut self) -> CoreResult<()>;

    /// Tears down the connection. Idempotent.
    fn disconnect(&mut self) -> CoreResult<()>;

    /// Whether the transport currently believes itself connected.
    fn is_connected(&self) -> bool;

    /// Sends `bytes`, returning the number written or a [`CoreError::Transport`](crate::error::CoreError::Transport).
    fn send(&mut self, bytes: &[u8]) -> CoreResult<usize>;

    /// Blocks up to `deadline_ms` for inbound bytes.
    ///
    /// Returns an empty `Vec` on a clean timeout (the caller retries);
    /// implementations signal a closed connection through
    /// [`CoreError::Transport`](crate::error::CoreError::Transport), not an empty read.
    fn receive(&mut self, deadline_ms: u64) -> CoreResult<Vec<u8>>;

    /// The last transport-level error observed, if any, for diagnostics.
    fn last_error(&self) -> Option<String>;
}
