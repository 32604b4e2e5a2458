//! Transport boundary to the physical adapter layer.
//!
//! The core depends only on this narrow contract, never on adapter-vendor
//! specifics. Native batched exchange is an optional capability: a transport
//! either implements [`Transport::exchange_batch`] or the sequence runner
//! emulates batching by pipelining single exchanges.

use std::time::Duration;

use async_trait::async_trait;

use crate::codec::frame::WireFrame;
use crate::core::error::{Error, Result};

/// Physical adapter contract.
///
/// Implementations perform raw frame exchange only. Timeout and retry policy
/// belong to the connection layer; a transport reports a missed reply as
/// [`Error::Timeout`] and adapter faults as [`Error::Transport`], nothing
/// more.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identifier of the physical adapter (interface name, channel).
    ///
    /// The session registry uses this to enforce one open session per
    /// adapter.
    fn adapter_id(&self) -> &str;

    /// Acquire the adapter and negotiate the bit rate.
    async fn open(&mut self, bit_rate: u32) -> Result<()>;

    /// Release the adapter.
    async fn close(&mut self) -> Result<()>;

    /// One request/reply round trip with a bounded wait.
    ///
    /// Returns `Ok(Some(reply))` for a monitor reply, `Ok(None)` when the
    /// frame was transmitted and no reply is expected (control requests),
    /// [`Error::Timeout`] when no reply arrives within `timeout`, and
    /// [`Error::Transport`] for adapter faults.
    async fn exchange(&mut self, frame: &WireFrame, timeout: Duration)
        -> Result<Option<WireFrame>>;

    /// Whether [`Transport::exchange_batch`] is implemented natively.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Hand an entire batch to the adapter in one call.
    ///
    /// The result has the same length and order as `frames`, each element
    /// independently a reply or a fault. The default implementation reports
    /// the capability as missing; callers check [`Transport::supports_batch`]
    /// first.
    async fn exchange_batch(
        &mut self,
        frames: &[WireFrame],
        timeout: Duration,
    ) -> Result<Vec<Result<Option<WireFrame>>>> {
        let _ = (frames, timeout);
        Err(Error::Transport(
            "native batch exchange not supported by this adapter".into(),
        ))
    }

    /// Discard any stale reply sitting in the adapter's receive path.
    ///
    /// Called between a timed-out exchange and the next transmission so a
    /// late reply is never handed to the wrong caller.
    async fn drain(&mut self) -> Result<()>;
}
