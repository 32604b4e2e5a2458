//! Connection sessions: one open session per physical adapter.
//!
//! A [`Session`] is the process-wide handle to one adapter. All wire activity
//! goes through a single async mutex, so concurrent callers sharing a session
//! are queued rather than interleaved - the bus protocol has no
//! transaction-id multiplexing. Sessions on distinct adapters are fully
//! independent.
//!
//! A transport fault latches the session: every subsequent transaction fails
//! fast with [`Error::SessionClosed`] until the caller closes and reopens.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

use crate::codec::frame::WireFrame;
use crate::core::error::{Error, Result};
use crate::core::transaction::Direction;
use crate::bus::transport::Transport;

/// Adapters with an open session anywhere in the process.
static OPEN_ADAPTERS: LazyLock<parking_lot::Mutex<HashSet<String>>> =
    LazyLock::new(|| parking_lot::Mutex::new(HashSet::new()));

/// Session statistics and health, reported by [`Session::diagnostics`].
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    /// Adapter identifier.
    pub adapter: String,
    /// True while the session is open and not latched by a fault.
    pub usable: bool,
    /// Monitor round trips completed.
    pub read_count: u64,
    /// Control frames transmitted.
    pub write_count: u64,
    /// Failed exchanges (timeouts and faults).
    pub error_count: u64,
    /// Most recent error text, if any.
    pub last_error: Option<String>,
    /// Adapter-specific details.
    pub extra: serde_json::Value,
}

struct SessionInner {
    adapter_id: String,
    bit_rate: u32,
    transport: Mutex<Box<dyn Transport>>,
    closed: AtomicBool,
    fatal: AtomicBool,
    needs_drain: AtomicBool,
    /// True while this session owns the registry entry for its adapter.
    /// Cleared on close so a successor session's entry is never removed.
    registered: AtomicBool,
    read_count: AtomicU64,
    write_count: AtomicU64,
    error_count: AtomicU64,
    last_error: parking_lot::Mutex<Option<String>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.registered.swap(false, Ordering::SeqCst) {
            OPEN_ADAPTERS.lock().remove(&self.adapter_id);
        }
    }
}

/// Open handle to one physical adapter.
///
/// Cheap to clone; all clones share the same underlying adapter lock and
/// fault latch.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Acquire the adapter and negotiate the bit rate.
    ///
    /// Fails with [`Error::Config`] if another session is already open on
    /// the same adapter anywhere in the process.
    pub async fn open(mut transport: Box<dyn Transport>, bit_rate: u32) -> Result<Session> {
        let adapter_id = transport.adapter_id().to_string();
        if !OPEN_ADAPTERS.lock().insert(adapter_id.clone()) {
            return Err(Error::Config(format!(
                "adapter {} already has an open session",
                adapter_id
            )));
        }
        if let Err(err) = transport.open(bit_rate).await {
            OPEN_ADAPTERS.lock().remove(&adapter_id);
            return Err(err);
        }
        tracing::debug!(adapter = %adapter_id, bit_rate, "session opened");
        Ok(Session {
            inner: Arc::new(SessionInner {
                adapter_id,
                bit_rate,
                transport: Mutex::new(transport),
                closed: AtomicBool::new(false),
                fatal: AtomicBool::new(false),
                needs_drain: AtomicBool::new(false),
                registered: AtomicBool::new(true),
                read_count: AtomicU64::new(0),
                write_count: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                last_error: parking_lot::Mutex::new(None),
            }),
        })
    }

    /// Release the adapter. The session is unusable afterwards.
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut transport = self.inner.transport.lock().await;
        let result = transport.close().await;
        if self.inner.registered.swap(false, Ordering::SeqCst) {
            OPEN_ADAPTERS.lock().remove(&self.inner.adapter_id);
        }
        tracing::debug!(adapter = %self.inner.adapter_id, "session closed");
        result
    }

    /// Adapter identifier this session is bound to.
    pub fn adapter_id(&self) -> &str {
        &self.inner.adapter_id
    }

    /// Negotiated bit rate.
    pub fn bit_rate(&self) -> u32 {
        self.inner.bit_rate
    }

    /// True while the session is open and not latched by a transport fault.
    pub fn is_usable(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst) && !self.inner.fatal.load(Ordering::SeqCst)
    }

    /// Session statistics and health.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            adapter: self.inner.adapter_id.clone(),
            usable: self.is_usable(),
            read_count: self.inner.read_count.load(Ordering::Relaxed),
            write_count: self.inner.write_count.load(Ordering::Relaxed),
            error_count: self.inner.error_count.load(Ordering::Relaxed),
            last_error: self.inner.last_error.lock().clone(),
            extra: serde_json::json!({
                "bit_rate": self.inner.bit_rate,
                "fault_latched": self.inner.fatal.load(Ordering::SeqCst),
            }),
        }
    }

    /// Acquire exclusive use of the transport.
    ///
    /// Fails fast with [`Error::SessionClosed`] when the session is closed
    /// or latched by a prior fault. Callers holding the guard own the wire
    /// until they drop it; the sequence runner holds it for a whole batch.
    pub(crate) async fn lock(&self) -> Result<TransportGuard<'_>> {
        self.usable_or_err()?;
        let transport = self.inner.transport.lock().await;
        // The latch may have flipped while we waited on the lock.
        self.usable_or_err()?;
        Ok(TransportGuard {
            transport,
            inner: &self.inner,
        })
    }

    fn usable_or_err(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed(format!(
                "session on {} is closed",
                self.inner.adapter_id
            )));
        }
        if self.inner.fatal.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed(format!(
                "session on {} latched by a transport fault; close and reopen",
                self.inner.adapter_id
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("adapter", &self.inner.adapter_id)
            .field("usable", &self.is_usable())
            .finish()
    }
}

/// Exclusive access to the session's transport.
///
/// All exchanges funnel through here: stale-reply draining, the fault latch,
/// and the statistics counters live at this level so both single-transaction
/// and sequence paths behave identically.
pub(crate) struct TransportGuard<'a> {
    transport: MutexGuard<'a, Box<dyn Transport>>,
    inner: &'a SessionInner,
}

impl std::fmt::Debug for TransportGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportGuard").finish_non_exhaustive()
    }
}

impl TransportGuard<'_> {
    /// Re-check the latch between sequence items.
    pub(crate) fn usable(&self) -> Result<()> {
        if self.inner.fatal.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed(format!(
                "session on {} latched by a transport fault; close and reopen",
                self.inner.adapter_id
            )));
        }
        Ok(())
    }

    pub(crate) fn supports_batch(&self) -> bool {
        self.transport.supports_batch()
    }

    /// One physical exchange, with drain-before-send after a prior timeout.
    pub(crate) async fn exchange(
        &mut self,
        frame: &WireFrame,
        timeout: Duration,
    ) -> Result<Option<WireFrame>> {
        self.usable()?;
        self.drain_if_needed().await?;
        match self.transport.exchange(frame, timeout).await {
            Ok(reply) => {
                self.count_ok(frame.direction);
                Ok(reply)
            }
            Err(err) => Err(self.record_failure(err)),
        }
    }

    /// Hand a whole batch to the transport in one call.
    pub(crate) async fn exchange_batch(
        &mut self,
        frames: &[WireFrame],
        timeout: Duration,
    ) -> Result<Vec<Result<Option<WireFrame>>>> {
        self.usable()?;
        self.drain_if_needed().await?;
        let per_item = match self.transport.exchange_batch(frames, timeout).await {
            Ok(per_item) => per_item,
            Err(err) => return Err(self.record_failure(err)),
        };
        for (frame, item) in frames.iter().zip(&per_item) {
            match item {
                Ok(_) => self.count_ok(frame.direction),
                Err(err) => {
                    self.note_error(err);
                    match err {
                        Error::Timeout { .. } => {
                            self.inner.needs_drain.store(true, Ordering::SeqCst);
                        }
                        Error::Transport(msg) => self.latch_fatal(msg),
                        _ => {}
                    }
                }
            }
        }
        Ok(per_item)
    }

    async fn drain_if_needed(&mut self) -> Result<()> {
        if self.inner.needs_drain.swap(false, Ordering::SeqCst) {
            tracing::debug!(
                adapter = %self.inner.adapter_id,
                "draining stale replies after timeout"
            );
            if let Err(err) = self.transport.drain().await {
                return Err(self.record_failure(err));
            }
        }
        Ok(())
    }

    fn count_ok(&self, direction: Direction) {
        match direction {
            Direction::Monitor => self.inner.read_count.fetch_add(1, Ordering::Relaxed),
            Direction::Control => self.inner.write_count.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn note_error(&self, err: &Error) {
        self.inner.error_count.fetch_add(1, Ordering::Relaxed);
        *self.inner.last_error.lock() = Some(err.to_string());
    }

    fn latch_fatal(&self, msg: &str) {
        self.inner.fatal.store(true, Ordering::SeqCst);
        tracing::error!(
            adapter = %self.inner.adapter_id,
            error = %msg,
            "transport fault; session latched"
        );
    }

    /// Record an exchange failure, arming the drain or the fault latch.
    fn record_failure(&self, err: Error) -> Error {
        self.note_error(&err);
        match &err {
            Error::Timeout { .. } => {
                // A late reply may still arrive; discard it before the next
                // frame goes out.
                self.inner.needs_drain.store(true, Ordering::SeqCst);
            }
            Error::Transport(msg) => self.latch_fatal(msg),
            _ => {}
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockTransport;

    #[tokio::test]
    async fn test_second_open_on_same_adapter_fails() {
        let (first, _) = MockTransport::new("can-a");
        let (second, _) = MockTransport::new("can-a");
        let session = Session::open(Box::new(first), 1_000_000).await.unwrap();
        let err = Session::open(Box::new(second), 1_000_000)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // Closing releases the adapter for a fresh session.
        session.close().await.unwrap();
        let (third, _) = MockTransport::new("can-a");
        assert!(Session::open(Box::new(third), 1_000_000).await.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_adapters_are_independent() {
        let (a, _) = MockTransport::new("can-a");
        let (b, _) = MockTransport::new("can-b");
        let sa = Session::open(Box::new(a), 1_000_000).await.unwrap();
        let sb = Session::open(Box::new(b), 1_000_000).await.unwrap();
        assert!(sa.is_usable());
        assert!(sb.is_usable());
        sa.close().await.unwrap();
        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_session_releases_adapter() {
        {
            let (t, _) = MockTransport::new("can-drop");
            let _session = Session::open(Box::new(t), 1_000_000).await.unwrap();
        }
        let (t, _) = MockTransport::new("can-drop");
        assert!(Session::open(Box::new(t), 1_000_000).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_session_fails_fast() {
        let (t, _) = MockTransport::new("can-closed");
        let session = Session::open(Box::new(t), 1_000_000).await.unwrap();
        session.close().await.unwrap();
        let err = session.lock().await.unwrap_err();
        assert!(matches!(err, Error::SessionClosed(_)));
    }

    #[tokio::test]
    async fn test_diagnostics_reflect_counters() {
        let (t, state) = MockTransport::new("can-diag");
        state.push_reply(vec![0x01]);
        let session = Session::open(Box::new(t), 250_000).await.unwrap();

        let frame = WireFrame {
            id: 0x0040_0000,
            direction: Direction::Monitor,
            data: vec![],
        };
        let mut guard = session.lock().await.unwrap();
        guard
            .exchange(&frame, Duration::from_millis(50))
            .await
            .unwrap();
        drop(guard);

        let diag = session.diagnostics();
        assert_eq!(diag.read_count, 1);
        assert_eq!(diag.write_count, 0);
        assert_eq!(diag.error_count, 0);
        assert!(diag.usable);
        assert_eq!(diag.extra["bit_rate"], 250_000);
        session.close().await.unwrap();
    }
}
