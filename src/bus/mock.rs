//! Scripted mock transport for tests.
//!
//! Replies are queued ahead of time and popped one per exchange; with no
//! script queued, a monitor request echoes its own frame id as the reply and
//! a control request acks. The shared [`MockState`] records every
//! transmitted frame and the send/resolve order, so tests can assert wire
//! ordering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bus::transport::Transport;
use crate::codec::frame::WireFrame;
use crate::core::error::{Error, Result};
use crate::core::transaction::Direction;

/// One pre-scripted exchange outcome.
pub(crate) enum ScriptedReply {
    /// Monitor reply with these payload bytes.
    Reply(Vec<u8>),
    /// Transmitted, no reply (control ack).
    Ack,
    /// No reply within the deadline.
    Timeout,
    /// Adapter-level fault.
    Fault(&'static str),
}

/// Wire-order record: each exchange is Sent, then Resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WireEvent {
    Sent(u32),
    Resolved(u32),
}

/// State shared between a [`MockTransport`] and the test asserting on it.
#[derive(Default)]
pub(crate) struct MockState {
    replies: parking_lot::Mutex<VecDeque<ScriptedReply>>,
    pub(crate) sent: parking_lot::Mutex<Vec<WireFrame>>,
    pub(crate) events: parking_lot::Mutex<Vec<WireEvent>>,
    pub(crate) exchange_count: AtomicU32,
    pub(crate) drain_count: AtomicU32,
    latency: parking_lot::Mutex<Option<Duration>>,
}

impl MockState {
    pub(crate) fn push_reply(&self, bytes: Vec<u8>) {
        self.replies.lock().push_back(ScriptedReply::Reply(bytes));
    }

    pub(crate) fn push_ack(&self) {
        self.replies.lock().push_back(ScriptedReply::Ack);
    }

    pub(crate) fn push_timeout(&self) {
        self.replies.lock().push_back(ScriptedReply::Timeout);
    }

    pub(crate) fn push_fault(&self, msg: &'static str) {
        self.replies.lock().push_back(ScriptedReply::Fault(msg));
    }

    /// Artificial per-exchange latency, for interleaving tests.
    pub(crate) fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub(crate) fn sent_ids(&self) -> Vec<u32> {
        self.sent.lock().iter().map(|f| f.id).collect()
    }
}

/// Transport test double bound to a shared [`MockState`].
pub(crate) struct MockTransport {
    adapter: String,
    state: Arc<MockState>,
    batch: bool,
    open: bool,
}

impl MockTransport {
    /// Mock without native batch support.
    pub(crate) fn new(adapter: &str) -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        (
            Self {
                adapter: adapter.to_string(),
                state: Arc::clone(&state),
                batch: false,
                open: false,
            },
            state,
        )
    }

    /// Mock advertising native batch support.
    pub(crate) fn with_batch(adapter: &str) -> (Self, Arc<MockState>) {
        let (mut transport, state) = Self::new(adapter);
        transport.batch = true;
        (transport, state)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn adapter_id(&self) -> &str {
        &self.adapter
    }

    async fn open(&mut self, _bit_rate: u32) -> Result<()> {
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    async fn exchange(
        &mut self,
        frame: &WireFrame,
        timeout: Duration,
    ) -> Result<Option<WireFrame>> {
        if !self.open {
            return Err(Error::Transport("adapter not open".into()));
        }
        self.state.exchange_count.fetch_add(1, Ordering::SeqCst);
        self.state.sent.lock().push(frame.clone());
        self.state.events.lock().push(WireEvent::Sent(frame.id));

        let latency = *self.state.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self.state.replies.lock().pop_front();
        let result = match scripted {
            Some(ScriptedReply::Reply(bytes)) => Ok(Some(WireFrame {
                id: frame.id,
                direction: Direction::Monitor,
                data: bytes,
            })),
            Some(ScriptedReply::Ack) => Ok(None),
            Some(ScriptedReply::Timeout) => Err(Error::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Some(ScriptedReply::Fault(msg)) => Err(Error::Transport(msg.into())),
            None => match frame.direction {
                // Unscripted monitor: echo the frame id so ordering tests
                // get a deterministic, decodable reply.
                Direction::Monitor => Ok(Some(WireFrame {
                    id: frame.id,
                    direction: Direction::Monitor,
                    data: frame.id.to_be_bytes().to_vec(),
                })),
                Direction::Control => Ok(None),
            },
        };
        self.state.events.lock().push(WireEvent::Resolved(frame.id));
        result
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn exchange_batch(
        &mut self,
        frames: &[WireFrame],
        timeout: Duration,
    ) -> Result<Vec<Result<Option<WireFrame>>>> {
        if !self.batch {
            return Err(Error::Transport(
                "native batch exchange not supported by this adapter".into(),
            ));
        }
        let mut out = Vec::with_capacity(frames.len());
        for frame in frames {
            out.push(self.exchange(frame, timeout).await);
        }
        Ok(out)
    }

    async fn drain(&mut self) -> Result<()> {
        self.state.drain_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
