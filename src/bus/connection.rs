//! Bus connections: the request/reply policy layer over a [`Session`].
//!
//! Two interchangeable implementations share one contract:
//!
//! - [`StandardConnection`] issues one physical exchange per transaction.
//!   Portable to any transport.
//! - [`BatchedConnection`] hands an entire sequence to the transport in a
//!   single call when [`Transport::supports_batch`] holds, amortizing
//!   per-call overhead for multi-point sweeps. Without native support it
//!   falls back to the pipelined sequence runner.
//!
//! Both give identical ordering and partial-failure guarantees; swapping one
//! for the other changes only latency. Timeout policy lives here: a missed
//! reply is retried exactly once, then surfaced. Transport faults are never
//! retried - they latch the session.
//!
//! [`Transport::supports_batch`]: crate::bus::transport::Transport::supports_batch

use std::time::Duration;

use async_trait::async_trait;

use crate::bus::sequence;
use crate::bus::session::{Session, TransportGuard};
use crate::codec::frame::{self, WireFrame};
use crate::core::address::{BusAddress, FrameLayout};
use crate::core::error::Error;
use crate::core::transaction::{Sequence, Transaction, TransactionResult};

/// Timeout, retry, and frame-layout policy for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for one physical exchange.
    pub timeout: Duration,
    /// Transparent retries after a timeout. Exactly one by default; never
    /// more, so a dead node is not masked.
    pub retries: u32,
    /// Frame identifier packing.
    pub layout: FrameLayout,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(200),
            retries: 1,
            layout: FrameLayout::default(),
        }
    }
}

/// One bus connection: single transactions and ordered sequences.
///
/// Every call completes or fails before returning; callers always receive a
/// typed value or a typed failure per request, never a silent default.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// The session this connection is bound to.
    fn session(&self) -> &Session;

    /// The active timeout/retry policy.
    fn config(&self) -> &ConnectionConfig;

    /// One complete round trip for a single transaction.
    async fn submit(&self, txn: Transaction) -> TransactionResult;

    /// Like [`BusConnection::submit`], with a caller-imposed deadline
    /// replacing the configured one for this transaction only.
    async fn submit_within(&self, txn: Transaction, timeout: Duration) -> TransactionResult;

    /// Execute an ordered sequence; results match input length and order,
    /// each element independently successful or failed.
    async fn run_sequence(&self, sequence: Sequence) -> Vec<TransactionResult>;

    /// Monitor (read) one address.
    async fn monitor(&self, address: BusAddress) -> TransactionResult {
        self.submit(Transaction::monitor(address)).await
    }

    /// Monitor with a caller-imposed deadline.
    async fn monitor_within(&self, address: BusAddress, timeout: Duration) -> TransactionResult {
        self.submit_within(Transaction::monitor(address), timeout).await
    }

    /// Control (write) one address.
    async fn control(&self, address: BusAddress, payload: Vec<u8>) -> TransactionResult {
        self.submit(Transaction::control(address, payload)).await
    }
}

/// Exchange one frame under the retry policy and decode the reply.
pub(crate) async fn exchange_with_retry(
    guard: &mut TransportGuard<'_>,
    txn: &Transaction,
    wire: &WireFrame,
    timeout: Duration,
    retries: u32,
) -> TransactionResult {
    let mut attempt = 0;
    loop {
        match guard.exchange(wire, timeout).await {
            Ok(reply) => {
                return frame::decode_reply(txn, reply.as_ref().map(|f| f.data.as_slice()))
            }
            Err(err @ Error::Timeout { .. }) => {
                if attempt >= retries {
                    return txn.fail(&err);
                }
                attempt += 1;
                tracing::warn!(
                    address = %txn.address(),
                    attempt,
                    "no reply within deadline, retrying"
                );
            }
            Err(err) => return txn.fail(&err),
        }
    }
}

async fn submit_on(
    session: &Session,
    config: &ConnectionConfig,
    txn: Transaction,
    timeout: Duration,
) -> TransactionResult {
    let wire = match frame::encode(&txn, &config.layout) {
        Ok(wire) => wire,
        Err(err) => return txn.fail(&err),
    };
    let mut guard = match session.lock().await {
        Ok(guard) => guard,
        Err(err) => return txn.fail(&err),
    };
    exchange_with_retry(&mut guard, &txn, &wire, timeout, config.retries).await
}

// ============================================================================
// StandardConnection
// ============================================================================

/// General-purpose connection: one physical exchange per transaction.
pub struct StandardConnection {
    session: Session,
    config: ConnectionConfig,
}

impl StandardConnection {
    /// Bind to a session with the default policy.
    pub fn new(session: Session) -> Self {
        Self::with_config(session, ConnectionConfig::default())
    }

    /// Bind to a session with an explicit policy.
    pub fn with_config(session: Session, config: ConnectionConfig) -> Self {
        Self { session, config }
    }
}

#[async_trait]
impl BusConnection for StandardConnection {
    fn session(&self) -> &Session {
        &self.session
    }

    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn submit(&self, txn: Transaction) -> TransactionResult {
        let timeout = self.config.timeout;
        submit_on(&self.session, &self.config, txn, timeout).await
    }

    async fn submit_within(&self, txn: Transaction, timeout: Duration) -> TransactionResult {
        submit_on(&self.session, &self.config, txn, timeout).await
    }

    async fn run_sequence(&self, sequence: Sequence) -> Vec<TransactionResult> {
        sequence::run(&self.session, &self.config, &sequence).await
    }
}

// ============================================================================
// BatchedConnection
// ============================================================================

/// High-throughput connection: hands whole sequences to the transport when
/// it supports native batching, otherwise pipelines like
/// [`StandardConnection`].
pub struct BatchedConnection {
    session: Session,
    config: ConnectionConfig,
}

impl BatchedConnection {
    /// Bind to a session with the default policy.
    pub fn new(session: Session) -> Self {
        Self::with_config(session, ConnectionConfig::default())
    }

    /// Bind to a session with an explicit policy.
    pub fn with_config(session: Session, config: ConnectionConfig) -> Self {
        Self { session, config }
    }
}

#[async_trait]
impl BusConnection for BatchedConnection {
    fn session(&self) -> &Session {
        &self.session
    }

    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn submit(&self, txn: Transaction) -> TransactionResult {
        let timeout = self.config.timeout;
        submit_on(&self.session, &self.config, txn, timeout).await
    }

    async fn submit_within(&self, txn: Transaction, timeout: Duration) -> TransactionResult {
        submit_on(&self.session, &self.config, txn, timeout).await
    }

    async fn run_sequence(&self, sequence: Sequence) -> Vec<TransactionResult> {
        let mut guard = match self.session.lock().await {
            Ok(guard) => guard,
            Err(err) => return sequence.iter().map(|txn| txn.fail(&err)).collect(),
        };
        if guard.supports_batch() {
            run_batched(&mut guard, &self.config, &sequence).await
        } else {
            sequence::run_locked(&mut guard, &self.config, &sequence).await
        }
    }
}

/// Native batched execution: encode everything up front, one transport call,
/// then per-item decode. Timed-out items get the same single transparent
/// retry as the single-transaction path.
async fn run_batched(
    guard: &mut TransportGuard<'_>,
    config: &ConnectionConfig,
    sequence: &[Transaction],
) -> Vec<TransactionResult> {
    let mut results: Vec<Option<TransactionResult>> = vec![None; sequence.len()];
    let mut wires = Vec::with_capacity(sequence.len());
    let mut slots = Vec::with_capacity(sequence.len());
    for (i, txn) in sequence.iter().enumerate() {
        match frame::encode(txn, &config.layout) {
            Ok(wire) => {
                wires.push(wire);
                slots.push(i);
            }
            Err(err) => results[i] = Some(txn.fail(&err)),
        }
    }

    if !wires.is_empty() {
        match guard.exchange_batch(&wires, config.timeout).await {
            Ok(per_item) => {
                for (k, item) in per_item.into_iter().enumerate() {
                    let txn = &sequence[slots[k]];
                    let result = match item {
                        Ok(reply) => frame::decode_reply(
                            txn,
                            reply.as_ref().map(|f| f.data.as_slice()),
                        ),
                        Err(Error::Timeout { .. }) => {
                            tracing::warn!(
                                address = %txn.address(),
                                "batch item timed out, retrying"
                            );
                            retry_batch_item(guard, txn, &wires[k], config).await
                        }
                        Err(err) => txn.fail(&err),
                    };
                    results[slots[k]] = Some(result);
                }
            }
            Err(err) => {
                for &slot in &slots {
                    results[slot] = Some(sequence[slot].fail(&err));
                }
            }
        }
    }

    results
        .into_iter()
        .zip(sequence)
        .map(|(result, txn)| {
            result.unwrap_or_else(|| txn.fail(&Error::Config("missing batch result".into())))
        })
        .collect()
}

async fn retry_batch_item(
    guard: &mut TransportGuard<'_>,
    txn: &Transaction,
    wire: &WireFrame,
    config: &ConnectionConfig,
) -> TransactionResult {
    let mut result = txn.fail(&Error::Timeout {
        timeout_ms: config.timeout.as_millis() as u64,
    });
    for _ in 0..config.retries {
        match guard.exchange(wire, config.timeout).await {
            Ok(reply) => {
                return frame::decode_reply(txn, reply.as_ref().map(|f| f.data.as_slice()))
            }
            Err(err) => {
                let timed_out = matches!(err, Error::Timeout { .. });
                result = txn.fail(&err);
                if !timed_out {
                    break;
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use crate::bus::mock::{MockTransport, WireEvent};
    use crate::codec::payload;
    use crate::core::error::FailureKind;
    use crate::core::transaction::ReplyDecoder;
    use crate::core::value::Value;

    async fn standard(adapter: &str) -> (StandardConnection, Arc<crate::bus::mock::MockState>) {
        let (transport, state) = MockTransport::new(adapter);
        let session = Session::open(Box::new(transport), 1_000_000).await.unwrap();
        (StandardConnection::new(session), state)
    }

    fn u32_monitor(node: u8, rca: u32) -> Transaction {
        Transaction::monitor(BusAddress::new(node, rca))
            .with_decoder(ReplyDecoder::new(4, payload::decode_u32))
    }

    // ========== retry policy ==========

    #[tokio::test]
    async fn test_two_timeouts_surface_one_failure_after_two_attempts() {
        let (conn, state) = standard("can-retry").await;
        state.push_timeout();
        state.push_timeout();

        let result = conn.monitor(BusAddress::new(0x05, 0x1234)).await;
        assert_eq!(result.failure().unwrap().kind, FailureKind::Timeout);
        // Exactly two physical attempts: the original and one retry.
        assert_eq!(state.exchange_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_timeout_recovers_on_retry() {
        let (conn, state) = standard("can-retry-ok").await;
        state.push_timeout();
        state.push_reply(vec![0, 0, 0, 7]);

        let result = conn.submit(u32_monitor(0x05, 0x1234)).await;
        assert_eq!(result.value().and_then(Value::as_i64), Some(7));
        assert_eq!(state.exchange_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_reply_drained_before_next_transmission() {
        let (conn, state) = standard("can-drain").await;
        state.push_timeout();
        state.push_timeout();
        // First exchange times out; the retry must drain first.
        let _ = conn.monitor(BusAddress::new(0x05, 0x1234)).await;
        assert_eq!(state.drain_count.load(Ordering::SeqCst), 1);

        // The surfaced second timeout arms another drain for the next call.
        let _ = conn.monitor(BusAddress::new(0x05, 0x1235)).await;
        assert_eq!(state.drain_count.load(Ordering::SeqCst), 2);
    }

    // ========== fault latch ==========

    #[tokio::test]
    async fn test_transport_fault_fails_subsequent_calls_fast() {
        let (conn, state) = standard("can-fatal").await;
        state.push_fault("bus off");

        let result = conn.monitor(BusAddress::new(0x05, 0x1234)).await;
        assert_eq!(result.failure().unwrap().kind, FailureKind::Transport);
        assert_eq!(state.exchange_count.load(Ordering::SeqCst), 1);

        // Latched: no further frame reaches the adapter.
        let result = conn.monitor(BusAddress::new(0x05, 0x1234)).await;
        assert_eq!(result.failure().unwrap().kind, FailureKind::Transport);
        assert_eq!(state.exchange_count.load(Ordering::SeqCst), 1);
        assert!(!conn.session().is_usable());
    }

    // ========== encoding failures ==========

    #[tokio::test]
    async fn test_encoding_failure_never_reaches_the_wire() {
        let (conn, state) = standard("can-encode").await;
        let result = conn
            .control(BusAddress::new(0x05, 0x1234), vec![0u8; 9])
            .await;
        assert_eq!(result.failure().unwrap().kind, FailureKind::Encoding);
        assert_eq!(state.exchange_count.load(Ordering::SeqCst), 0);
    }

    // ========== substitutability ==========

    #[tokio::test]
    async fn test_both_implementations_decode_identical_replies_identically() {
        let replies: Vec<Vec<u8>> = (1u32..=5).map(|v| v.to_be_bytes().to_vec()).collect();
        let sequence: Sequence = (0..5).map(|i| u32_monitor(0x05, 0x1000 + i)).collect();

        let (transport, state_a) = MockTransport::new("can-sub-a");
        let session = Session::open(Box::new(transport), 1_000_000).await.unwrap();
        let standard = StandardConnection::new(session);
        for r in &replies {
            state_a.push_reply(r.clone());
        }
        let out_standard = standard.run_sequence(sequence.clone()).await;

        let (transport, state_b) = MockTransport::with_batch("can-sub-b");
        let session = Session::open(Box::new(transport), 1_000_000).await.unwrap();
        let batched = BatchedConnection::new(session);
        for r in &replies {
            state_b.push_reply(r.clone());
        }
        let out_batched = batched.run_sequence(sequence).await;

        assert_eq!(out_standard.len(), 5);
        assert_eq!(out_standard, out_batched);
        for (i, result) in out_standard.iter().enumerate() {
            assert_eq!(
                result.value().and_then(Value::as_i64),
                Some(i as i64 + 1),
                "index {}",
                i
            );
        }
    }

    // ========== batched path ==========

    #[tokio::test]
    async fn test_batched_item_timeout_gets_one_retry() {
        let (transport, state) = MockTransport::with_batch("can-batch-retry");
        let session = Session::open(Box::new(transport), 1_000_000).await.unwrap();
        let conn = BatchedConnection::new(session);

        state.push_timeout(); // item 0 in the batch
        state.push_reply(vec![0, 0, 0, 2]); // item 1 in the batch
        state.push_reply(vec![0, 0, 0, 1]); // retry of item 0

        let sequence = vec![u32_monitor(0x05, 0x1000), u32_monitor(0x05, 0x1001)];
        let out = conn.run_sequence(sequence).await;
        assert_eq!(out[0].value().and_then(Value::as_i64), Some(1));
        assert_eq!(out[1].value().and_then(Value::as_i64), Some(2));
        // Two batch items plus one retry exchange.
        assert_eq!(state.exchange_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_batched_falls_back_to_pipelining_without_native_support() {
        let (transport, state) = MockTransport::new("can-batch-fallback");
        let session = Session::open(Box::new(transport), 1_000_000).await.unwrap();
        let conn = BatchedConnection::new(session);

        for v in [3u32, 4, 5] {
            state.push_reply(v.to_be_bytes().to_vec());
        }
        let sequence: Sequence = (0..3).map(|i| u32_monitor(0x05, 0x2000 + i)).collect();
        let out = conn.run_sequence(sequence).await;
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(TransactionResult::is_ok));
    }

    // ========== wire serialization ==========

    #[tokio::test]
    async fn test_concurrent_callers_never_interleave_at_the_wire() {
        let (transport, state) = MockTransport::new("can-serial");
        state.set_latency(Duration::from_millis(20));
        let session = Session::open(Box::new(transport), 1_000_000).await.unwrap();
        let conn = Arc::new(StandardConnection::new(session));

        let a = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.monitor(BusAddress::new(0x05, 0x0001)).await })
        };
        let b = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.monitor(BusAddress::new(0x05, 0x0002)).await })
        };
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.unwrap().is_ok());
        assert!(rb.unwrap().is_ok());

        // Each frame resolves before the next one is transmitted.
        let events = state.events.lock().clone();
        assert_eq!(events.len(), 4);
        for pair in events.chunks(2) {
            match (pair[0], pair[1]) {
                (WireEvent::Sent(x), WireEvent::Resolved(y)) => assert_eq!(x, y),
                other => panic!("interleaved wire events: {:?}", other),
            }
        }
    }
}
