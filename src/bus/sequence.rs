//! Pipelined sequence execution over a one-at-a-time transport.
//!
//! The batching policy layer used when a sequence must run on a connection
//! without native batch support. The transport lock is taken once for the
//! whole sequence, so per-item overhead is one encode, one exchange, one
//! decode - no lock churn, no intermediate buffering.
//!
//! The bus protocol has no transaction-id multiplexing, so the next frame is
//! not transmitted until the previous reply (or its timeout) resolves.
//! Submission order is preserved exactly; a failure at index `i` is recorded
//! at index `i` and the siblings still run. A transport fault latches the
//! session and fails the remainder fast, preserving the result count.

use crate::bus::connection::{exchange_with_retry, ConnectionConfig};
use crate::bus::session::{Session, TransportGuard};
use crate::codec::frame;
use crate::core::transaction::{Transaction, TransactionResult};

/// Run a sequence against a session, taking the transport lock once.
///
/// The result list has the same length and order as `sequence`.
pub async fn run(
    session: &Session,
    config: &ConnectionConfig,
    sequence: &[Transaction],
) -> Vec<TransactionResult> {
    let mut guard = match session.lock().await {
        Ok(guard) => guard,
        Err(err) => return sequence.iter().map(|txn| txn.fail(&err)).collect(),
    };
    run_locked(&mut guard, config, sequence).await
}

/// Run a sequence on an already-held transport guard.
pub(crate) async fn run_locked(
    guard: &mut TransportGuard<'_>,
    config: &ConnectionConfig,
    sequence: &[Transaction],
) -> Vec<TransactionResult> {
    let mut results = Vec::with_capacity(sequence.len());
    for txn in sequence {
        // A latched session fails the remaining items without touching the
        // wire; the result count stays at N.
        if let Err(err) = guard.usable() {
            results.push(txn.fail(&err));
            continue;
        }
        let wire = match frame::encode(txn, &config.layout) {
            Ok(wire) => wire,
            Err(err) => {
                results.push(txn.fail(&err));
                continue;
            }
        };
        results.push(exchange_with_retry(guard, txn, &wire, config.timeout, config.retries).await);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::bus::mock::{MockState, MockTransport};
    use crate::codec::payload;
    use crate::core::address::BusAddress;
    use crate::core::error::FailureKind;
    use crate::core::transaction::ReplyDecoder;
    use crate::core::value::Value;
    use std::sync::Arc;

    async fn session_on(adapter: &str) -> (Session, Arc<MockState>) {
        let (transport, state) = MockTransport::new(adapter);
        let session = Session::open(Box::new(transport), 1_000_000).await.unwrap();
        (session, state)
    }

    fn u32_monitor(rca: u32) -> Transaction {
        Transaction::monitor(BusAddress::new(0x05, rca))
            .with_decoder(ReplyDecoder::new(4, payload::decode_u32))
    }

    #[tokio::test]
    async fn test_n_results_in_submission_order() {
        let (session, state) = session_on("can-seq-order").await;
        for v in 100u32..110 {
            state.push_reply(v.to_be_bytes().to_vec());
        }
        let sequence: Vec<Transaction> = (0..10).map(|i| u32_monitor(0x1000 + i)).collect();

        let results = run(&session, &ConnectionConfig::default(), &sequence).await;
        assert_eq!(results.len(), 10);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.address.rca, 0x1000 + i as u32);
            assert_eq!(
                result.value().and_then(Value::as_i64),
                Some(100 + i as i64)
            );
        }

        // Frames left in submission order, one at a time.
        let sent = state.sent_ids();
        assert_eq!(sent.len(), 10);
        assert!(sent.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[tokio::test]
    async fn test_failure_at_index_3_leaves_siblings_successful() {
        let (session, state) = session_on("can-seq-partial").await;
        for i in 0u32..10 {
            if i == 3 {
                // Short reply: length mismatch against the 4-byte decoder.
                state.push_reply(vec![0xFF]);
            } else {
                state.push_reply(i.to_be_bytes().to_vec());
            }
        }
        let sequence: Vec<Transaction> = (0..10).map(|i| u32_monitor(0x2000 + i)).collect();

        let results = run(&session, &ConnectionConfig::default(), &sequence).await;
        assert_eq!(results.len(), 10);
        for (i, result) in results.iter().enumerate() {
            if i == 3 {
                assert_eq!(result.failure().unwrap().kind, FailureKind::Decoding);
            } else {
                assert_eq!(
                    result.value().and_then(Value::as_i64),
                    Some(i as i64),
                    "index {}",
                    i
                );
            }
        }
    }

    #[tokio::test]
    async fn test_transport_fault_fails_remainder_without_touching_the_wire() {
        let (session, state) = session_on("can-seq-fatal").await;
        state.push_reply(0u32.to_be_bytes().to_vec());
        state.push_reply(1u32.to_be_bytes().to_vec());
        state.push_fault("bus off");

        let sequence: Vec<Transaction> = (0..10).map(|i| u32_monitor(0x3000 + i)).collect();
        let results = run(&session, &ConnectionConfig::default(), &sequence).await;

        assert_eq!(results.len(), 10);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        for result in &results[2..] {
            assert_eq!(result.failure().unwrap().kind, FailureKind::Transport);
        }
        // Items 3..10 failed fast: only three frames ever reached the adapter.
        assert_eq!(state.exchange_count.load(Ordering::SeqCst), 3);
        assert!(!session.is_usable());
    }

    #[tokio::test]
    async fn test_closed_session_fails_every_item_fast() {
        let (session, state) = session_on("can-seq-closed").await;
        session.close().await.unwrap();

        let sequence: Vec<Transaction> = (0..4).map(|i| u32_monitor(0x4000 + i)).collect();
        let results = run(&session, &ConnectionConfig::default(), &sequence).await;
        assert_eq!(results.len(), 4);
        assert!(results
            .iter()
            .all(|r| r.failure().unwrap().kind == FailureKind::Transport));
        assert_eq!(state.exchange_count.load(Ordering::SeqCst), 0);
    }
}
