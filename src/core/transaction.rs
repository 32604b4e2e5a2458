//! Transactions, results, and sequences.
//!
//! A [`Transaction`] pairs a [`BusAddress`] with a direction and, for control
//! requests, a 0-8 byte payload. It is immutable once built: device facades
//! create transactions, bus connections consume them. The outcome of every
//! transaction is a [`TransactionResult`] carrying either a decoded value, the
//! raw reply bytes, or a typed failure - never a silent default.

use serde::{Deserialize, Serialize};

use crate::core::address::BusAddress;
use crate::core::error::{Error, FailureKind, Result};
use crate::core::value::Value;

/// Maximum payload length of a single bus frame.
pub const MAX_PAYLOAD_LEN: usize = 8;

/// Direction of a transaction on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Read request: no payload, typed value on reply.
    Monitor,
    /// Write request: payload on request, no reply expected.
    Control,
}

/// Pure function applied to reply bytes to produce a typed value.
pub type DecodeFn = fn(&[u8]) -> Result<Value>;

/// Expected reply shape and the decode function to apply to it.
///
/// Plain `fn` pointers keep the codec free of shared mutable state, so
/// decoding is safe to run concurrently from any thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyDecoder {
    /// Exact reply length in bytes; a mismatch is a decoding failure.
    pub expected_len: usize,
    /// Decoder applied once the length check passes.
    pub decode: DecodeFn,
}

impl ReplyDecoder {
    /// Create a new reply decoder.
    pub const fn new(expected_len: usize, decode: DecodeFn) -> Self {
        Self {
            expected_len,
            decode,
        }
    }
}

/// One monitor or control request, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    address: BusAddress,
    direction: Direction,
    payload: Vec<u8>,
    decoder: Option<ReplyDecoder>,
    command: Option<String>,
}

impl Transaction {
    /// Build a monitor (read) transaction.
    pub fn monitor(address: BusAddress) -> Self {
        Self {
            address,
            direction: Direction::Monitor,
            payload: Vec::new(),
            decoder: None,
            command: None,
        }
    }

    /// Build a control (write) transaction with the given payload.
    pub fn control(address: BusAddress, payload: Vec<u8>) -> Self {
        Self {
            address,
            direction: Direction::Control,
            payload,
            decoder: None,
            command: None,
        }
    }

    /// Attach a reply decoder (consumes and returns the transaction).
    pub fn with_decoder(mut self, decoder: ReplyDecoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Attach the symbolic command name for diagnosability.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// The (node, RCA) address of this transaction.
    #[inline]
    pub fn address(&self) -> BusAddress {
        self.address
    }

    /// Monitor or control.
    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Request payload. Empty for monitor requests.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The reply decoder, if one was attached.
    #[inline]
    pub fn decoder(&self) -> Option<&ReplyDecoder> {
        self.decoder.as_ref()
    }

    /// The symbolic command name, if one was attached.
    #[inline]
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Build the failed result for this transaction from an error.
    pub fn fail(&self, err: &Error) -> TransactionResult {
        TransactionResult {
            address: self.address,
            command: self.command.clone(),
            outcome: TransactionOutcome::Failed(TransactionFailure {
                kind: err.failure_kind(),
                detail: err.to_string(),
            }),
        }
    }
}

/// An ordered batch of transactions submitted together.
///
/// Result ordering always matches submission ordering; the runner never
/// reorders.
pub type Sequence = Vec<Transaction>;

/// Failure descriptor recorded in place of a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFailure {
    /// Failure classification.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub detail: String,
}

/// What came back for one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    /// Reply decoded to a typed value.
    Value(Value),
    /// Raw reply bytes; no decoder was attached.
    Raw(Vec<u8>),
    /// Control acknowledged with no reply payload.
    Done,
    /// The transaction failed.
    Failed(TransactionFailure),
}

/// Result of one transaction, owned by the caller that issued it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    /// The originating address, for diagnosability.
    pub address: BusAddress,
    /// The symbolic command name, when issued through a device facade.
    pub command: Option<String>,
    /// Decoded value, raw bytes, or failure.
    pub outcome: TransactionOutcome,
}

impl TransactionResult {
    /// True if this transaction completed without failure.
    #[inline]
    pub fn is_ok(&self) -> bool {
        !matches!(self.outcome, TransactionOutcome::Failed(_))
    }

    /// The decoded value, if the outcome carries one.
    pub fn value(&self) -> Option<&Value> {
        match &self.outcome {
            TransactionOutcome::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The failure descriptor, if the transaction failed.
    pub fn failure(&self) -> Option<&TransactionFailure> {
        match &self.outcome {
            TransactionOutcome::Failed(f) => Some(f),
            _ => None,
        }
    }

    /// Convert into the decoded value, or an error carrying the command
    /// name and address.
    pub fn into_value(self) -> Result<Value> {
        let command = self.command.clone().unwrap_or_else(|| "raw".to_string());
        match self.outcome {
            TransactionOutcome::Value(v) => Ok(v),
            TransactionOutcome::Raw(bytes) => Ok(Value::Bytes(bytes)),
            TransactionOutcome::Done => Ok(Value::Null),
            TransactionOutcome::Failed(f) => {
                Err(failure_to_error(&f).with_command(command, self.address))
            }
        }
    }

    /// Convert into `Ok(())` for control acknowledgements, or the failure.
    pub fn into_ack(self) -> Result<()> {
        match self.outcome {
            TransactionOutcome::Failed(f) => {
                let command = self.command.unwrap_or_else(|| "raw".to_string());
                Err(failure_to_error(&f).with_command(command, self.address))
            }
            _ => Ok(()),
        }
    }
}

fn failure_to_error(failure: &TransactionFailure) -> Error {
    Error::Failed {
        kind: failure.kind,
        detail: failure.detail.clone(),
    }
}
