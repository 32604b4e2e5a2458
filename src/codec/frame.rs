//! Transaction <-> wire frame codec.
//!
//! Stateless mapping between a [`Transaction`] and the frame handed to the
//! transport, and between reply bytes and a [`TransactionResult`]. The frame
//! identifier packing is driven entirely by [`FrameLayout`], so a different
//! physical encoding is a configuration change, not new code.

use crate::core::address::{BusAddress, FrameLayout};
use crate::core::error::{Error, Result};
use crate::core::transaction::{
    Direction, Transaction, TransactionOutcome, TransactionResult, MAX_PAYLOAD_LEN,
};

/// One frame as handed to or received from the transport.
///
/// The direction flag is carried explicitly even though the default bus
/// encoding distinguishes monitor from control by payload presence: a
/// transport whose physical encoding differs still gets an unambiguous frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// Packed frame identifier (node + RCA per the layout).
    pub id: u32,
    /// Monitor or control.
    pub direction: Direction,
    /// 0-8 byte payload. Empty for monitor requests.
    pub data: Vec<u8>,
}

/// Encode a transaction into a wire frame.
///
/// Fails with [`Error::Encoding`] if the payload exceeds 8 bytes or the
/// node/RCA exceed the field widths of the layout.
pub fn encode(txn: &Transaction, layout: &FrameLayout) -> Result<WireFrame> {
    let addr = txn.address();
    if txn.payload().len() > MAX_PAYLOAD_LEN {
        return Err(Error::encoding(format!(
            "payload length {} exceeds {} bytes at {}",
            txn.payload().len(),
            MAX_PAYLOAD_LEN,
            addr
        )));
    }
    if addr.rca > layout.max_rca() {
        return Err(Error::encoding(format!(
            "RCA 0x{:X} exceeds the {}-bit address space",
            addr.rca, layout.rca_width
        )));
    }
    if u32::from(addr.node) > layout.max_node() {
        return Err(Error::encoding(format!(
            "node 0x{:X} exceeds the layout's node field",
            addr.node
        )));
    }
    Ok(WireFrame {
        id: pack_id(addr, layout),
        direction: txn.direction(),
        data: txn.payload().to_vec(),
    })
}

/// Pack a bus address into a frame identifier.
#[inline]
pub fn pack_id(addr: BusAddress, layout: &FrameLayout) -> u32 {
    ((u32::from(addr.node) + u32::from(layout.node_base)) << layout.node_shift) | addr.rca
}

/// Recover the (node, RCA) pair from a frame identifier.
///
/// Inverse of [`pack_id`]; used by transports that demultiplex replies and
/// by the round-trip tests.
pub fn decode_frame(frame: &WireFrame, layout: &FrameLayout) -> Result<BusAddress> {
    let rca = frame.id & layout.max_rca();
    let node_field = frame.id >> layout.node_shift;
    let node = node_field
        .checked_sub(u32::from(layout.node_base))
        .ok_or_else(|| {
            Error::decoding(format!(
                "frame id 0x{:X} has node field below the base offset",
                frame.id
            ))
        })?;
    if node > layout.max_node() || node > u32::from(u8::MAX) {
        return Err(Error::decoding(format!(
            "frame id 0x{:X} decodes to out-of-range node 0x{:X}",
            frame.id, node
        )));
    }
    Ok(BusAddress::new(node as u8, rca))
}

/// Turn reply bytes into the transaction's result.
///
/// A length mismatch against the attached decoder is recorded as a decoding
/// failure; with no decoder the raw bytes are returned as-is. A `None` reply
/// acknowledges a control request.
pub fn decode_reply(txn: &Transaction, reply: Option<&[u8]>) -> TransactionResult {
    let outcome = match (reply, txn.decoder()) {
        (None, _) => TransactionOutcome::Done,
        (Some(bytes), None) => TransactionOutcome::Raw(bytes.to_vec()),
        (Some(bytes), Some(decoder)) => {
            if bytes.len() != decoder.expected_len {
                return txn.fail(&Error::decoding(format!(
                    "reply length {} != expected {}",
                    bytes.len(),
                    decoder.expected_len
                )));
            }
            match (decoder.decode)(bytes) {
                Ok(value) => TransactionOutcome::Value(value),
                Err(err) => return txn.fail(&err),
            }
        }
    };
    TransactionResult {
        address: txn.address(),
        command: txn.command().map(str::to_string),
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::payload;
    use crate::core::error::FailureKind;
    use crate::core::transaction::ReplyDecoder;
    use crate::core::value::Value;

    // ========== encode tests ==========

    #[test]
    fn test_encode_packs_default_arbitration_id() {
        let layout = FrameLayout::default();
        let txn = Transaction::monitor(BusAddress::new(0x13, 0x2008));
        let frame = encode(&txn, &layout).unwrap();
        // (node + 1) << 18 | rca
        assert_eq!(frame.id, (0x14 << 18) | 0x2008);
        assert!(frame.data.is_empty());
        assert_eq!(frame.direction, Direction::Monitor);
    }

    #[test]
    fn test_encode_rejects_long_payload() {
        let layout = FrameLayout::default();
        let txn = Transaction::control(BusAddress::new(1, 0x10008), vec![0u8; 9]);
        let err = encode(&txn, &layout).unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Encoding);
    }

    #[test]
    fn test_encode_rejects_oversized_rca() {
        let layout = FrameLayout::default();
        let txn = Transaction::monitor(BusAddress::new(1, 0x40000));
        assert!(encode(&txn, &layout).is_err());
    }

    // ========== round-trip law ==========

    #[test]
    fn test_roundtrip_for_valid_addresses() {
        let layout = FrameLayout::default();
        for (node, rca, data) in [
            (0x00, 0x00000, vec![]),
            (0x05, 0x01234, vec![0xAA]),
            (0x13, 0x12008, vec![1, 2, 3, 4]),
            (0xFF, 0x3FFFF, vec![0u8; 8]),
        ] {
            let addr = BusAddress::new(node, rca);
            let txn = if data.is_empty() {
                Transaction::monitor(addr)
            } else {
                Transaction::control(addr, data.clone())
            };
            let frame = encode(&txn, &layout).unwrap();
            assert_eq!(decode_frame(&frame, &layout).unwrap(), addr);
            assert_eq!(frame.data, data);
        }
    }

    #[test]
    fn test_roundtrip_with_narrow_layout() {
        // An 11-bit standard-id layout with a 6-bit RCA field.
        let layout = FrameLayout {
            node_shift: 6,
            rca_width: 6,
            node_base: 0,
            id_width: 11,
        };
        layout.validate().unwrap();
        let addr = BusAddress::new(0x1F, 0x3F);
        let txn = Transaction::monitor(addr);
        let frame = encode(&txn, &layout).unwrap();
        assert_eq!(decode_frame(&frame, &layout).unwrap(), addr);
    }

    // ========== decode_reply tests ==========

    #[test]
    fn test_decode_reply_applies_decoder() {
        let txn = Transaction::monitor(BusAddress::new(5, 0x0008))
            .with_decoder(ReplyDecoder::new(4, payload::decode_f32));
        let result = decode_reply(&txn, Some(&2.25f32.to_be_bytes()));
        assert_eq!(result.value().and_then(Value::as_f64), Some(2.25));
    }

    #[test]
    fn test_decode_reply_length_mismatch_fails() {
        let txn = Transaction::monitor(BusAddress::new(5, 0x0008))
            .with_decoder(ReplyDecoder::new(4, payload::decode_f32));
        let result = decode_reply(&txn, Some(&[0x01, 0x02]));
        assert_eq!(result.failure().unwrap().kind, FailureKind::Decoding);
    }

    #[test]
    fn test_decode_reply_without_decoder_returns_raw() {
        let txn = Transaction::monitor(BusAddress::new(5, 0x0000));
        let result = decode_reply(&txn, Some(&[0xDE, 0xAD]));
        assert_eq!(
            result.outcome,
            TransactionOutcome::Raw(vec![0xDE, 0xAD])
        );
    }

    #[test]
    fn test_decode_reply_none_acknowledges_control() {
        let txn = Transaction::control(BusAddress::new(5, 0x10008), vec![0x01]);
        let result = decode_reply(&txn, None);
        assert_eq!(result.outcome, TransactionOutcome::Done);
    }
}
