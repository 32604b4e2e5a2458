//! Payload packing and unpacking.
//!
//! Bus payloads are big-endian scalars of 1-8 bytes. The `pack_*`/`unpack_*`
//! functions are the building blocks; the `encode_*`/`decode_*` wrappers have
//! the uniform signatures expected by command descriptors and reply decoders.

use crate::core::error::{Error, Result};
use crate::core::value::Value;

/// Pure function turning a typed value into a control payload.
pub type EncodeFn = fn(&Value) -> Result<Vec<u8>>;

// ============================================================================
// Packing
// ============================================================================

/// Pack a bool as a single 0x00/0x01 byte.
#[inline]
pub fn pack_bool(v: bool) -> Vec<u8> {
    vec![u8::from(v)]
}

/// Pack an 8-bit unsigned integer.
#[inline]
pub fn pack_u8(v: u8) -> Vec<u8> {
    vec![v]
}

/// Pack a 16-bit unsigned integer, big-endian.
#[inline]
pub fn pack_u16(v: u16) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

/// Pack a 32-bit unsigned integer, big-endian.
#[inline]
pub fn pack_u32(v: u32) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

/// Pack a 32-bit float, big-endian.
#[inline]
pub fn pack_f32(v: f32) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

// ============================================================================
// Unpacking
// ============================================================================

fn take<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    data.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| {
            Error::decoding(format!(
                "need {} bytes at offset {}, reply has {}",
                N,
                offset,
                data.len()
            ))
        })
}

/// Unpack an 8-bit unsigned integer at `offset`.
pub fn unpack_u8(data: &[u8], offset: usize) -> Result<u8> {
    Ok(take::<1>(data, offset)?[0])
}

/// Unpack a 16-bit unsigned integer at `offset`, big-endian.
pub fn unpack_u16(data: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_be_bytes(take(data, offset)?))
}

/// Unpack a 32-bit unsigned integer at `offset`, big-endian.
pub fn unpack_u32(data: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_be_bytes(take(data, offset)?))
}

/// Unpack a 32-bit float at `offset`, big-endian.
pub fn unpack_f32(data: &[u8], offset: usize) -> Result<f32> {
    Ok(f32::from_be_bytes(take(data, offset)?))
}

// ============================================================================
// Descriptor encoders (typed value -> control payload)
// ============================================================================

/// Encode a bool control payload.
pub fn encode_bool(value: &Value) -> Result<Vec<u8>> {
    value
        .as_bool()
        .map(pack_bool)
        .ok_or_else(|| Error::encoding("cannot convert value to bool"))
}

/// Encode a u8 control payload.
pub fn encode_u8(value: &Value) -> Result<Vec<u8>> {
    value
        .as_i64()
        .filter(|v| (0..=0xFF).contains(v))
        .map(|v| pack_u8(v as u8))
        .ok_or_else(|| Error::encoding("value out of range for u8"))
}

/// Encode a u16 control payload.
pub fn encode_u16(value: &Value) -> Result<Vec<u8>> {
    value
        .as_i64()
        .filter(|v| (0..=0xFFFF).contains(v))
        .map(|v| pack_u16(v as u16))
        .ok_or_else(|| Error::encoding("value out of range for u16"))
}

/// Encode a u32 control payload.
pub fn encode_u32(value: &Value) -> Result<Vec<u8>> {
    value
        .as_i64()
        .filter(|v| (0..=0xFFFF_FFFF).contains(v))
        .map(|v| pack_u32(v as u32))
        .ok_or_else(|| Error::encoding("value out of range for u32"))
}

/// Encode a 32-bit float control payload.
pub fn encode_f32(value: &Value) -> Result<Vec<u8>> {
    value
        .as_f64()
        .map(|v| pack_f32(v as f32))
        .ok_or_else(|| Error::encoding("cannot convert value to float"))
}

// ============================================================================
// Reply decoders (reply bytes -> typed value)
// ============================================================================

/// Decode a single byte as a bool (nonzero = true).
pub fn decode_bool(data: &[u8]) -> Result<Value> {
    Ok(Value::Bool(unpack_u8(data, 0)? != 0))
}

/// Decode a single byte as an integer.
pub fn decode_u8(data: &[u8]) -> Result<Value> {
    Ok(Value::from(unpack_u8(data, 0)?))
}

/// Decode a big-endian u16 as an integer.
pub fn decode_u16(data: &[u8]) -> Result<Value> {
    Ok(Value::from(unpack_u16(data, 0)?))
}

/// Decode a big-endian u32 as an integer.
pub fn decode_u32(data: &[u8]) -> Result<Value> {
    Ok(Value::from(unpack_u32(data, 0)?))
}

/// Decode a big-endian 32-bit float.
pub fn decode_f32(data: &[u8]) -> Result<Value> {
    let v = unpack_f32(data, 0)?;
    if v.is_nan() || v.is_infinite() {
        return Err(Error::decoding("reply is not a finite float"));
    }
    Ok(Value::from(v))
}

/// Return the reply bytes unchanged, after the length check.
pub fn decode_raw(data: &[u8]) -> Result<Value> {
    Ok(Value::Bytes(data.to_vec()))
}

/// Decode a three-byte firmware revision as "major.minor.patch".
pub fn decode_version(data: &[u8]) -> Result<Value> {
    let major = unpack_u8(data, 0)?;
    let minor = unpack_u8(data, 1)?;
    let patch = unpack_u8(data, 2)?;
    Ok(Value::String(format!("{}.{}.{}", major, minor, patch)))
}

/// Decode the node temperature sensor reading in degrees Celsius.
///
/// Byte 0 holds the magnitude in half-degree steps (bit 0 is the half
/// degree), byte 1 is nonzero for readings below zero.
pub fn decode_sensor_temperature(data: &[u8]) -> Result<Value> {
    let raw = unpack_u8(data, 0)?;
    let sign = unpack_u8(data, 1)?;
    let mut temp = f64::from(raw >> 1);
    if sign != 0 {
        temp = -temp - 1.0;
    }
    if raw & 0x01 != 0 {
        temp += 0.5;
    }
    Ok(Value::Float(temp))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== scalar round trips ==========

    #[test]
    fn test_u16_roundtrip() {
        let bytes = pack_u16(0x0FFF);
        assert_eq!(bytes, vec![0x0F, 0xFF]);
        assert_eq!(unpack_u16(&bytes, 0).unwrap(), 0x0FFF);
    }

    #[test]
    fn test_f32_roundtrip() {
        let bytes = pack_f32(-2.125);
        assert_eq!(unpack_f32(&bytes, 0).unwrap(), -2.125);
    }

    #[test]
    fn test_unpack_past_end_fails() {
        assert!(unpack_u32(&[0x01, 0x02], 0).is_err());
        assert!(unpack_u8(&[], 0).is_err());
    }

    #[test]
    fn test_unpack_with_offset() {
        let data = [0x00, 0x12, 0x34];
        assert_eq!(unpack_u16(&data, 1).unwrap(), 0x1234);
    }

    // ========== descriptor encoders ==========

    #[test]
    fn test_encode_u16_range_check() {
        assert_eq!(
            encode_u16(&Value::Integer(4095)).unwrap(),
            vec![0x0F, 0xFF]
        );
        assert!(encode_u16(&Value::Integer(0x1_0000)).is_err());
        assert!(encode_u16(&Value::Integer(-1)).is_err());
    }

    #[test]
    fn test_encode_bool() {
        assert_eq!(encode_bool(&Value::Bool(true)).unwrap(), vec![0x01]);
        assert_eq!(encode_bool(&Value::Bool(false)).unwrap(), vec![0x00]);
        assert!(encode_bool(&Value::String("on".into())).is_err());
    }

    // ========== reply decoders ==========

    #[test]
    fn test_decode_version() {
        let v = decode_version(&[2, 8, 7]).unwrap();
        assert_eq!(v.as_str(), Some("2.8.7"));
    }

    #[test]
    fn test_decode_f32_rejects_nan() {
        assert!(decode_f32(&f32::NAN.to_be_bytes()).is_err());
    }

    #[test]
    fn test_decode_sensor_temperature() {
        // 25.5 C: magnitude 25 in bits 7..1, half-degree bit set
        let v = decode_sensor_temperature(&[(25 << 1) | 1, 0x00]).unwrap();
        assert_eq!(v.as_f64(), Some(25.5));
        // -10 C: magnitude 9, sign byte set, half-degree bit set
        let v = decode_sensor_temperature(&[(9 << 1) | 1, 0x01]).unwrap();
        assert_eq!(v.as_f64(), Some(-9.5));
        // 0 C
        let v = decode_sensor_temperature(&[0x00, 0x00]).unwrap();
        assert_eq!(v.as_f64(), Some(0.0));
    }
}
