//! Little-endian serialization helpers shared by the container records.

use stratum_error::{Result, StratumError};

pub fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn push_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn push_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn push_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(u8::from(value));
}

pub fn read_u32(bytes: &[u8], cursor: &mut usize, field: &str) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array::<4>(bytes, cursor, field)?))
}

pub fn read_u64(bytes: &[u8], cursor: &mut usize, field: &str) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array::<8>(bytes, cursor, field)?))
}

pub fn read_i64(bytes: &[u8], cursor: &mut usize, field: &str) -> Result<i64> {
    Ok(i64::from_le_bytes(read_array::<8>(bytes, cursor, field)?))
}

pub fn read_bool(bytes: &[u8], cursor: &mut usize, field: &str) -> Result<bool> {
    let raw = read_array::<1>(bytes, cursor, field)?[0];
    match raw {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(StratumError::FormatCorrupt {
            detail: format!("field {field} holds {other}, expected a boolean byte"),
        }),
    }
}

pub fn read_array<const N: usize>(
    bytes: &[u8],
    cursor: &mut usize,
    field: &str,
) -> Result<[u8; N]> {
    let end = cursor
        .checked_add(N)
        .ok_or_else(|| StratumError::FormatCorrupt {
            detail: format!("overflow reading field {field}"),
        })?;
    if end > bytes.len() {
        return Err(StratumError::FormatCorrupt {
            detail: format!(
                "field {field} out of bounds: need {N} bytes at offset {}, total {}",
                *cursor,
                bytes.len()
            ),
        });
    }
    let mut out = [0_u8; N];
    out.copy_from_slice(&bytes[*cursor..end]);
    *cursor = end;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_scalars() {
        let mut buf = Vec::new();
        push_u32(&mut buf, 0xDEAD_BEEF);
        push_u64(&mut buf, u64::MAX - 1);
        push_i64(&mut buf, -42);
        push_bool(&mut buf, true);

        let mut cursor = 0;
        assert_eq!(read_u32(&buf, &mut cursor, "a").unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_u64(&buf, &mut cursor, "b").unwrap(), u64::MAX - 1);
        assert_eq!(read_i64(&buf, &mut cursor, "c").unwrap(), -42);
        assert!(read_bool(&buf, &mut cursor, "d").unwrap());
        assert_eq!(cursor, buf.len());
    }

    #[test]
    fn test_short_read_is_corrupt() {
        let buf = vec![1, 2];
        let mut cursor = 0;
        let err = read_u32(&buf, &mut cursor, "short").unwrap_err();
        assert!(matches!(err, StratumError::FormatCorrupt { .. }));
    }

    #[test]
    fn test_bad_bool_byte_is_corrupt() {
        let buf = vec![7];
        let mut cursor = 0;
        assert!(read_bool(&buf, &mut cursor, "flag").is_err());
    }
}
