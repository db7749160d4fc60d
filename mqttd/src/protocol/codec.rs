//! MQTT packet encoding/decoding utilities.
//!
//! Low-level readers work on a complete packet body: running off the end of
//! the slice is a [`Error::MalformedPacket`], since the fixed header already
//! promised that many bytes. Only [`read_fixed_header`] reports
//! [`Error::Incomplete`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::{FixedHeader, PacketType};

/// Largest value a 4-byte remaining length can carry (2^28 - 1).
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Read a variable-length integer (remaining length encoding).
///
/// Returns `Ok(Some((value, bytes_consumed)))`, `Ok(None)` if more bytes are
/// needed, or [`Error::VarintOverflow`] if a fifth byte would be required.
pub fn read_variable_int(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value = 0u32;

    for i in 0..4 {
        let Some(&byte) = buf.get(i) else {
            return Ok(None);
        };

        value |= ((byte & 0x7F) as u32) << (7 * i);

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    Err(Error::VarintOverflow)
}

/// Write a variable-length integer, returning the number of bytes written.
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize> {
    if value > MAX_REMAINING_LENGTH {
        return Err(Error::VarintOverflow);
    }

    let mut written = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;

        if value > 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);
        written += 1;

        if value == 0 {
            return Ok(written);
        }
    }
}

/// Calculate the number of bytes needed for a variable-length integer.
pub const fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

fn short(what: &str) -> Error {
    Error::MalformedPacket(format!("{what} runs past end of packet"))
}

/// Read a single byte.
pub fn read_u8(buf: &[u8]) -> Result<u8> {
    buf.first().copied().ok_or_else(|| short("byte field"))
}

/// Read a 2-byte big-endian u16.
pub fn read_u16(buf: &[u8]) -> Result<u16> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(short("u16 field")),
    }
}

/// Write a 2-byte big-endian u16.
pub fn write_u16(buf: &mut BytesMut, value: u16) {
    buf.put_u16(value);
}

/// Read binary data as a slice (2-byte length prefix + data).
pub fn read_binary_slice(buf: &[u8]) -> Result<(&[u8], usize)> {
    let len = read_u16(buf)? as usize;

    if buf.len() < 2 + len {
        return Err(short("length-prefixed field"));
    }

    Ok((&buf[2..2 + len], 2 + len))
}

/// Read a UTF-8 string (2-byte length prefix + data).
pub fn read_string(buf: &[u8]) -> Result<(String, usize)> {
    let (bytes, len) = read_binary_slice(buf)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| Error::MalformedPacket("invalid utf-8 string".into()))?;
    Ok((s.to_string(), len))
}

/// Read binary data (2-byte length prefix + data).
pub fn read_binary(buf: &[u8]) -> Result<(Bytes, usize)> {
    let (bytes, len) = read_binary_slice(buf)?;
    Ok((Bytes::copy_from_slice(bytes), len))
}

/// Write binary data (2-byte length prefix + data).
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<usize> {
    let len = u16::try_from(data.len()).map_err(|_| {
        Error::MalformedPacket(format!("field of {} bytes exceeds 65535", data.len()))
    })?;

    buf.put_u16(len);
    buf.put_slice(data);
    Ok(2 + data.len())
}

/// Write a UTF-8 string (2-byte length prefix + data).
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<usize> {
    write_binary(buf, s.as_bytes())
}

/// Parse a fixed header from buffer.
pub fn read_fixed_header(buf: &[u8]) -> Result<FixedHeader> {
    let Some(&first_byte) = buf.first() else {
        return Err(Error::Incomplete { needed: 1 });
    };

    let packet_type_byte = first_byte >> 4;
    let flags = first_byte & 0x0F;

    let packet_type =
        PacketType::from_u8(packet_type_byte).ok_or(Error::InvalidPacketType(packet_type_byte))?;

    let (remaining_length, var_len) =
        read_variable_int(&buf[1..])?.ok_or(Error::Incomplete { needed: 1 })?;

    Ok(FixedHeader {
        packet_type,
        flags,
        remaining_length,
        header_length: 1 + var_len,
    })
}

/// Write a fixed header to buffer.
pub fn write_fixed_header(
    buf: &mut BytesMut,
    packet_type: PacketType,
    flags: u8,
    remaining_length: usize,
) -> Result<usize> {
    let remaining = u32::try_from(remaining_length).map_err(|_| Error::VarintOverflow)?;
    buf.put_u8(((packet_type as u8) << 4) | (flags & 0x0F));
    Ok(1 + write_variable_int(buf, remaining)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_int() {
        for value in [0, 1, 127, 128, 16383, 16384, 2097151, 2097152, MAX_REMAINING_LENGTH] {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            let (decoded, consumed) = read_variable_int(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(written, consumed);
            assert_eq!(written, variable_int_len(value));
        }
    }

    #[test]
    fn test_variable_int_overflow() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            write_variable_int(&mut buf, MAX_REMAINING_LENGTH + 1),
            Err(Error::VarintOverflow)
        ));

        let five_bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(matches!(read_variable_int(&five_bytes), Err(Error::VarintOverflow)));
    }

    #[test]
    fn test_variable_int_incomplete() {
        assert!(read_variable_int(&[]).unwrap().is_none());
        assert!(read_variable_int(&[0x80, 0x80]).unwrap().is_none());
    }

    #[test]
    fn test_u16() {
        let mut buf = BytesMut::new();
        write_u16(&mut buf, 0x1234);
        assert_eq!(read_u16(&buf).unwrap(), 0x1234);
        assert!(matches!(read_u16(&[0x12]), Err(Error::MalformedPacket(_))));
    }

    #[test]
    fn test_string() {
        let mut buf = BytesMut::new();
        assert_eq!(write_string(&mut buf, "a/b").unwrap(), 5);
        let (s, len) = read_string(&buf).unwrap();
        assert_eq!(s, "a/b");
        assert_eq!(len, 5);

        // Declared length longer than the remaining bytes.
        assert!(matches!(read_string(&[0x00, 0x05, b'a']), Err(Error::MalformedPacket(_))));
        assert!(matches!(read_string(&[0x00, 0x01, 0xFF]), Err(Error::MalformedPacket(_))));
    }

    #[test]
    fn test_fixed_header() {
        let mut buf = BytesMut::new();
        let len = write_fixed_header(&mut buf, PacketType::Publish, 0x0B, 321).unwrap();
        assert_eq!(len, 3);

        let header = read_fixed_header(&buf).unwrap();
        assert_eq!(header.packet_type, PacketType::Publish);
        assert_eq!(header.flags, 0x0B);
        assert_eq!(header.remaining_length, 321);
        assert_eq!(header.header_length, 3);

        assert!(matches!(read_fixed_header(&[0x00, 0x00]), Err(Error::InvalidPacketType(0))));
        assert!(matches!(read_fixed_header(&[0x30]), Err(Error::Incomplete { .. })));
    }
}
