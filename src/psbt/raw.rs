// SPDX-License-Identifier: CC0-1.0

//! Raw PSBT records
//!
//! Every PSBT map is a stream of `(length-prefixed key, length-prefixed
//! value)` records terminated by a zero-length key. The first byte of a
//! key is its type; the rest is key data. This module holds the byte-level
//! codec the map (de)serializers are written in terms of.

use super::Error;

/// Write a Bitcoin compact size ("varint").
pub fn write_compact_size(w: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xFC => w.push(n as u8),
        0xFD..=0xFFFF => {
            w.push(0xFD);
            w.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            w.push(0xFE);
            w.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            w.push(0xFF);
            w.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Read a Bitcoin compact size, advancing the cursor.
pub fn read_compact_size(r: &mut &[u8]) -> Result<u64, Error> {
    let first = read_u8(r)?;
    Ok(match first {
        0xFD => u16::from_le_bytes(read_array::<2>(r)?) as u64,
        0xFE => u32::from_le_bytes(read_array::<4>(r)?) as u64,
        0xFF => u64::from_le_bytes(read_array::<8>(r)?),
        n => n as u64,
    })
}

/// Read one byte, advancing the cursor.
pub fn read_u8(r: &mut &[u8]) -> Result<u8, Error> {
    let (&first, rest) = r.split_first().ok_or(Error::UnexpectedEof)?;
    *r = rest;
    Ok(first)
}

/// Read a fixed-width array, advancing the cursor.
pub fn read_array<const N: usize>(r: &mut &[u8]) -> Result<[u8; N], Error> {
    if r.len() < N {
        return Err(Error::UnexpectedEof);
    }
    let (head, rest) = r.split_at(N);
    *r = rest;
    Ok(<[u8; N]>::try_from(head).expect("split at N"))
}

/// Read `n` bytes, advancing the cursor.
pub fn read_slice<'a>(r: &mut &'a [u8], n: usize) -> Result<&'a [u8], Error> {
    if r.len() < n {
        return Err(Error::UnexpectedEof);
    }
    let (head, rest) = r.split_at(n);
    *r = rest;
    Ok(head)
}

/// Read a length-prefixed byte vector, advancing the cursor.
pub fn read_vec(r: &mut &[u8]) -> Result<Vec<u8>, Error> {
    let len = read_compact_size(r)?;
    if len > r.len() as u64 {
        return Err(Error::UnexpectedEof);
    }
    Ok(read_slice(r, len as usize)?.to_vec())
}

/// Write a length-prefixed byte vector.
pub fn write_vec(w: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(w, bytes.len() as u64);
    w.extend_from_slice(bytes);
}

/// Write a record key: type byte plus key data, length-prefixed.
pub fn write_key(w: &mut Vec<u8>, type_value: u8, key_data: &[u8]) {
    write_compact_size(w, 1 + key_data.len() as u64);
    w.push(type_value);
    w.extend_from_slice(key_data);
}

/// Write a whole record: key and value.
pub fn write_pair(w: &mut Vec<u8>, type_value: u8, key_data: &[u8], value: &[u8]) {
    write_key(w, type_value, key_data);
    write_vec(w, value);
}

/// Numeric fields are serialized as length-prefixed inner buffers; the
/// inner parser must consume the whole buffer.
pub fn read_u32_value(r: &mut &[u8]) -> Result<u32, Error> {
    let value = read_vec(r)?;
    let bytes = <[u8; 4]>::try_from(value.as_slice()).map_err(|_| Error::UnexpectedEof)?;
    Ok(u32::from_le_bytes(bytes))
}

/// As [`read_u32_value`], for 64-bit fields.
pub fn read_u64_value(r: &mut &[u8]) -> Result<u64, Error> {
    let value = read_vec(r)?;
    let bytes = <[u8; 8]>::try_from(value.as_slice()).map_err(|_| Error::UnexpectedEof)?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_size_roundtrip() {
        for n in [0u64, 1, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_compact_size(&mut buf, n);
            let mut cursor = buf.as_slice();
            assert_eq!(read_compact_size(&mut cursor).unwrap(), n);
            assert!(cursor.is_empty());
        }
        // Boundary encodings have the expected widths.
        let mut buf = Vec::new();
        write_compact_size(&mut buf, 0xFC);
        assert_eq!(buf, vec![0xFC]);
        let mut buf = Vec::new();
        write_compact_size(&mut buf, 0xFD);
        assert_eq!(buf, vec![0xFD, 0xFD, 0x00]);
    }

    #[test]
    fn vec_roundtrip() {
        let mut buf = Vec::new();
        write_vec(&mut buf, b"abc");
        write_vec(&mut buf, b"");
        let mut cursor = buf.as_slice();
        assert_eq!(read_vec(&mut cursor).unwrap(), b"abc");
        assert_eq!(read_vec(&mut cursor).unwrap(), b"");
        assert!(read_vec(&mut cursor).is_err());
    }

    #[test]
    fn truncated_input() {
        let mut cursor: &[u8] = &[0xFD, 0x01];
        assert_eq!(read_compact_size(&mut cursor), Err(Error::UnexpectedEof));
        // A declared length larger than the remaining bytes must not
        // allocate.
        let mut cursor: &[u8] = &[0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];
        assert_eq!(read_vec(&mut cursor), Err(Error::UnexpectedEof));
    }
}
