//! On-disk encoding shared by the tensor store and the step cache.
//!
//! A block is `[i64 element_count][element_count x f32]`, little endian.
//! Index entries are `[u32 name_len][name bytes][i64 offset]`.

use std::io::{Read, Write};

use crate::error::{LstmError, Result};

/// Bytes a block of `elements` floats occupies, header included.
pub fn block_len(elements: usize) -> u64 {
    8 + 4 * elements as u64
}

pub fn encode_block(values: &[f32], out: &mut Vec<u8>) {
    out.reserve(block_len(values.len()) as usize);
    out.extend_from_slice(&(values.len() as i64).to_le_bytes());
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

pub fn write_block<W: Write>(w: &mut W, values: &[f32]) -> Result<()> {
    let mut buf = Vec::new();
    encode_block(values, &mut buf);
    w.write_all(&buf)?;
    Ok(())
}

/// Read one block, checking its element count against `expected`.
/// `context` names the tensor in the error.
pub fn read_block<R: Read>(r: &mut R, expected: usize, context: &str) -> Result<Vec<f32>> {
    let count = read_i64(r)?;
    if count < 0 || count as usize != expected {
        return Err(LstmError::shape_mismatch(context, expected, count.max(0) as usize));
    }
    let mut bytes = vec![0u8; expected * 4];
    r.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn encode_index_entry(name: &str, offset: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&(offset as i64).to_le_bytes());
}

/// `Ok(None)` on a clean end of stream before the entry starts.
pub fn read_index_entry<R: Read>(r: &mut R) -> Result<Option<(String, u64)>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let name_len = u32::from_le_bytes(len_buf) as usize;
    let mut name = vec![0u8; name_len];
    r.read_exact(&mut name)?;
    let name = String::from_utf8(name).map_err(|e| {
        LstmError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    let offset = read_i64(r)?;
    if offset < 0 {
        return Err(LstmError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("negative offset {} for `{}`", offset, name),
        )));
    }
    Ok(Some((name, offset as u64)))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn block_layout_is_count_then_floats() {
        let mut buf = Vec::new();
        encode_block(&[1.5, -2.0], &mut buf);
        assert_eq!(buf.len() as u64, block_len(2));
        assert_eq!(&buf[..8], &2i64.to_le_bytes());
        assert_eq!(&buf[8..12], &1.5f32.to_le_bytes());
        let back = read_block(&mut Cursor::new(&buf), 2, "t").unwrap();
        assert_eq!(back, vec![1.5, -2.0]);
    }

    #[test]
    fn count_disagreement_is_shape_mismatch() {
        let mut buf = Vec::new();
        encode_block(&[0.0; 3], &mut buf);
        let err = read_block(&mut Cursor::new(&buf), 4, "w_f").unwrap_err();
        assert!(matches!(err, LstmError::ShapeMismatch { expected: 4, found: 3, .. }));
    }

    #[test]
    fn index_entries_stream_until_eof() {
        let mut buf = Vec::new();
        encode_index_entry("Input", 0, &mut buf);
        encode_index_entry("HiddenPrev", 24, &mut buf);
        let mut cur = Cursor::new(&buf);
        assert_eq!(read_index_entry(&mut cur).unwrap(), Some(("Input".to_string(), 0)));
        assert_eq!(read_index_entry(&mut cur).unwrap(), Some(("HiddenPrev".to_string(), 24)));
        assert_eq!(read_index_entry(&mut cur).unwrap(), None);
    }
}
