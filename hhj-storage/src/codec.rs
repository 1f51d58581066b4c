//! Spill file layout.
//!
//! ```text
//! header : MAGIC (4 bytes) | VERSION (u16 LE) | reserved (u16, 0)
//! frame* : payload length (u32 LE) | bitcode-encoded Row
//! ```
//!
//! Files are append-only. A writer reopened after eviction continues after
//! the last complete frame; the header is written exactly once, when the file
//! is created.

use std::io::{self, Read, Write};

use hhj_result::{Error, Result};
use hhj_types::Row;

pub const SPILL_MAGIC: [u8; 4] = *b"HHJS";
pub const SPILL_VERSION: u16 = 1;
const HEADER_LEN: usize = 8;
const FRAME_LEN_BYTES: usize = 4;

pub(crate) fn write_header<W: Write>(writer: &mut W) -> io::Result<()> {
    let mut buf = [0u8; HEADER_LEN];
    buf[..4].copy_from_slice(&SPILL_MAGIC);
    buf[4..6].copy_from_slice(&SPILL_VERSION.to_le_bytes());
    writer.write_all(&buf)
}

pub(crate) fn read_header<R: Read>(reader: &mut R) -> Result<()> {
    let mut buf = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut buf)
        .map_err(|e| Error::SpillCorrupted(format!("read spill header failed: {e}")))?;
    if buf[..4] != SPILL_MAGIC {
        return Err(Error::SpillCorrupted("spill header magic mismatch".into()));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != SPILL_VERSION {
        return Err(Error::SpillCorrupted(format!(
            "unsupported spill file version: {version}"
        )));
    }
    Ok(())
}

/// Append one row; returns the number of bytes written.
pub(crate) fn write_frame<W: Write>(writer: &mut W, row: &Row) -> io::Result<usize> {
    let payload = bitcode::encode(row);
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "spilled row exceeds 4 GiB"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(FRAME_LEN_BYTES + payload.len())
}

/// Read the next frame into `buf` and decode it. `Ok(None)` at a clean end of
/// file; a file that ends mid-frame is corrupt.
pub(crate) fn read_frame<R: Read>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<Row>> {
    let mut len_bytes = [0u8; FRAME_LEN_BYTES];
    let mut filled = 0;
    while filled < FRAME_LEN_BYTES {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(Error::SpillCorrupted(
                    "spill file ends inside a frame header".into(),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::Io(e)),
        }
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    buf.clear();
    buf.resize(len, 0);
    reader
        .read_exact(buf)
        .map_err(|e| Error::SpillCorrupted(format!("truncated spill frame: {e}")))?;
    let row = bitcode::decode::<Row>(buf.as_slice())
        .map_err(|e| Error::SpillCorrupted(format!("decode spilled row failed: {e}")))?;
    Ok(Some(row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hhj_types::Value;
    use std::io::Cursor;

    #[test]
    fn test_frames_survive_a_file_roundtrip() {
        let rows = vec![
            Row::new(1, vec![Value::Int64(7), Value::Utf8("seven".into())]),
            Row::new(2, vec![Value::Null, Value::Binary(vec![1, 2, 3])]),
        ];
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        for row in &rows {
            write_frame(&mut buf, row).unwrap();
        }

        let mut cursor = Cursor::new(buf);
        read_header(&mut cursor).unwrap();
        let mut scratch = Vec::new();
        let mut decoded = Vec::new();
        while let Some(row) = read_frame(&mut cursor, &mut scratch).unwrap() {
            decoded.push(row);
        }
        assert_eq!(decoded, rows);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut cursor = Cursor::new(b"NOPE\x01\x00\x00\x00".to_vec());
        assert!(matches!(
            read_header(&mut cursor),
            Err(Error::SpillCorrupted(_))
        ));
    }

    #[test]
    fn test_truncated_frame_is_corrupt() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Row::new(9, vec![Value::Int64(1)])).unwrap();
        buf.truncate(buf.len() - 1);
        let mut scratch = Vec::new();
        let result = read_frame(&mut Cursor::new(buf), &mut scratch);
        assert!(matches!(result, Err(Error::SpillCorrupted(_))));
    }
}
