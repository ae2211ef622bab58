//! Self-describing chunked binary container
//!
//! A chunk is a length-prefixed block with id/version framing and a verifying
//! trailer:
//!
//! ```text
//! u32 id | u32 version | u64 size | <size payload bytes>
//! zero padding until the trailer is 16-byte aligned
//! u64 size | u32 version | u32 id
//! ```
//!
//! Chunks nest: a parent's payload may itself contain chunks. Reader and
//! writer keep an explicit stack of open frames; every `start_chunk` must be
//! matched by exactly one `end_chunk` before the parent ends. Unknown chunk
//! ids encountered while reading are skipped via [`ChunkReader::skip_chunk`],
//! never treated as fatal, so older readers stay compatible with newer files.

use crate::error::{Error, Result};
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::warn;

/// Pack a 4-byte tag into a chunk id, low 7 bits of each byte.
pub const fn chunk_id(tag: &[u8; 4]) -> u32 {
    ((tag[3] & 0x7f) as u32) << 24
        | ((tag[2] & 0x7f) as u32) << 16
        | ((tag[1] & 0x7f) as u32) << 8
        | (tag[0] & 0x7f) as u32
}

const ALIGN: u64 = 16;

fn pad_len(size: u64) -> u64 {
    (ALIGN - size % ALIGN) % ALIGN
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    id: u32,
    version: u32,
    start: u64,
    size: u64,
}

/// Stack-based reader over a chunked stream
pub struct ChunkReader<R: Read + Seek> {
    inner: R,
    frames: Vec<Frame>,
}

impl<R: Read + Seek> ChunkReader<R> {
    pub fn new(inner: R) -> Self {
        ChunkReader {
            inner,
            frames: Vec::new(),
        }
    }

    /// Read the next chunk header relative to the currently open parent.
    ///
    /// Returns `Ok(None)` once the cursor has reached the end of the parent's
    /// payload; the caller should then `end_chunk` the parent.
    pub fn start_chunk(&mut self) -> Result<Option<(u32, u32)>> {
        let pos = self.inner.stream_position()?;
        if let Some(parent) = self.frames.last() {
            let end = parent.start + parent.size;
            if pos == end {
                return Ok(None);
            }
            if pos > end {
                return Err(Error::MalformedStream(format!(
                    "cursor {pos} is {} bytes past the end of chunk {:08x}",
                    pos - end,
                    parent.id
                )));
            }
        }

        let id = self.read_u32()?;
        let version = self.read_u32()?;
        let size = self.read_u64()?;
        let start = self.inner.stream_position()?;

        self.frames.push(Frame {
            id,
            version,
            start,
            size,
        });
        Ok(Some((id, version)))
    }

    /// Close the innermost chunk: seek to its payload end, skip padding and
    /// verify that the trailer mirrors the header.
    pub fn end_chunk(&mut self) -> Result<()> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| Error::MalformedStream("end_chunk without open chunk".into()))?;

        let end = frame.start + frame.size;
        let pos = self.inner.stream_position()?;
        if pos != end {
            warn!(
                id = frame.id,
                drift = end as i64 - pos as i64,
                "end_chunk called away from the chunk end, correcting"
            );
            self.inner.seek(SeekFrom::Start(end))?;
        }

        let pad = pad_len(frame.size);
        if pad != 0 {
            self.inner.seek(SeekFrom::Current(pad as i64))?;
        }

        let size = self.read_u64()?;
        let version = self.read_u32()?;
        let id = self.read_u32()?;

        if size != frame.size || version != frame.version || id != frame.id {
            return Err(Error::TrailerMismatch);
        }
        Ok(())
    }

    /// Discard the open chunk's payload without decoding it, then `end_chunk`.
    pub fn skip_chunk(&mut self) -> Result<()> {
        let frame = *self
            .frames
            .last()
            .ok_or_else(|| Error::MalformedStream("skip_chunk without open chunk".into()))?;
        self.inner.seek(SeekFrom::Start(frame.start + frame.size))?;
        self.end_chunk()
    }

    pub fn chunk_id(&self) -> Option<u32> {
        self.frames.last().map(|f| f.id)
    }

    pub fn chunk_version(&self) -> Option<u32> {
        self.frames.last().map(|f| f.version)
    }

    pub fn chunk_size(&self) -> Option<u64> {
        self.frames.last().map(|f| f.size)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// u32 length prefix followed by UTF-8 bytes
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|e| Error::Decode(e.to_string()))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner
            .read_exact(buf)
            .map_err(|e| Error::MalformedStream(e.to_string()))
    }
}

/// Stack-based writer mirroring [`ChunkReader`]
///
/// `start_chunk` reserves an 8-byte size placeholder; `end_chunk` backpatches
/// the real payload size and appends padding plus the trailer.
pub struct ChunkWriter<W: Write + Seek> {
    inner: W,
    frames: Vec<Frame>,
}

impl<W: Write + Seek> ChunkWriter<W> {
    pub fn new(inner: W) -> Self {
        ChunkWriter {
            inner,
            frames: Vec::new(),
        }
    }

    pub fn start_chunk(&mut self, id: u32, version: u32) -> Result<()> {
        self.write_u32(id)?;
        self.write_u32(version)?;
        self.write_u64(0)?; // size placeholder
        let start = self.inner.stream_position()?;
        self.frames.push(Frame {
            id,
            version,
            start,
            size: 0,
        });
        Ok(())
    }

    pub fn end_chunk(&mut self) -> Result<()> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| Error::MalformedStream("end_chunk without open chunk".into()))?;

        let end = self.inner.stream_position()?;
        let size = end - frame.start;

        // backpatch the size placeholder
        self.inner.seek(SeekFrom::Start(frame.start - 8))?;
        self.write_u64(size)?;
        self.inner.seek(SeekFrom::Start(end))?;

        let pad = pad_len(size);
        if pad != 0 {
            const ZEROES: [u8; 16] = [0u8; 16];
            self.inner.write_all(&ZEROES[..pad as usize])?;
        }

        self.write_u64(size)?;
        self.write_u32(frame.version)?;
        self.write_u32(frame.id)?;
        Ok(())
    }

    /// Consume the writer, failing if any chunk is still open.
    pub fn finish(self) -> Result<W> {
        if !self.frames.is_empty() {
            return Err(Error::MalformedStream(format!(
                "{} chunk(s) left open",
                self.frames.len()
            )));
        }
        Ok(self.inner)
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        Ok(self.inner.write_all(&[v])?)
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        Ok(self.inner.write_all(&v.to_le_bytes())?)
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        Ok(self.inner.write_all(&v.to_le_bytes())?)
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        Ok(self.inner.write_all(&v.to_le_bytes())?)
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        Ok(self.inner.write_all(&v.to_le_bytes())?)
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        Ok(self.inner.write_all(&v.to_le_bytes())?)
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        Ok(self.inner.write_all(&v.to_le_bytes())?)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        Ok(self.inner.write_all(bytes)?)
    }

    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_u32(s.len() as u32)?;
        self.write_bytes(s.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const OUTER: u32 = chunk_id(b"OUTR");
    const INNER: u32 = chunk_id(b"INNR");

    fn write_nested() -> Vec<u8> {
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.start_chunk(OUTER, 1).unwrap();
        w.write_string("hello").unwrap();
        w.start_chunk(INNER, 2).unwrap();
        w.write_u32(0xdeadbeef).unwrap();
        w.end_chunk().unwrap();
        w.end_chunk().unwrap();
        w.finish().unwrap().into_inner()
    }

    #[test]
    fn test_nested_roundtrip() {
        let bytes = write_nested();

        let mut r = ChunkReader::new(Cursor::new(bytes));
        let (id, version) = r.start_chunk().unwrap().unwrap();
        assert_eq!(id, OUTER);
        assert_eq!(version, 1);
        assert_eq!(r.read_string().unwrap(), "hello");

        let (id, version) = r.start_chunk().unwrap().unwrap();
        assert_eq!(id, INNER);
        assert_eq!(version, 2);
        assert_eq!(r.read_u32().unwrap(), 0xdeadbeef);
        r.end_chunk().unwrap();

        // parent payload exhausted
        assert!(r.start_chunk().unwrap().is_none());
        r.end_chunk().unwrap();
    }

    #[test]
    fn test_skip_unknown_chunk() {
        let bytes = write_nested();

        let mut r = ChunkReader::new(Cursor::new(bytes));
        r.start_chunk().unwrap().unwrap();
        r.read_string().unwrap();
        r.start_chunk().unwrap().unwrap();
        r.skip_chunk().unwrap();
        r.end_chunk().unwrap();
    }

    #[test]
    fn test_trailer_corruption_detected() {
        let mut bytes = write_nested();
        // flip a byte in the outer trailer (last 16 bytes)
        let n = bytes.len();
        bytes[n - 1] ^= 0x01;

        let mut r = ChunkReader::new(Cursor::new(bytes));
        r.start_chunk().unwrap().unwrap();
        r.read_string().unwrap();
        r.start_chunk().unwrap().unwrap();
        r.skip_chunk().unwrap();
        assert!(matches!(r.end_chunk(), Err(Error::TrailerMismatch)));
    }

    #[test]
    fn test_truncated_stream_is_malformed() {
        let mut bytes = write_nested();
        bytes.truncate(bytes.len() / 2);

        let mut r = ChunkReader::new(Cursor::new(bytes));
        r.start_chunk().unwrap().unwrap();
        r.read_string().unwrap();
        r.start_chunk().unwrap().unwrap();
        let err = r.skip_chunk().unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedStream(_) | Error::TrailerMismatch
        ));
    }

    #[test]
    fn test_read_past_parent_end_is_malformed() {
        let bytes = write_nested();

        let mut r = ChunkReader::new(Cursor::new(bytes));
        r.start_chunk().unwrap().unwrap();
        let size = r.chunk_size().unwrap();
        // overshoot the declared payload end into the padding and trailer
        r.read_bytes(size as usize + 1).unwrap();
        assert!(matches!(
            r.start_chunk(),
            Err(Error::MalformedStream(_))
        ));
    }

    #[test]
    fn test_drift_is_corrected() {
        let bytes = write_nested();

        let mut r = ChunkReader::new(Cursor::new(bytes));
        r.start_chunk().unwrap().unwrap();
        // do not consume the payload at all; end_chunk must seek past it
        // after skipping the nested chunk bytes
        let frame_size = r.chunk_size().unwrap();
        assert!(frame_size > 0);
        r.skip_chunk().unwrap();
    }

    #[test]
    fn test_finish_with_open_chunk_fails() {
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.start_chunk(OUTER, 1).unwrap();
        assert!(w.finish().is_err());
    }

    #[test]
    fn test_chunk_id_packing() {
        // low 7 bits of each tag byte, first byte in the low bits
        assert_eq!(chunk_id(b"BSDB") & 0x7f, b'B' as u32);
        assert_ne!(chunk_id(b"COL "), chunk_id(b"CAT "));
    }
}
