//! Inter-stage wire protocol (spec.md §4.1 / C1): one JSON header line
//! followed by zero or more length-prefixed PCM chunks, terminated by EOF,
//! flushing after every write so downstream can start before upstream
//! finishes producing.

use crate::error::PipelineError;
use crate::metadata::AudioMetadata;
use std::io::{Read, Write};

/// Maximum header size in bytes before the closing `}` (spec.md §4.1).
pub const MAX_HEADER_BYTES: usize = 100_000;

/// Writes the JSON header line. Readers accept LF or CRLF; we always emit LF.
pub fn write_header<W: Write>(out: &mut W, header: &AudioMetadata) -> Result<(), PipelineError> {
    let json = serde_json::to_string(header)
        .map_err(|e| PipelineError::InvalidMessageFormat(e.to_string()))?;
    out.write_all(json.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

/// Reads the JSON header line. The first non-whitespace byte MUST be `{`;
/// anything else, or a header exceeding `MAX_HEADER_BYTES` before the
/// newline, is `InvalidMessageFormat`.
pub fn read_header<R: Read>(input: &mut R) -> Result<AudioMetadata, PipelineError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = input
            .read(&mut byte)
            .map_err(|e| PipelineError::ProtocolViolation(e.to_string()))?;
        if n == 0 {
            return Err(PipelineError::InvalidMessageFormat(
                "EOF before header terminator".into(),
            ));
        }
        if buf.is_empty() && byte[0] != b'{' {
            return Err(PipelineError::InvalidMessageFormat(
                "header must start with '{'".into(),
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(PipelineError::InvalidMessageFormat(
                "header exceeds 100000 bytes".into(),
            ));
        }
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    serde_json::from_slice(&buf).map_err(|e| PipelineError::InvalidMessageFormat(e.to_string()))
}

/// Writes one PCM chunk: an 8-byte little-endian length followed by the
/// interleaved float32 samples in native (little-endian) byte order.
/// Flushes afterward so downstream can start before upstream finishes.
pub fn write_chunk<W: Write>(out: &mut W, samples: &[f32]) -> Result<(), PipelineError> {
    let byte_len = (samples.len() * 4) as u64;
    out.write_all(&byte_len.to_le_bytes())?;
    let mut raw = Vec::with_capacity(samples.len() * 4);
    for s in samples {
        raw.extend_from_slice(&s.to_le_bytes());
    }
    out.write_all(&raw)?;
    out.flush()?;
    Ok(())
}

/// Reads one PCM chunk. Returns `Ok(None)` on EOF encountered anywhere while
/// reading the 8-byte size prefix — including a partially read prefix — per
/// spec.md §4.1: "a partially read size header at EOF is not an error, it is
/// end-of-stream." Truncation inside the payload that follows a complete
/// size header, or a size not a multiple of `4 * channels`, is a genuine
/// `InvalidMessageFormat`.
pub fn read_chunk<R: Read>(
    input: &mut R,
    channels: u16,
) -> Result<Option<Vec<f32>>, PipelineError> {
    let mut len_buf = [0u8; 8];
    let mut read_so_far = 0usize;
    while read_so_far < 8 {
        let n = input
            .read(&mut len_buf[read_so_far..])
            .map_err(|e| PipelineError::ProtocolViolation(e.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        read_so_far += n;
    }
    let byte_len = u64::from_le_bytes(len_buf) as usize;
    let frame_bytes = 4 * channels as usize;
    if frame_bytes == 0 || byte_len % frame_bytes != 0 {
        return Err(PipelineError::InvalidMessageFormat(format!(
            "chunk byte length {byte_len} is not a multiple of 4*channels ({frame_bytes})"
        )));
    }
    let mut data = vec![0u8; byte_len];
    input
        .read_exact(&mut data)
        .map_err(|_| PipelineError::InvalidMessageFormat("truncated chunk payload".into()))?;
    let samples = data
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Some(samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trips() {
        let meta = AudioMetadata {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 32,
            title: Some("Test".into()),
            ..Default::default()
        };
        let mut buf = Vec::new();
        write_header(&mut buf, &meta).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));
        let mut cursor = Cursor::new(buf);
        let read_back = read_header(&mut cursor).unwrap();
        assert_eq!(read_back.sample_rate, 48_000);
        assert_eq!(read_back.title.as_deref(), Some("Test"));
    }

    #[test]
    fn header_rejects_non_brace_start() {
        let mut cursor = Cursor::new(b"not json\n".to_vec());
        assert!(matches!(
            read_header(&mut cursor),
            Err(PipelineError::InvalidMessageFormat(_))
        ));
    }

    #[test]
    fn header_rejects_oversized_input() {
        let mut data = vec![b'{'];
        data.extend(std::iter::repeat(b' ').take(MAX_HEADER_BYTES + 10));
        data.push(b'\n');
        let mut cursor = Cursor::new(data);
        assert!(matches!(
            read_header(&mut cursor),
            Err(PipelineError::InvalidMessageFormat(_))
        ));
    }

    #[test]
    fn chunk_round_trips() {
        let samples = vec![0.0_f32, 1.0, -1.0, 0.5];
        let mut buf = Vec::new();
        write_chunk(&mut buf, &samples).unwrap();
        let mut cursor = Cursor::new(buf);
        let read_back = read_chunk(&mut cursor, 2).unwrap().unwrap();
        assert_eq!(read_back, samples);
    }

    #[test]
    fn clean_eof_at_chunk_boundary_is_not_an_error() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result = read_chunk(&mut cursor, 2).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn partial_size_header_at_eof_is_end_of_stream() {
        let mut cursor = Cursor::new(vec![1u8, 2, 3]);
        let result = read_chunk(&mut cursor, 2).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn non_multiple_of_frame_size_is_invalid_message_format() {
        let mut buf = Vec::new();
        let bad_len: u64 = 5;
        buf.extend_from_slice(&bad_len.to_le_bytes());
        buf.extend_from_slice(&[0u8; 5]);
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_chunk(&mut cursor, 2),
            Err(PipelineError::InvalidMessageFormat(_))
        ));
    }
}
