//! Cross-module wire protocol contract: a header followed by chunks must
//! round-trip through `write_header`/`read_header` and `write_chunk`/
//! `read_chunk` exactly, and EOF mid-frame must be treated as clean
//! end-of-stream rather than an error (spec.md §4.1).

use flowcast_core::metadata::AudioMetadata;
use flowcast_core::protocol;
use std::io::Cursor;

fn sample_metadata() -> AudioMetadata {
    AudioMetadata {
        title: Some("Test Track".into()),
        sample_rate: 48_000,
        channels: 2,
        bit_depth: 32,
        ..Default::default()
    }
}

#[test]
fn header_and_chunks_round_trip_through_a_session() {
    let meta = sample_metadata();
    let chunk_a = vec![0.1_f32, -0.1, 0.2, -0.2];
    let chunk_b = vec![0.3_f32, -0.3];

    let mut buf = Vec::new();
    protocol::write_header(&mut buf, &meta).unwrap();
    protocol::write_chunk(&mut buf, &chunk_a).unwrap();
    protocol::write_chunk(&mut buf, &chunk_b).unwrap();

    let mut cursor = Cursor::new(buf);
    let read_meta = protocol::read_header(&mut cursor).unwrap();
    assert_eq!(read_meta.sample_rate, meta.sample_rate);
    assert_eq!(read_meta.channels, meta.channels);
    assert_eq!(read_meta.title, meta.title);

    let first = protocol::read_chunk(&mut cursor, meta.channels).unwrap().unwrap();
    assert_eq!(first, chunk_a);
    let second = protocol::read_chunk(&mut cursor, meta.channels).unwrap().unwrap();
    assert_eq!(second, chunk_b);
    let eof = protocol::read_chunk(&mut cursor, meta.channels).unwrap();
    assert!(eof.is_none());
}

#[test]
fn truncated_length_prefix_at_eof_is_clean_end_of_stream() {
    let meta = sample_metadata();
    let mut buf = Vec::new();
    protocol::write_header(&mut buf, &meta).unwrap();
    // A length prefix is 8 bytes; write only 3 and stop, as a producer
    // killed mid-write would leave on the pipe.
    buf.extend_from_slice(&[1, 2, 3]);

    let mut cursor = Cursor::new(buf);
    protocol::read_header(&mut cursor).unwrap();
    let result = protocol::read_chunk(&mut cursor, meta.channels).unwrap();
    assert!(result.is_none());
}

#[test]
fn chunk_length_not_a_multiple_of_frame_size_is_rejected() {
    let meta = sample_metadata();
    let mut buf = Vec::new();
    protocol::write_header(&mut buf, &meta).unwrap();
    // 6 bytes declared, but a stereo frame needs 4*2 = 8-byte multiples.
    buf.extend_from_slice(&6u64.to_le_bytes());
    buf.extend_from_slice(&[0u8; 6]);

    let mut cursor = Cursor::new(buf);
    protocol::read_header(&mut cursor).unwrap();
    let result = protocol::read_chunk(&mut cursor, meta.channels);
    assert!(result.is_err());
}

#[test]
fn header_not_starting_with_brace_is_rejected() {
    let mut cursor = Cursor::new(b"not json\n".to_vec());
    let result = protocol::read_header(&mut cursor);
    assert!(result.is_err());
}
