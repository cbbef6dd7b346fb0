//! DSD decoder (spec.md §4.2 / C2): parses DSF and DSDIFF containers and
//! decimates 1-bit DSD to multichannel float PCM, using the fixed gain
//! constant (64.0) and MSB-first bit order spec.md §4.2 spells out.

use crate::error::PipelineError;
use crate::metadata::AudioMetadata;
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Fixed gain applied after averaging D DSD bits, compensating DSD RMS vs
/// PCM levels. Unverified against reference DSD decoders bit-for-bit — see
/// spec.md §9 Open Questions and DESIGN.md.
const DSD_GAIN: f32 = 64.0;

/// Refuse to decode DSD payloads larger than this (spec.md §4.2 bounds contract).
const MAX_DSD_BYTES: u64 = 1 << 30;

/// Target granularity for `stream()`'s `emit_cb` calls.
const EMIT_THRESHOLD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecimationFactor {
    Sixteen = 16,
    ThirtyTwo = 32,
    SixtyFour = 64,
}

impl DecimationFactor {
    pub fn value(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for DecimationFactor {
    type Error = PipelineError;
    fn try_from(value: u32) -> Result<Self, PipelineError> {
        match value {
            16 => Ok(DecimationFactor::Sixteen),
            32 => Ok(DecimationFactor::ThirtyTwo),
            64 => Ok(DecimationFactor::SixtyFour),
            other => Err(PipelineError::InvalidArgument(format!(
                "decimation factor must be 16, 32 or 64, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsdContainer {
    Dsf,
    Dsdiff,
}

/// Result of the decoder's `prepare` phase: everything needed to stream
/// without having decoded a single sample yet.
#[derive(Debug, Clone)]
pub struct DsdFileInfo {
    pub container: DsdContainer,
    pub dsd_sample_rate: u32,
    pub channels: u16,
    pub sample_count: u64,
    pub data_offset: u64,
    pub data_len: u64,
    pub block_size_per_channel: Option<u32>,
}

impl DsdFileInfo {
    pub fn to_metadata(&self, decimation: DecimationFactor, file_path: &str) -> AudioMetadata {
        let output_rate = self.dsd_sample_rate / decimation.value();
        let mut meta = AudioMetadata {
            sample_rate: output_rate,
            original_sample_rate: self.dsd_sample_rate,
            bit_depth: 32,
            original_bit_depth: 1,
            channels: self.channels,
            sample_count: self.sample_count / decimation.value() as u64,
            container: Some(match self.container {
                DsdContainer::Dsf => "DSF".to_string(),
                DsdContainer::Dsdiff => "DSDIFF".to_string(),
            }),
            is_lossless: true,
            file_path: Some(file_path.to_string()),
            ..Default::default()
        };
        meta.recompute_high_res();
        meta
    }
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}
fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}
fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
fn le_u64(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Phase one of the two-phase streaming interface (spec.md §4.2): opens the
/// file, reads and validates its chunk structure, and records the data
/// region's offset/length without decoding a single sample.
pub fn prepare(path: &Path) -> Result<DsdFileInfo, PipelineError> {
    let mut file =
        File::open(path).map_err(|e| PipelineError::FileNotFound(format!("{}: {e}", path.display())))?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;

    if &magic == b"DSD " {
        parse_dsf(file)
    } else if &magic == b"FRM8" {
        parse_dsdiff(file)
    } else {
        Err(PipelineError::UnsupportedFormat(
            "not a DSF or DSDIFF file".into(),
        ))
    }
}

fn parse_dsf(mut file: File) -> Result<DsdFileInfo, PipelineError> {
    // "DSD " chunk: id(4, already consumed) + chunk_size(8 LE) + file_size(8 LE) + padding(8 LE) = 28 bytes total.
    let mut header_rest = [0u8; 24];
    file.read_exact(&mut header_rest)
        .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;

    let mut fmt_id = [0u8; 4];
    file.read_exact(&mut fmt_id)
        .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
    if &fmt_id != b"fmt " {
        return Err(PipelineError::CorruptedFile(
            "expected 'fmt ' chunk after 'DSD ' header".into(),
        ));
    }
    let mut fmt_size_buf = [0u8; 8];
    file.read_exact(&mut fmt_size_buf)
        .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
    let fmt_size = le_u64(&fmt_size_buf);
    let mut fmt_body = vec![0u8; (fmt_size - 12) as usize];
    file.read_exact(&mut fmt_body)
        .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
    if fmt_body.len() < 40 {
        return Err(PipelineError::CorruptedFile("fmt chunk too short".into()));
    }

    let format_id = le_u32(&fmt_body[4..8]);
    if format_id != 0 {
        return Err(PipelineError::UnsupportedFormat(
            "DSF format_id != 0 (not raw DSD)".into(),
        ));
    }
    let channel_num = le_u32(&fmt_body[12..16]) as u16;
    let sampling_freq = le_u32(&fmt_body[16..20]);
    let bits_per_sample = le_u32(&fmt_body[20..24]);
    if bits_per_sample != 1 {
        return Err(PipelineError::UnsupportedFormat(
            "only 1-bit DSF samples are supported".into(),
        ));
    }
    let sample_count = le_u64(&fmt_body[24..32]);
    let block_size_per_channel = le_u32(&fmt_body[32..36]);

    let mut data_id = [0u8; 4];
    file.read_exact(&mut data_id)
        .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
    if &data_id != b"data" {
        return Err(PipelineError::CorruptedFile(
            "expected 'data' chunk after 'fmt '".into(),
        ));
    }
    let mut data_size_buf = [0u8; 8];
    file.read_exact(&mut data_size_buf)
        .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
    let data_chunk_size = le_u64(&data_size_buf);
    let data_len = data_chunk_size - 12;
    let data_offset = 28 + fmt_size + 12;

    if data_len > MAX_DSD_BYTES {
        return Err(PipelineError::OutOfMemory(format!(
            "DSD data region {data_len} bytes exceeds 1 GiB cap"
        )));
    }

    Ok(DsdFileInfo {
        container: DsdContainer::Dsf,
        dsd_sample_rate: sampling_freq,
        channels: channel_num,
        sample_count,
        data_offset,
        data_len,
        block_size_per_channel: Some(block_size_per_channel),
    })
}

fn parse_dsdiff(mut file: File) -> Result<DsdFileInfo, PipelineError> {
    // FRM8 container: id(4, consumed) + size(8 BE) + type(4 = "DSD ").
    let mut size_buf = [0u8; 8];
    file.read_exact(&mut size_buf)
        .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
    let mut form_type = [0u8; 4];
    file.read_exact(&mut form_type)
        .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
    if &form_type != b"DSD " {
        return Err(PipelineError::CorruptedFile(
            "FRM8 container type is not 'DSD '".into(),
        ));
    }

    let mut sample_rate = 0u32;
    let mut channels = 0u16;
    let mut bits_per_sample = 0u32;
    let mut saw_prop = false;
    let mut data_offset = 0u64;
    let mut data_len = 0u64;
    let mut sample_count = 0u64;

    loop {
        let mut chunk_id = [0u8; 4];
        if file.read_exact(&mut chunk_id).is_err() {
            break; // EOF: end of top-level chunks.
        }
        let mut chunk_size_buf = [0u8; 8];
        file.read_exact(&mut chunk_size_buf)
            .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
        let chunk_size = be_u64(&chunk_size_buf);

        match &chunk_id {
            b"prop" => {
                let mut prop_type = [0u8; 4];
                file.read_exact(&mut prop_type)
                    .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
                let mut body = vec![0u8; (chunk_size - 4) as usize];
                file.read_exact(&mut body)
                    .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
                parse_dsdiff_prop_subchunks(&body, &mut sample_rate, &mut channels, &mut bits_per_sample)?;
                saw_prop = true;
            }
            b"DSD " => {
                if !saw_prop {
                    return Err(PipelineError::CorruptedFile(
                        "'prop' chunk must precede 'DSD ' payload in DSDIFF".into(),
                    ));
                }
                data_offset = file
                    .stream_position_checked()
                    .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
                data_len = chunk_size;
                if bits_per_sample != 1 {
                    return Err(PipelineError::UnsupportedFormat(
                        "only 1-bit DSDIFF samples are supported".into(),
                    ));
                }
                sample_count = (data_len * 8) / channels.max(1) as u64;
                if data_len > MAX_DSD_BYTES {
                    return Err(PipelineError::OutOfMemory(format!(
                        "DSD data region {data_len} bytes exceeds 1 GiB cap"
                    )));
                }
                // Chunks are padded to even length in IFF containers.
                let skip = chunk_size + (chunk_size % 2);
                file.seek_relative_checked(skip)
                    .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
                continue;
            }
            _ => {
                let skip = chunk_size + (chunk_size % 2);
                file.seek_relative_checked(skip)
                    .map_err(|e| PipelineError::CorruptedFile(e.to_string()))?;
            }
        }
    }

    if data_offset == 0 {
        return Err(PipelineError::CorruptedFile(
            "DSDIFF file has no 'DSD ' payload chunk".into(),
        ));
    }

    Ok(DsdFileInfo {
        container: DsdContainer::Dsdiff,
        dsd_sample_rate: sample_rate,
        channels,
        sample_count,
        data_offset,
        data_len,
        block_size_per_channel: None,
    })
}

fn parse_dsdiff_prop_subchunks(
    body: &[u8],
    sample_rate: &mut u32,
    channels: &mut u16,
    bits_per_sample: &mut u32,
) -> Result<(), PipelineError> {
    let mut pos = 0usize;
    while pos + 12 <= body.len() {
        let id = &body[pos..pos + 4];
        let size = be_u64(&body[pos + 4..pos + 12]) as usize;
        let start = pos + 12;
        let end = (start + size).min(body.len());
        let payload = &body[start..end];
        match id {
            b"FS  " if payload.len() >= 4 => *sample_rate = be_u32(payload),
            b"CHNL" if payload.len() >= 2 => {
                *channels = u16::from_be_bytes([payload[0], payload[1]])
            }
            _ => {}
        }
        if id == b"CMPR" {
            // Compression type; first 4 bytes are a fourCC, "DSD " means uncompressed 1-bit.
            if payload.len() >= 4 && &payload[0..4] == b"DSD " {
                *bits_per_sample = 1;
            }
        }
        pos = start + size + (size % 2);
    }
    // Some writers omit an explicit CMPR; default to raw DSD (1 bit).
    if *bits_per_sample == 0 {
        *bits_per_sample = 1;
    }
    Ok(())
}

/// Small seek helpers over plain `std::fs::File`, avoiding a new dependency.
trait FileSeekExt {
    fn stream_position_checked(&mut self) -> std::io::Result<u64>;
    fn seek_relative_checked(&mut self, delta: u64) -> std::io::Result<()>;
}

impl FileSeekExt for File {
    fn stream_position_checked(&mut self) -> std::io::Result<u64> {
        use std::io::Seek;
        self.stream_position()
    }
    fn seek_relative_checked(&mut self, delta: u64) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom};
        self.seek(SeekFrom::Current(delta as i64)).map(|_| ())
    }
}

/// Streaming decoder: decimates the DSD payload described by `info` into
/// float32 PCM, invoking `emit` with roughly `EMIT_THRESHOLD_BYTES` worth of
/// produced samples at a time. `emit` returning `false` stops the stream.
pub struct DsdDecoder {
    info: DsdFileInfo,
    decimation: DecimationFactor,
}

impl DsdDecoder {
    pub fn new(info: DsdFileInfo, decimation: DecimationFactor) -> Result<Self, PipelineError> {
        if info.dsd_sample_rate / decimation.value() == 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "sampling_freq {} / decimation {} == 0",
                info.dsd_sample_rate,
                decimation.value()
            )));
        }
        Ok(Self { info, decimation })
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.info.dsd_sample_rate / self.decimation.value()
    }

    pub fn stream(
        &self,
        path: &Path,
        mut emit: impl FnMut(&[f32]) -> bool,
    ) -> Result<(), PipelineError> {
        let file =
            File::open(path).map_err(|e| PipelineError::FileNotFound(format!("{}: {e}", path.display())))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| PipelineError::FileReadError(e.to_string()))?;

        let data_start = self.info.data_offset as usize;
        let data_end = data_start + self.info.data_len as usize;
        if data_end > mmap.len() {
            return Err(PipelineError::CorruptedFile(
                "declared DSD data region extends past end of file".into(),
            ));
        }
        let data = &mmap[data_start..data_end];

        let channels = self.info.channels as usize;
        let d = self.decimation.value() as usize;
        let channel_data_size = self.info.data_len as usize / channels.max(1);
        let total_dsd_bits = (self.info.data_len * 8) as u64;
        let frames_total = (channel_data_size * 8) / d;

        // DSF interleaves per-channel blocks of `block_size_per_channel` bytes
        // throughout the file (spec.md §4.2: "all bytes of ch0 block, then ch1
        // block, …"), so a channel's DSD bitstream is not contiguous in the
        // underlying byte buffer the way DSDIFF's is. `bits_per_block` is the
        // unit of that interleaving; for DSDIFF (truly planar) it degenerates
        // to the whole per-channel region so the block math is a no-op.
        let bits_per_block = match self.info.container {
            DsdContainer::Dsf => {
                let block_size = self.info.block_size_per_channel.unwrap_or(0) as u64;
                if block_size == 0 {
                    return Err(PipelineError::CorruptedFile(
                        "DSF block_size_per_channel is zero".into(),
                    ));
                }
                block_size * 8
            }
            DsdContainer::Dsdiff => (channel_data_size * 8) as u64,
        };

        let mut out = Vec::<f32>::with_capacity(EMIT_THRESHOLD_BYTES / 4);
        for frame_idx in 0..frames_total {
            for ch in 0..channels {
                // Virtual bit index within this channel's own DSD bitstream,
                // as if it were contiguous (the bounds contracts of spec.md
                // §4.2 are expressed in these terms).
                let channel_virtual_bit = (frame_idx * d) as u64;
                if channel_virtual_bit >= (channel_data_size * 8) as u64 {
                    return Err(PipelineError::InvalidOperation(
                        "channel_bit_index out of that channel's region".into(),
                    ));
                }
                if channel_virtual_bit + d as u64 > total_dsd_bits {
                    return Err(PipelineError::InvalidOperation(
                        "channel_bit_index + D exceeds total DSD bits".into(),
                    ));
                }
                let sample = decimate_bits(
                    data,
                    ch,
                    channels,
                    channel_data_size,
                    bits_per_block,
                    channel_virtual_bit,
                    d,
                ) * DSD_GAIN;
                out.push(sample.clamp(-1.0, 1.0));
            }
            if out.len() * 4 >= EMIT_THRESHOLD_BYTES {
                if !emit(&out) {
                    return Ok(());
                }
                out.clear();
            }
        }
        if !out.is_empty() {
            emit(&out);
        }
        Ok(())
    }
}

/// Maps a channel's virtual (as-if-contiguous) bit index to its physical
/// position in `data`, accounting for DSF's per-channel block interleaving
/// (DSDIFF's `bits_per_block` covers the whole channel, so this is identity
/// plus the channel offset for that container).
fn physical_bit_index(
    ch: usize,
    channels: usize,
    channel_data_size: usize,
    bits_per_block: u64,
    virtual_bit: u64,
) -> u64 {
    if bits_per_block >= (channel_data_size * 8) as u64 {
        return (ch * channel_data_size * 8) as u64 + virtual_bit;
    }
    let block_idx = virtual_bit / bits_per_block;
    let bit_in_block = virtual_bit % bits_per_block;
    block_idx * channels as u64 * bits_per_block + ch as u64 * bits_per_block + bit_in_block
}

/// Sums the next `d` DSD bits of channel `ch`'s bitstream starting at the
/// virtual bit offset `virtual_start` (MSB-first within each byte), mapping
/// {0 -> -1, 1 -> +1} and averaging. Each bit is mapped through
/// `physical_bit_index` individually since a DSF block boundary can fall
/// inside the `d`-bit span.
#[allow(clippy::too_many_arguments)]
fn decimate_bits(
    data: &[u8],
    ch: usize,
    channels: usize,
    channel_data_size: usize,
    bits_per_block: u64,
    virtual_start: u64,
    d: usize,
) -> f32 {
    let mut acc = 0i32;
    for i in 0..d {
        let vbit = virtual_start + i as u64;
        let pbit = physical_bit_index(ch, channels, channel_data_size, bits_per_block, vbit);
        let byte = data[(pbit / 8) as usize];
        let bit = (byte >> (7 - (pbit % 8)) as u8) & 1;
        acc += if bit == 1 { 1 } else { -1 };
    }
    acc as f32 / d as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimation_factor_rejects_invalid_values() {
        assert!(DecimationFactor::try_from(16).is_ok());
        assert!(DecimationFactor::try_from(32).is_ok());
        assert!(DecimationFactor::try_from(64).is_ok());
        assert!(matches!(
            DecimationFactor::try_from(8),
            Err(PipelineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn all_ones_decimates_to_positive_clamp() {
        let data = [0xFFu8; 8]; // 64 one-bits.
        let sample = decimate_bits(&data, 0, 1, 8, 64, 0, 64) * DSD_GAIN;
        assert_eq!(sample.clamp(-1.0, 1.0), 1.0);
    }

    #[test]
    fn all_zero_bits_decimate_to_negative_clamp() {
        let data = [0x00u8; 8];
        let sample = decimate_bits(&data, 0, 1, 8, 64, 0, 64) * DSD_GAIN;
        assert_eq!(sample.clamp(-1.0, 1.0), -1.0);
    }

    #[test]
    fn alternating_bits_average_near_zero_before_gain() {
        let data = [0b10101010u8; 2];
        let avg = decimate_bits(&data, 0, 1, 2, 16, 0, 16);
        assert_eq!(avg, 0.0);
    }

    #[test]
    fn dsf_block_interleaving_reads_correct_channel_block() {
        // Two channels, block_size_per_channel = 1 byte, two blocks:
        // block0 = [ch0=0xFF, ch1=0x00], block1 = [ch0=0x00, ch1=0xFF].
        let data = [0xFFu8, 0x00, 0x00, 0xFF];
        let bits_per_block = 8u64;
        // Channel 1's second block (virtual bit 8..16) physically sits at
        // byte 3 (0xFF), not byte 1 (0x00) which is channel 1's first block.
        let sample = decimate_bits(&data, 1, 2, 2, bits_per_block, 8, 8);
        assert_eq!(sample, 1.0);
    }

    #[test]
    fn zero_division_decimation_is_rejected() {
        let info = DsdFileInfo {
            container: DsdContainer::Dsf,
            dsd_sample_rate: 10,
            channels: 2,
            sample_count: 0,
            data_offset: 0,
            data_len: 0,
            block_size_per_channel: None,
        };
        let result = DsdDecoder::new(info, DecimationFactor::SixtyFour);
        assert!(matches!(result, Err(PipelineError::InvalidArgument(_))));
    }
}
