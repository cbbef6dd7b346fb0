//! Flat error enumeration shared by every stage, using the numeric
//! bands spec.md §7 defines (see DESIGN.md).

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("unknown error: {0}")]
    UnknownError(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("operation timed out")]
    Timeout,
    #[error("operation canceled")]
    Canceled,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("protocol version mismatch")]
    ProtocolVersionMismatch,
    #[error("invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("file read error: {0}")]
    FileReadError(String),
    #[error("file write error: {0}")]
    FileWriteError(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("corrupted file: {0}")]
    CorruptedFile(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("sample rate not supported: {0} Hz")]
    SampleRateNotSupported(u32),
    #[error("channel configuration error: {0}")]
    ChannelConfigurationError(String),
    #[error("bit depth not supported: {0}-bit")]
    BitDepthNotSupported(u16),
    #[error("device open failed: {0}")]
    DeviceOpenFailed(String),
    #[error("audio decode error: {0}")]
    AudioDecodeError(String),
    #[error("audio encode error: {0}")]
    AudioEncodeError(String),
    #[error("audio backend error: {0}")]
    AudioBackendError(String),
    #[error("audio format mismatch")]
    AudioFormatMismatch,
    #[error("buffer underrun")]
    BufferUnderrun,
    #[error("buffer overrun")]
    BufferOverrun,

    #[error("cache miss")]
    CacheMiss,
    #[error("cache corrupted: {0}")]
    CacheCorrupted(String),
    #[error("cache entry not found")]
    CacheEntryNotFound,
    #[error("cache validation error: {0}")]
    CacheValidationError(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("state transition error: {0}")]
    StateTransitionError(String),
    #[error("queue is empty")]
    QueueEmpty,
    #[error("queue is full")]
    QueueFull,
    #[error("end of queue")]
    EndOfQueue,

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("network unavailable")]
    NetworkUnavailable,
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("http error: {0}")]
    HttpError(u16),
}

impl PipelineError {
    /// Numeric code, banded per spec.md §7 (see DESIGN.md for the renumbering
    /// of the Audio/Resource split the table leaves ambiguous).
    pub fn code(&self) -> u32 {
        use PipelineError::*;
        match self {
            UnknownError(_) => 1,
            NotImplemented(_) => 2,
            NotSupported(_) => 3,
            InvalidArgument(_) => 4,
            InvalidOperation(_) => 5,
            Timeout => 6,
            Canceled => 7,

            ProtocolViolation(_) => 50,
            ProtocolVersionMismatch => 51,
            InvalidMessageFormat(_) => 52,

            FileNotFound(_) => 60,
            FileReadError(_) => 61,
            FileWriteError(_) => 62,
            UnsupportedFormat(_) => 63,
            CorruptedFile(_) => 64,

            DeviceUnavailable(_) => 70,
            SampleRateNotSupported(_) => 71,
            ChannelConfigurationError(_) => 72,
            BitDepthNotSupported(_) => 73,
            DeviceOpenFailed(_) => 74,
            AudioFormatMismatch => 75,
            AudioBackendError(_) => 77,
            AudioDecodeError(_) => 78,
            AudioEncodeError(_) => 79,

            CacheMiss => 84,
            CacheCorrupted(_) => 85,
            CacheEntryNotFound => 86,
            CacheValidationError(_) => 87,

            InvalidState(_) => 94,
            StateTransitionError(_) => 100,
            QueueEmpty => 101,
            QueueFull => 102,
            EndOfQueue => 103,

            OutOfMemory(_) => 104,
            BufferOverrun => 105,
            BufferUnderrun => 106,

            NetworkUnavailable => 114,
            ConnectionTimeout => 116,
            HttpError(_) => 119,
        }
    }

    pub fn module(&self) -> &'static str {
        use PipelineError::*;
        match self {
            UnknownError(_) | NotImplemented(_) | NotSupported(_) | InvalidArgument(_)
            | InvalidOperation(_) | Timeout | Canceled => "core",
            ProtocolViolation(_) | ProtocolVersionMismatch | InvalidMessageFormat(_) => "protocol",
            FileNotFound(_) | FileReadError(_) | FileWriteError(_) | UnsupportedFormat(_)
            | CorruptedFile(_) => "filesystem",
            DeviceUnavailable(_)
            | SampleRateNotSupported(_)
            | ChannelConfigurationError(_)
            | BitDepthNotSupported(_)
            | DeviceOpenFailed(_)
            | AudioDecodeError(_)
            | AudioEncodeError(_)
            | AudioBackendError(_)
            | AudioFormatMismatch => "audio",
            CacheMiss | CacheCorrupted(_) | CacheEntryNotFound | CacheValidationError(_) => {
                "cache"
            }
            InvalidState(_) | StateTransitionError(_) | QueueEmpty | QueueFull | EndOfQueue => {
                "state"
            }
            OutOfMemory(_) | BufferUnderrun | BufferOverrun => "resource",
            NetworkUnavailable | ConnectionTimeout | HttpError(_) => "network",
        }
    }

    /// Stage exit code / HTTP-status mapping per spec.md §7.
    pub fn http_status(&self) -> u16 {
        match self.code() {
            4 => 400,
            60 | 68 => 404,
            6 => 408,
            70 | 114 => 503,
            2 | 3 => 501,
            c if matches!(self, PipelineError::HttpError(_)) => {
                if let PipelineError::HttpError(s) = self {
                    *s
                } else {
                    unreachable!("{c}")
                }
            }
            _ => 500,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::FileReadError(e.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: u32,
    pub message: String,
    pub module: &'static str,
    pub detail: String,
    pub timestamp: String,
    pub http_status: u16,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

impl From<&PipelineError> for ErrorEnvelope {
    fn from(err: &PipelineError) -> Self {
        ErrorEnvelope {
            error: ErrorDetail {
                code: err.code(),
                message: err.to_string(),
                module: err.module(),
                detail: format!("{err:?}"),
                timestamp: iso8601_millis(),
                http_status: err.http_status(),
            },
        }
    }
}

fn iso8601_millis() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let millis = now.subsec_millis();
    let days = secs / 86_400;
    let tod = secs % 86_400;
    let (y, m, d) = civil_from_days(days as i64);
    format!(
        "{y:04}-{m:02}-{d:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        tod / 3600,
        (tod % 3600) / 60,
        tod % 60
    )
}

/// Howard Hinnant's civil-from-days algorithm; avoids pulling in a datetime crate
/// purely to stamp error envelopes.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping_matches_spec_table() {
        assert_eq!(PipelineError::InvalidArgument("x".into()).http_status(), 400);
        assert_eq!(PipelineError::FileNotFound("x".into()).http_status(), 404);
        assert_eq!(PipelineError::Timeout.http_status(), 408);
        assert_eq!(PipelineError::DeviceUnavailable("x".into()).http_status(), 503);
        assert_eq!(PipelineError::NetworkUnavailable.http_status(), 503);
        assert_eq!(PipelineError::NotImplemented("x".into()).http_status(), 501);
        assert_eq!(PipelineError::CacheMiss.http_status(), 500);
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let err = PipelineError::InvalidMessageFormat("bad header".into());
        let envelope = ErrorEnvelope::from(&err);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"code\":52"));
        assert!(json.contains("InvalidMessageFormat"));
    }
}
