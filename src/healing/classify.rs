//! Classifies a single FFmpeg stderr line into an error type and severity.
//!
//! Pattern set and ordering are lifted from the line-by-line classifier an
//! earlier Python prototype of this headend used to drive its auto-resolver;
//! only the matching engine changed, not the taxonomy.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FFmpegErrorType {
    ConnectionTimeout,
    ConnectionRefused,
    HttpError,
    DecoderError,
    EncoderError,
    FormatError,
    PermissionError,
    IoError,
    MemoryError,
    HardwareError,
    StreamError,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FFmpegSeverity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub error_type: FFmpegErrorType,
    pub severity: FFmpegSeverity,
    pub requires_restart: bool,
    pub message: String,
}

struct Pattern {
    regex: &'static OnceLock<Regex>,
    source: &'static str,
    error_type: FFmpegErrorType,
    severity: FFmpegSeverity,
}

/// Checked top-to-bottom; the first match wins, mirroring the prototype's
/// ordered `ERROR_PATTERNS` list.
fn patterns() -> &'static [Pattern] {
    static CONNECTION_TIMEOUT: OnceLock<Regex> = OnceLock::new();
    static CONNECTION_REFUSED: OnceLock<Regex> = OnceLock::new();
    static HTTP_ERROR: OnceLock<Regex> = OnceLock::new();
    static DECODER_ERROR: OnceLock<Regex> = OnceLock::new();
    static ENCODER_ERROR: OnceLock<Regex> = OnceLock::new();
    static FORMAT_ERROR: OnceLock<Regex> = OnceLock::new();
    static PERMISSION_ERROR: OnceLock<Regex> = OnceLock::new();
    static IO_ERROR: OnceLock<Regex> = OnceLock::new();
    static MEMORY_ERROR: OnceLock<Regex> = OnceLock::new();
    static HARDWARE_ERROR: OnceLock<Regex> = OnceLock::new();
    static STREAM_ERROR: OnceLock<Regex> = OnceLock::new();

    static TABLE: OnceLock<Vec<Pattern>> = OnceLock::new();
    TABLE.get_or_init(|| {
        vec![
            Pattern {
                regex: &CONNECTION_TIMEOUT,
                source: r"(?i)connection timed out",
                error_type: FFmpegErrorType::ConnectionTimeout,
                severity: FFmpegSeverity::Error,
            },
            Pattern {
                regex: &CONNECTION_REFUSED,
                source: r"(?i)connection refused",
                error_type: FFmpegErrorType::ConnectionRefused,
                severity: FFmpegSeverity::Error,
            },
            Pattern {
                regex: &HTTP_ERROR,
                source: r"(?i)http error \d{3}",
                error_type: FFmpegErrorType::HttpError,
                severity: FFmpegSeverity::Error,
            },
            Pattern {
                regex: &DECODER_ERROR,
                source: r"(?i)decoder .* not found",
                error_type: FFmpegErrorType::DecoderError,
                severity: FFmpegSeverity::Critical,
            },
            Pattern {
                regex: &ENCODER_ERROR,
                source: r"(?i)encoder .* not found",
                error_type: FFmpegErrorType::EncoderError,
                severity: FFmpegSeverity::Critical,
            },
            Pattern {
                regex: &FORMAT_ERROR,
                source: r"(?i)invalid data found",
                error_type: FFmpegErrorType::FormatError,
                severity: FFmpegSeverity::Warning,
            },
            Pattern {
                regex: &PERMISSION_ERROR,
                source: r"(?i)permission denied",
                error_type: FFmpegErrorType::PermissionError,
                severity: FFmpegSeverity::Critical,
            },
            Pattern {
                regex: &IO_ERROR,
                source: r"(?i)no such file",
                error_type: FFmpegErrorType::IoError,
                severity: FFmpegSeverity::Critical,
            },
            Pattern {
                regex: &MEMORY_ERROR,
                source: r"(?i)out of memory",
                error_type: FFmpegErrorType::MemoryError,
                severity: FFmpegSeverity::Critical,
            },
            Pattern {
                regex: &HARDWARE_ERROR,
                source: r"(?i)(videotoolbox|nvenc|qsv|vaapi).*error",
                error_type: FFmpegErrorType::HardwareError,
                severity: FFmpegSeverity::Error,
            },
            Pattern {
                regex: &STREAM_ERROR,
                source: r"(?i)stream.*error",
                error_type: FFmpegErrorType::StreamError,
                severity: FFmpegSeverity::Warning,
            },
        ]
    })
}

impl Pattern {
    fn regex(&self) -> &Regex {
        self.regex.get_or_init(|| Regex::new(self.source).expect("static classifier regex"))
    }
}

/// Returns `None` for progress/informational lines that don't match any
/// known failure shape.
pub fn classify(line: &str) -> Option<ClassifiedError> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    for pattern in patterns() {
        if pattern.regex().is_match(line) {
            return Some(ClassifiedError {
                error_type: pattern.error_type,
                severity: pattern.severity,
                requires_restart: pattern.severity >= FFmpegSeverity::Error,
                message: line.chars().take(200).collect(),
            });
        }
    }

    if line.to_lowercase().contains("error") {
        return Some(ClassifiedError {
            error_type: FFmpegErrorType::Unknown,
            severity: FFmpegSeverity::Warning,
            requires_restart: false,
            message: line.chars().take(200).collect(),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_refused_as_error() {
        let c = classify("av_interleaved_write_frame(): Connection refused").unwrap();
        assert_eq!(c.error_type, FFmpegErrorType::ConnectionRefused);
        assert_eq!(c.severity, FFmpegSeverity::Error);
        assert!(c.requires_restart);
    }

    #[test]
    fn classifies_decoder_missing_as_critical() {
        let c = classify("Decoder (codec h265) not found").unwrap();
        assert_eq!(c.error_type, FFmpegErrorType::DecoderError);
        assert_eq!(c.severity, FFmpegSeverity::Critical);
    }

    #[test]
    fn progress_lines_do_not_classify() {
        assert!(classify("frame=  120 fps= 30 q=-1.0 size=    512kB time=00:00:04.00 bitrate=1024.0kbits/s speed=1.0x").is_none());
    }

    #[test]
    fn unrecognized_error_text_falls_back_to_unknown() {
        let c = classify("Some unexpected ffmpeg error occurred").unwrap();
        assert_eq!(c.error_type, FFmpegErrorType::Unknown);
        assert!(!c.requires_restart);
    }

    #[test]
    fn blank_line_is_not_classified() {
        assert!(classify("   ").is_none());
    }
}
