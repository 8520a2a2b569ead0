//! Maps a classified FFmpeg error onto a resolution strategy and risk level.
//!
//! The strategy table is carried over from the same prototype
//! `classify::patterns` was: each error type maps to one or more
//! `(strategy, risk, confidence)` options, tried in descending confidence
//! order, falling back to the highest-confidence option if none clears the
//! configured risk threshold.

use super::classify::FFmpegErrorType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    Restart,
    Fallback,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResolutionRisk {
    Safe,
    Low,
    Medium,
    High,
}

impl ResolutionRisk {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => ResolutionRisk::Safe,
            1 => ResolutionRisk::Low,
            2 => ResolutionRisk::Medium,
            _ => ResolutionRisk::High,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Fix {
    pub strategy: ResolutionStrategy,
    pub risk: ResolutionRisk,
    pub confidence: f32,
}

const fn option(strategy: ResolutionStrategy, risk: ResolutionRisk, confidence: f32) -> (ResolutionStrategy, ResolutionRisk, f32) {
    (strategy, risk, confidence)
}

/// Candidate fixes for an error type, highest confidence first.
fn strategies(error_type: FFmpegErrorType) -> &'static [(ResolutionStrategy, ResolutionRisk, f32)] {
    use FFmpegErrorType::*;
    use ResolutionRisk::*;
    use ResolutionStrategy::*;

    match error_type {
        ConnectionTimeout | ConnectionRefused => &[option(Restart, Low, 0.6), option(Ignore, Safe, 0.5)],
        HttpError => &[option(Fallback, Safe, 0.9), option(Restart, Low, 0.6)],
        DecoderError | EncoderError | PermissionError | IoError | MemoryError => {
            &[option(Restart, Medium, 0.85)]
        }
        HardwareError => &[option(Restart, Medium, 0.7)],
        FormatError | StreamError => &[option(Restart, Low, 0.8)],
        Unknown => &[option(Ignore, Safe, 0.4)],
    }
}

/// Picks the highest-confidence strategy that doesn't exceed `max_risk`,
/// falling back to the single highest-confidence strategy overall if every
/// option requires approval above it.
pub fn resolve(error_type: FFmpegErrorType, max_risk: ResolutionRisk) -> Fix {
    let options = strategies(error_type);
    let mut sorted: Vec<_> = options.to_vec();
    sorted.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap());

    for (strategy, risk, confidence) in &sorted {
        if *risk <= max_risk {
            return Fix { strategy: *strategy, risk: *risk, confidence: *confidence };
        }
    }

    let (strategy, risk, confidence) = sorted[0];
    Fix { strategy, risk, confidence }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_error_recommends_restart_at_medium_risk() {
        let fix = resolve(FFmpegErrorType::DecoderError, ResolutionRisk::Medium);
        assert_eq!(fix.strategy, ResolutionStrategy::Restart);
        assert_eq!(fix.risk, ResolutionRisk::Medium);
    }

    #[test]
    fn decoder_error_still_returned_above_threshold() {
        // no option at or below Safe exists for DecoderError; the resolver
        // still returns the best option rather than nothing, leaving the
        // caller's approval gate to decide whether to apply it.
        let fix = resolve(FFmpegErrorType::DecoderError, ResolutionRisk::Safe);
        assert_eq!(fix.strategy, ResolutionStrategy::Restart);
        assert_eq!(fix.risk, ResolutionRisk::Medium);
    }

    #[test]
    fn http_error_prefers_fallback_over_restart() {
        let fix = resolve(FFmpegErrorType::HttpError, ResolutionRisk::High);
        assert_eq!(fix.strategy, ResolutionStrategy::Fallback);
        assert_eq!(fix.risk, ResolutionRisk::Safe);
    }

    #[test]
    fn unknown_errors_are_ignored() {
        let fix = resolve(FFmpegErrorType::Unknown, ResolutionRisk::Safe);
        assert_eq!(fix.strategy, ResolutionStrategy::Ignore);
    }
}
