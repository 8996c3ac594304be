//! Destination-side duplicate detection.
//!
//! Only a stub ships today: [`NeverDuplicate`] answers "not a duplicate" with
//! zero confidence for every candidate. Real detectors implement
//! [`DuplicateOracle`] and are swapped in without touching the pipeline.

use anyhow::Result;

use crate::discovery::VideoCandidate;

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateVerdict {
    pub duplicate: bool,
    /// In `0.0..=1.0`.
    pub confidence: f64,
    pub reason: String,
}

impl DuplicateVerdict {
    pub fn not_duplicate() -> Self {
        Self {
            duplicate: false,
            confidence: 0.0,
            reason: String::new(),
        }
    }

    /// A verdict only blocks a candidate when it claims a duplicate with at
    /// least `threshold` confidence.
    pub fn blocks(&self, threshold: f64) -> bool {
        self.duplicate && self.confidence >= threshold
    }
}

pub trait DuplicateOracle {
    fn check(&self, candidate: &VideoCandidate) -> Result<DuplicateVerdict>;
}

/// Placeholder oracle: never reports a duplicate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverDuplicate;

impl DuplicateOracle for NeverDuplicate {
    fn check(&self, _candidate: &VideoCandidate) -> Result<DuplicateVerdict> {
        Ok(DuplicateVerdict::not_duplicate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_never_blocks() {
        let candidate = VideoCandidate::new("v1", "t", "u", "k");
        let verdict = NeverDuplicate.check(&candidate).unwrap();
        assert!(!verdict.duplicate);
        assert_eq!(verdict.confidence, 0.0);
        assert!(!verdict.blocks(0.0));
    }

    #[test]
    fn verdict_blocks_only_above_threshold() {
        let verdict = DuplicateVerdict {
            duplicate: true,
            confidence: 0.7,
            reason: "same title".into(),
        };
        assert!(verdict.blocks(0.6));
        assert!(!verdict.blocks(0.8));
    }
}
