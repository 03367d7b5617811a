//! Motion-based liveness: a live subject moves between frames, a presented
//! photograph does not.

use super::{distance, FaceAnalyzer, FaceSample, MatcherSettings};

/// Smallest embedding distance between frames that counts as motion.
pub const MIN_MOTION: f64 = 0.02;

/// Pass iff at least one extra frame shows the same single subject as the
/// primary sample, displaced by more than [`MIN_MOTION`].
pub fn motion_liveness(
    analyzer: &dyn FaceAnalyzer,
    primary: &FaceSample,
    frames: &[Vec<u8>],
    settings: &MatcherSettings,
) -> bool {
    frames.iter().any(|frame| match analyzer.analyze(frame) {
        Ok(sample) if sample.faces == 1 && sample.embedding.len() == primary.embedding.len() => {
            let moved = distance(&primary.embedding, &sample.embedding);
            moved > MIN_MOTION && moved <= settings.match_threshold
        }
        _ => false,
    })
}
