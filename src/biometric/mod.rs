//! Biometric matching: enrolment templates and 1:1 matching behind a
//! quality and liveness gate.
//!
//! Feature extraction is a pluggable [`FaceAnalyzer`]; the matcher only
//! relies on it producing fixed-length, L2-normalised embeddings.

use std::sync::Arc;

use thiserror::Error;

use crate::{
    error::{Code, Error},
    model::voter::BiometricTemplate,
};

pub mod jpeg;
pub mod liveness;

pub use jpeg::JpegAnalyzer;

/// Dimension of every embedding.
pub const EMBEDDING_DIM: usize = 128;

/// A capture as received from a client: one primary image plus optional
/// extra frames used for the liveness check.
#[derive(Debug, Clone, Default)]
pub struct Capture {
    pub image: Vec<u8>,
    pub frames: Vec<Vec<u8>>,
}

impl Capture {
    pub fn new(image: Vec<u8>, frames: Vec<Vec<u8>>) -> Self {
        Self { image, frames }
    }
}

/// What an analyzer extracts from a single image.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceSample {
    pub embedding: Vec<f64>,
    pub quality: f64,
    pub faces: usize,
}

/// A feature extractor for face images.
pub trait FaceAnalyzer: Send + Sync {
    /// Identifier stored alongside templates produced by this analyzer.
    fn algorithm(&self) -> &'static str;

    /// Decode an image and extract a face sample from it.
    fn analyze(&self, image: &[u8]) -> Result<FaceSample, CaptureError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Capture could not be decoded: {0}")]
    Undecodable(String),
    #[error("No face found in capture")]
    NoFace,
    #[error("Multiple faces found in capture")]
    MultipleFaces,
    #[error("Capture quality is below the required minimum")]
    LowQuality,
    #[error("Capture failed the liveness check")]
    LivenessFail,
}

impl From<CaptureError> for Error {
    fn from(err: CaptureError) -> Self {
        let code = match err {
            CaptureError::Undecodable(_) => Code::BadRequest,
            CaptureError::NoFace => Code::NoFace,
            CaptureError::MultipleFaces => Code::MultipleFaces,
            CaptureError::LowQuality => Code::LowQuality,
            CaptureError::LivenessFail => return Error::auth(Code::LivenessFail, err.to_string()),
        };
        Error::input(code, err.to_string())
    }
}

/// Result of comparing a capture against a template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    pub score: f64,
    pub distance: f64,
}

/// Matcher settings.
#[derive(Debug, Clone, Copy)]
pub struct MatcherSettings {
    /// Largest embedding distance that still counts as a match.
    pub match_threshold: f64,
    /// Smallest acceptable capture quality.
    pub quality_min: f64,
    pub liveness_required: bool,
}

pub struct BiometricMatcher {
    analyzer: Arc<dyn FaceAnalyzer>,
    settings: MatcherSettings,
}

impl BiometricMatcher {
    pub fn new(analyzer: Arc<dyn FaceAnalyzer>, settings: MatcherSettings) -> Self {
        Self { analyzer, settings }
    }

    pub fn settings(&self) -> &MatcherSettings {
        &self.settings
    }

    /// Extract a template from an enrolment capture.
    pub fn enroll(&self, capture: &Capture) -> Result<BiometricTemplate, CaptureError> {
        let sample = self.sample(&capture.image)?;
        Ok(BiometricTemplate {
            vector: sample.embedding,
            algorithm: self.analyzer.algorithm().to_string(),
            quality: sample.quality,
        })
    }

    /// Compare a live capture against a stored template.
    ///
    /// Capture problems (no face, several faces, low quality, failed liveness)
    /// are errors; a well-formed capture of someone else is a non-match.
    pub fn match_capture(
        &self,
        template: &BiometricTemplate,
        capture: &Capture,
    ) -> Result<MatchResult, CaptureError> {
        let sample = self.sample(&capture.image)?;
        if self.settings.liveness_required
            && !liveness::motion_liveness(self.analyzer.as_ref(), &sample, &capture.frames, &self.settings)
        {
            return Err(CaptureError::LivenessFail);
        }
        if template.vector.len() != sample.embedding.len() || template.algorithm != self.analyzer.algorithm() {
            return Ok(MatchResult {
                matched: false,
                score: 0.0,
                distance: 2.0,
            });
        }
        let distance = distance(&template.vector, &sample.embedding);
        Ok(MatchResult {
            matched: distance <= self.settings.match_threshold,
            score: score(distance),
            distance,
        })
    }

    /// Analyze one image and apply the face-count and quality gates.
    fn sample(&self, image: &[u8]) -> Result<FaceSample, CaptureError> {
        let sample = self.analyzer.analyze(image)?;
        match sample.faces {
            0 => return Err(CaptureError::NoFace),
            1 => {}
            _ => return Err(CaptureError::MultipleFaces),
        }
        if sample.quality < self.settings.quality_min {
            return Err(CaptureError::LowQuality);
        }
        Ok(sample)
    }
}

/// Euclidean distance between two embeddings of equal length.
pub fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Similarity score in `[0, 1]` for L2-normalised embeddings, whose distance lies in `[0, 2]`.
pub fn score(distance: f64) -> f64 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

/// Scale a vector to unit length. The zero vector is returned unchanged.
pub fn l2_normalize(mut vector: Vec<f64>) -> Vec<f64> {
    let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
    vector
}

#[cfg(test)]
pub(crate) mod examples {
    use data_encoding::BASE64;

    use super::*;

    pub const SCAN_LEN: usize = 4096;

    /// Assemble a baseline JPEG container around the given entropy-coded data.
    pub fn jpeg(width: u16, height: u16, scan: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8];
        // SOF0: precision, height, width, one component.
        bytes.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        // SOS header for the single component.
        bytes.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
        bytes.extend_from_slice(scan);
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        bytes
    }

    /// A well-lit, full-resolution portrait.
    pub fn face_a() -> Vec<u8> {
        jpeg(640, 480, &scan_a())
    }

    /// The same subject as [`face_a`], moved slightly.
    pub fn face_a_moved() -> Vec<u8> {
        let mut scan = scan_a();
        for (i, byte) in scan.iter_mut().enumerate().take(512) {
            *byte = ((i * 11) % 255) as u8;
        }
        jpeg(640, 480, &scan)
    }

    /// A different subject.
    pub fn face_b() -> Vec<u8> {
        let scan: Vec<u8> = (0..SCAN_LEN).map(|i| 96 + ((i * 5 + i / 7) % 32) as u8).collect();
        jpeg(640, 480, &scan)
    }

    /// The subject of [`face_a`] at thumbnail resolution.
    pub fn face_a_thumbnail() -> Vec<u8> {
        jpeg(64, 64, &scan_a())
    }

    /// A featureless frame.
    pub fn blank() -> Vec<u8> {
        jpeg(640, 480, &[0x10; SCAN_LEN])
    }

    pub fn b64(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    fn scan_a() -> Vec<u8> {
        (0..SCAN_LEN).map(|i| ((i * 7 + i / 13) % 255) as u8).collect()
    }

    /// An analyzer that reports a fixed sample, for exercising the gates.
    pub struct FixedAnalyzer(pub FaceSample);

    impl FaceAnalyzer for FixedAnalyzer {
        fn algorithm(&self) -> &'static str {
            "fixed"
        }

        fn analyze(&self, _image: &[u8]) -> Result<FaceSample, CaptureError> {
            Ok(self.0.clone())
        }
    }

    impl MatcherSettings {
        pub fn example() -> Self {
            Self {
                match_threshold: 0.6,
                quality_min: 0.5,
                liveness_required: true,
            }
        }
    }
}
