//! Reference analyzer working directly on baseline/progressive JPEG streams.
//!
//! It walks the marker segments, reads the frame size from the SOF header and
//! collects the entropy-coded scan data. The embedding is the L2-normalised
//! histogram of scan bytes folded into [`EMBEDDING_DIM`] bins; quality combines
//! resolution with the Shannon entropy of the scan. A scan with (almost) no
//! entropy carries no face.

use super::{l2_normalize, CaptureError, FaceAnalyzer, FaceSample, EMBEDDING_DIM};

const MARKER: u8 = 0xFF;
const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const TEM: u8 = 0x01;
const RST0: u8 = 0xD0;
const RST7: u8 = 0xD7;

/// Smallest side length, in pixels, that earns full resolution credit.
const FULL_QUALITY_SIDE: f64 = 480.0;
/// Scans below this entropy, in bits per byte, are treated as featureless.
const MIN_FACE_ENTROPY: f64 = 1.0;

#[derive(Debug, Default, Clone, Copy)]
pub struct JpegAnalyzer;

impl FaceAnalyzer for JpegAnalyzer {
    fn algorithm(&self) -> &'static str {
        "jpeg-histogram-v1"
    }

    fn analyze(&self, image: &[u8]) -> Result<FaceSample, CaptureError> {
        let decoded = decode(image)?;
        let entropy = entropy(&decoded.scan);

        let mut histogram = vec![0.0; EMBEDDING_DIM];
        let fold = 256 / EMBEDDING_DIM;
        for byte in &decoded.scan {
            histogram[usize::from(*byte) / fold] += 1.0;
        }

        let side = f64::from(decoded.width.min(decoded.height));
        let resolution = (side / FULL_QUALITY_SIDE).min(1.0);
        let faces = usize::from(entropy >= MIN_FACE_ENTROPY);

        Ok(FaceSample {
            embedding: l2_normalize(histogram),
            quality: resolution * entropy / 8.0,
            faces,
        })
    }
}

/// The parts of a JPEG stream the analyzer uses.
#[derive(Debug)]
struct Decoded {
    width: u16,
    height: u16,
    scan: Vec<u8>,
}

fn decode(bytes: &[u8]) -> Result<Decoded, CaptureError> {
    let undecodable = |reason: &str| CaptureError::Undecodable(reason.to_string());

    if bytes.len() < 4 || bytes[0] != MARKER || bytes[1] != SOI {
        return Err(undecodable("missing start of image"));
    }

    let mut size = None;
    let mut scan = Vec::new();
    let mut pos = 2;
    loop {
        // Skip fill bytes before the marker code.
        if bytes.get(pos) != Some(&MARKER) {
            return Err(undecodable("expected a marker"));
        }
        while bytes.get(pos) == Some(&MARKER) {
            pos += 1;
        }
        let marker = *bytes.get(pos).ok_or_else(|| undecodable("truncated marker"))?;
        pos += 1;

        match marker {
            EOI => break,
            TEM | RST0..=RST7 => continue,
            _ => {}
        }

        let length = match bytes.get(pos..pos + 2) {
            Some(&[hi, lo]) => usize::from(u16::from_be_bytes([hi, lo])),
            _ => return Err(undecodable("truncated segment length")),
        };
        if length < 2 {
            return Err(undecodable("invalid segment length"));
        }
        let segment = bytes
            .get(pos + 2..pos + length)
            .ok_or_else(|| undecodable("truncated segment"))?;
        pos += length;

        if is_start_of_frame(marker) {
            match segment {
                [_precision, h1, h2, w1, w2, ..] => {
                    size = Some((u16::from_be_bytes([*w1, *w2]), u16::from_be_bytes([*h1, *h2])));
                }
                _ => return Err(undecodable("truncated frame header")),
            }
        } else if marker == SOS {
            pos = read_scan(bytes, pos, &mut scan).ok_or_else(|| undecodable("unterminated scan"))?;
        }
    }

    let (width, height) = size.ok_or_else(|| undecodable("missing frame header"))?;
    if width == 0 || height == 0 {
        return Err(undecodable("empty frame"));
    }
    if scan.is_empty() {
        return Err(undecodable("missing scan data"));
    }
    Ok(Decoded { width, height, scan })
}

/// Copy entropy-coded data starting at `pos` into `scan`, removing byte
/// stuffing and restart markers. Returns the position of the next marker.
fn read_scan(bytes: &[u8], mut pos: usize, scan: &mut Vec<u8>) -> Option<usize> {
    loop {
        let byte = *bytes.get(pos)?;
        if byte != MARKER {
            scan.push(byte);
            pos += 1;
            continue;
        }
        match *bytes.get(pos + 1)? {
            0x00 => {
                scan.push(MARKER);
                pos += 2;
            }
            RST0..=RST7 => pos += 2,
            _ => return Some(pos),
        }
    }
}

fn is_start_of_frame(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

/// Shannon entropy of a byte string, in bits per byte.
fn entropy(bytes: &[u8]) -> f64 {
    let mut counts = [0usize; 256];
    for byte in bytes {
        counts[usize::from(*byte)] += 1;
    }
    let total = bytes.len() as f64;
    counts
        .iter()
        .filter(|count| **count > 0)
        .map(|count| {
            let p = *count as f64 / total;
            -p * p.log2()
        })
        .sum()
}
