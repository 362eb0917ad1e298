//! Pattern Scanner: byte+mask and IDA-hex-string pattern matching over a
//! resolved image segment (spec §4.4). Grounded on the source's
//! `ParseIDAPattern`/`ScanPattern`/`ScanIDAPattern` trio, generalized
//! from "first match only" to also support `find_all`.

use crate::engine::Engine;
use crate::error::{EngineError, ErrorKind};
use crate::locator::{ImageDescriptor, Locator, SegmentRange};

/// A parsed byte pattern: an equal-length sequence of target bytes and
/// a mask where `'x'` means "must match" and anything else ("`?`" by
/// convention) means "wildcard, don't compare".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub bytes: Vec<u8>,
    pub mask: Vec<u8>,
}

impl Pattern {
    /// Builds a byte+mask pattern. Returns `None` if `bytes` is empty or
    /// `bytes`/`mask` differ in length (spec §4.4 byte+mask construction:
    /// "Rejects empty, or length mismatch") -- checked in every build
    /// profile, not just debug, since a mismatched pair would otherwise
    /// panic in `find_in_buffer`'s mask indexing.
    pub fn new(bytes: Vec<u8>, mask: Vec<u8>) -> Option<Self> {
        if bytes.is_empty() || bytes.len() != mask.len() {
            return None;
        }
        Some(Self { bytes, mask })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Parses an IDA-style hex string (e.g. `"48 8B ?? C3"`), where `??`
    /// or a lone `?` marks a wildcard byte. Whitespace is ignored;
    /// malformed hex digits are skipped rather than aborting the parse
    /// (matching the source, which logs and continues rather than
    /// raising on a bad token).
    pub fn from_ida_string(pattern: &str) -> Self {
        let mut bytes = Vec::new();
        let mut mask = Vec::new();

        let chars: Vec<char> = pattern.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];

            if c.is_whitespace() {
                i += 1;
                continue;
            }

            if c == '?' {
                bytes.push(0x00);
                mask.push(b'?');
                i += 1;
                // A second consecutive '?' (the common "??" wildcard
                // spelling) is consumed as part of the same token.
                if i < chars.len() && chars[i] == '?' {
                    i += 1;
                }
                continue;
            }

            if c.is_ascii_hexdigit() {
                if i + 1 < chars.len() && chars[i + 1].is_ascii_hexdigit() {
                    let byte_str: String = chars[i..i + 2].iter().collect();
                    if let Ok(byte) = u8::from_str_radix(&byte_str, 16) {
                        bytes.push(byte);
                        mask.push(b'x');
                    }
                    i += 2;
                } else {
                    // A lone trailing hex digit with no pair: skip it,
                    // same as the source's "continue" on an unpaired digit.
                    i += 1;
                }
                continue;
            }

            // Any other character is invalid; skip it.
            i += 1;
        }

        Self { bytes, mask }
    }
}

/// Scans within a single resolved `(image, segment)` window.
pub struct PatternScanner<'a> {
    engine: &'a Engine,
    range_start: u64,
    range_len: usize,
}

impl<'a> PatternScanner<'a> {
    /// Resolves `image_substring`'s `segment_name` segment and builds a
    /// scanner bound to that address range.
    pub fn new(
        engine: &'a Engine,
        image_substring: &str,
        segment_name: &str,
    ) -> Result<Self, EngineError> {
        let locator = Locator::new(engine);
        let image = locator.locate(image_substring)?;
        let segment = locator.resolve_segment(&image, segment_name)?;
        Ok(Self::from_segment(engine, &segment))
    }

    /// Builds a scanner directly from an already-resolved image and
    /// segment, skipping the locate step.
    pub fn from_image_segment(
        engine: &'a Engine,
        _image: &ImageDescriptor,
        segment: &SegmentRange,
    ) -> Self {
        Self::from_segment(engine, segment)
    }

    fn from_segment(engine: &'a Engine, segment: &SegmentRange) -> Self {
        Self {
            engine,
            range_start: segment.segment_start,
            range_len: segment.len() as usize,
        }
    }

    fn read_range(&self) -> Option<Vec<u8>> {
        self.engine.read_raw(self.range_start, self.range_len)
    }

    /// Finds the first match for `pattern`, or `0` if none is found
    /// (matching the source's 0-address sentinel for "not found").
    pub fn find_first(&self, pattern: &Pattern) -> u64 {
        let Some(buffer) = self.read_range() else {
            return 0;
        };

        match find_in_buffer(&buffer, pattern, 0) {
            Some(offset) => self.range_start + offset as u64,
            None => 0,
        }
    }

    /// Finds every non-overlapping match for `pattern`, scanning left to
    /// right and resuming each search immediately after the previous hit.
    pub fn find_all(&self, pattern: &Pattern) -> Vec<u64> {
        let Some(buffer) = self.read_range() else {
            return Vec::new();
        };

        if pattern.is_empty() {
            return Vec::new();
        }

        let mut hits = Vec::new();
        let mut cursor = 0;

        while let Some(offset) = find_in_buffer(&buffer, pattern, cursor) {
            hits.push(self.range_start + offset as u64);
            cursor = offset + pattern.len();
        }

        hits
    }
}

fn find_in_buffer(buffer: &[u8], pattern: &Pattern, from: usize) -> Option<usize> {
    if pattern.is_empty() || buffer.len() < pattern.len() {
        return None;
    }

    for i in from..=buffer.len() - pattern.len() {
        let mut matched = true;
        for j in 0..pattern.len() {
            if pattern.mask[j] == b'x' && buffer[i + j] != pattern.bytes[j] {
                matched = false;
                break;
            }
        }
        if matched {
            return Some(i);
        }
    }

    None
}
