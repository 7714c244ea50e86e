//! Row height estimation.
//!
//! Heights are whole pixels so sums over the cache are exact and agree no
//! matter when or in what order they are computed.

use rowsync_types::Row;
use serde::{Deserialize, Serialize};

use crate::constants::{CHARS_PER_LINE, LINE_HEIGHT, MAX_ROW_HEIGHT, MIN_ROW_HEIGHT};

/// Pure content → height function, clamped to `[min_height, max_height]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RowHeightEstimator {
    pub min_height: u32,
    pub max_height: u32,
    pub line_height: u32,
    pub chars_per_line: usize,
}

impl Default for RowHeightEstimator {
    fn default() -> Self {
        Self {
            min_height: MIN_ROW_HEIGHT,
            max_height: MAX_ROW_HEIGHT,
            line_height: LINE_HEIGHT,
            chars_per_line: CHARS_PER_LINE,
        }
    }
}

impl RowHeightEstimator {
    /// Estimated height of a row. `None` (placeholder or never loaded) is
    /// always `min_height`.
    pub fn estimate(&self, row: Option<&Row>) -> u32 {
        match row {
            Some(row) => self.estimate_text(&row.source, &row.target),
            None => self.min_height,
        }
    }

    pub fn estimate_text(&self, source: &str, target: &str) -> u32 {
        let max_len = source.chars().count().max(target.chars().count());
        let breaks = count_line_breaks(source).max(count_line_breaks(target));

        let wrapped = max_len.div_ceil(self.chars_per_line.max(1)).max(1);
        let extra_lines = (wrapped - 1).saturating_add(breaks);
        let extra = u64::try_from(extra_lines)
            .unwrap_or(u64::MAX)
            .saturating_mul(u64::from(self.line_height));
        let height = u64::from(self.min_height).saturating_add(extra);

        let capped = height.min(u64::from(self.max_height));
        u32::try_from(capped).unwrap_or(self.max_height).max(self.min_height)
    }
}

/// Count line breaks, treating `\n`, a literal backslash-n and `<br>` /
/// `<br/>` / `<br />` (any case) as one break each.
pub fn count_line_breaks(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while i < bytes.len() {
        let step = match bytes[i] {
            b'\n' => Some(1),
            b'\\' if bytes.get(i + 1) == Some(&b'n') => Some(2),
            b'<' => br_tag_len(&bytes[i..]),
            _ => None,
        };
        match step {
            Some(len) => {
                count += 1;
                i += len;
            }
            None => i += 1,
        }
    }
    count
}

fn br_tag_len(bytes: &[u8]) -> Option<usize> {
    const TAGS: [&[u8]; 3] = [b"<br>", b"<br/>", b"<br />"];
    TAGS.iter()
        .find(|tag| bytes.len() >= tag.len() && bytes[..tag.len()].eq_ignore_ascii_case(tag))
        .map(|tag| tag.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn est() -> RowHeightEstimator {
        RowHeightEstimator::default()
    }

    #[test]
    fn test_placeholder_is_min() {
        assert_eq!(est().estimate(None), MIN_ROW_HEIGHT);
    }

    #[test]
    fn test_wrapping() {
        let e = est();
        assert_eq!(e.estimate_text("", ""), 40);
        assert_eq!(e.estimate_text(&"x".repeat(60), ""), 40);
        assert_eq!(e.estimate_text(&"x".repeat(61), ""), 60);
        // The longer of source and target wins.
        assert_eq!(e.estimate_text("short", &"y".repeat(130)), 80);
    }

    #[test]
    fn test_break_styles_are_equivalent() {
        let e = est();
        for text in ["a\nb", "a\\nb", "a<br>b", "a<BR/>b", "a<br />b"] {
            assert_eq!(count_line_breaks(text), 1, "{text:?}");
            assert_eq!(e.estimate_text(text, ""), 60, "{text:?}");
        }
        assert_eq!(count_line_breaks("<b>bold</b> <brx"), 0);
        assert_eq!(count_line_breaks("one\ntwo\\nthree<br>four"), 3);
    }

    #[test]
    fn test_clamped_to_max() {
        let e = est();
        assert_eq!(e.estimate_text(&"z".repeat(10_000), ""), MAX_ROW_HEIGHT);
        assert_eq!(e.estimate_text(&"\n".repeat(50), ""), MAX_ROW_HEIGHT);
    }

    #[test]
    fn test_deterministic() {
        let e = est();
        let text = "Hello<br>world, this line is long enough to wrap around once more";
        assert_eq!(e.estimate_text(text, text), e.estimate_text(text, text));
    }

    #[test]
    fn test_multibyte_counts_chars() {
        // 60 three-byte chars still fit one line.
        assert_eq!(est().estimate_text(&"語".repeat(60), ""), 40);
    }
}
