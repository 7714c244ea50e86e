//! Visible-window computation.
//!
//! Maps a pixel scroll offset to a half-open row index range using the
//! cache's average loaded-row height, then pads it with buffer rows. Near
//! either end of the document the range is shifted inward rather than
//! truncated, so a window over a large enough document always spans at
//! least `viewport_rows + 2 * buffer_rows` rows.

use std::ops::Range;

/// Half-open index range into the row cache. `start <= end <= total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    pub start: usize,
    pub end: usize,
}

impl Window {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start: start.min(end), end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: usize) -> bool {
        self.range().contains(&index)
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Clamp to a document of `total` rows.
    pub fn clamp(self, total: usize) -> Self {
        let end = self.end.min(total);
        Self { start: self.start.min(end), end }
    }
}

impl From<Range<usize>> for Window {
    fn from(range: Range<usize>) -> Self {
        Self::new(range.start, range.end)
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowCalculator {
    pub buffer_rows: usize,
    /// Used when the average height is unusable (zero, negative, NaN).
    pub fallback_height: f64,
}

impl WindowCalculator {
    pub fn new(buffer_rows: usize, fallback_height: f64) -> Self {
        Self { buffer_rows, fallback_height }
    }

    pub fn compute(
        &self,
        scroll_offset: f64,
        viewport_height: f64,
        avg_height: f64,
        total: usize,
    ) -> Window {
        let avg = if avg_height.is_finite() && avg_height > 0.0 {
            avg_height
        } else if self.fallback_height.is_finite() && self.fallback_height > 0.0 {
            self.fallback_height
        } else {
            1.0
        };
        let offset = non_negative(scroll_offset);
        let viewport = non_negative(viewport_height);

        // Float → usize casts saturate, so huge offsets land at the end.
        let first = (offset / avg).floor() as usize;
        let last = ((offset + viewport) / avg).ceil() as usize;
        let viewport_rows = last.saturating_sub(first);

        let buffer = self.buffer_rows;
        let span = viewport_rows.saturating_add(buffer.saturating_mul(2)).min(total);
        let mut start = first.saturating_sub(buffer).min(total);
        let mut end = last.saturating_add(buffer).min(total);

        if end - start < span {
            if end == total {
                start = total - span;
            } else {
                end = (start + span).min(total);
            }
        }
        Window { start, end }
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> WindowCalculator {
        WindowCalculator::new(10, 40.0)
    }

    fn check(w: Window, total: usize) {
        assert!(w.start <= w.end, "{w}");
        assert!(w.end <= total, "{w} > {total}");
    }

    #[test]
    fn test_top_of_document() {
        let w = calc().compute(0.0, 600.0, 40.0, 1000);
        // 15 visible rows + 10 below; shifted so the span is 35.
        assert_eq!(w, Window::new(0, 35));
    }

    #[test]
    fn test_middle_of_document() {
        let w = calc().compute(550.0 * 40.0, 600.0, 40.0, 1000);
        assert_eq!(w, Window::new(540, 575));
    }

    #[test]
    fn test_bottom_shifts_inward() {
        let w = calc().compute(1_000_000.0, 600.0, 40.0, 1000);
        assert_eq!(w.end, 1000);
        assert_eq!(w.len(), 35);
    }

    #[test]
    fn test_small_document() {
        let w = calc().compute(0.0, 600.0, 40.0, 7);
        assert_eq!(w, Window::new(0, 7));
        assert!(calc().compute(0.0, 600.0, 40.0, 0).is_empty());
    }

    #[test]
    fn test_bad_inputs() {
        let c = calc();
        for (offset, viewport, avg) in [
            (f64::NAN, 600.0, 40.0),
            (-500.0, 600.0, 40.0),
            (0.0, -1.0, 40.0),
            (100.0, 600.0, 0.0),
            (100.0, 600.0, f64::INFINITY),
            (f64::MAX, f64::MAX, 1e-300),
        ] {
            check(c.compute(offset, viewport, avg, 500), 500);
        }
    }

    #[test]
    fn test_bounds_and_span_hold_everywhere() {
        let c = calc();
        for total in [0usize, 1, 34, 35, 36, 250, 1000] {
            for avg in [17.0, 40.0, 63.5, 200.0] {
                for viewport in [0.0, 300.0, 600.0, 2000.0] {
                    for step in 0..40 {
                        let offset = step as f64 * 997.0;
                        let w = c.compute(offset, viewport, avg, total);
                        check(w, total);
                        let viewport_rows = ((offset + viewport) / avg).ceil() as usize
                            - (offset / avg).floor() as usize;
                        assert!(w.len() >= total.min(viewport_rows + 20), "{w} total={total}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_window_helpers() {
        let w: Window = (5..9).into();
        assert_eq!(w.len(), 4);
        assert!(w.contains(5) && !w.contains(9));
        assert_eq!(w.clamp(7), Window::new(5, 7));
        assert_eq!(w.clamp(3), Window::new(3, 3));
        assert_eq!(w.to_string(), "[5, 9)");
    }
}
