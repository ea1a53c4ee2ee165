//! Resistance colour scale for pseudo-section displays.

use crate::results::ResistanceRange;

/// 65-step palette, low resistance first.
pub const PALETTE: [&str; 65] = [
    "#2E909D", "#2D979E", "#2D9F9F", "#2CA09A", "#2BA194", "#2BA38E", "#2AA488", "#29A582",
    "#29A67B", "#28A775", "#27A96E", "#27AA67", "#26AB60", "#26AC58", "#25AD50", "#24AF48",
    "#23B040", "#23B138", "#22B22F", "#21B426", "#24B521", "#2CB620", "#34B71F", "#3CB91F",
    "#45BA1E", "#4EBB1D", "#56BC1C", "#60BE1C", "#69BF1B", "#73C01A", "#7DC11A", "#87C319",
    "#91C418", "#9BC718", "#A5CB18", "#B0CE18", "#BBD118", "#C5D418", "#D1D719", "#DAD819",
    "#DDD219", "#E0CD1A", "#E3C61D", "#E5C020", "#E8B922", "#EBB225", "#EDAB28", "#F0A42B",
    "#F29D2E", "#F49531", "#F78D34", "#F98637", "#FB7E39", "#FD763C", "#FF6E3F", "#FF6642",
    "#FF5E45", "#FF5548", "#FF4D4B", "#FF4E4E", "#FF5050", "#FF5353", "#FF5656", "#FF5959",
    "#FF5C5C",
];

/// Colour used when the range is degenerate.
pub const FLAT_INDEX: usize = 32;

/// Palette index for `resistance` within `range`.
///
/// Returns `None` for an undefined resistance. A range with `min >= max`, including the
/// empty sentinel range, maps everything to [`FLAT_INDEX`].
pub fn color_index(resistance: f64, range: &ResistanceRange) -> Option<usize> {
    if !resistance.is_finite() {
        return None;
    }
    if range.min >= range.max {
        return Some(FLAT_INDEX);
    }
    let scaled = PALETTE.len() as f64 * (resistance - range.min) / (range.max - range.min);
    let last = PALETTE.len() - 1;
    if scaled <= 0.0 {
        Some(0)
    } else {
        Some((scaled as usize).min(last))
    }
}

/// Hex colour for `resistance` within `range`.
pub fn color_for(resistance: f64, range: &ResistanceRange) -> Option<&'static str> {
    color_index(resistance, range).map(|i| PALETTE[i])
}
