/// Pick the timestamp a compressed frame is queued under.
///
/// The preferred stamp falls back to the other one, then to zero. The result
/// may be negative; callers drop such frames.
pub fn resolve_timestamp(dts: Option<i64>, pts: Option<i64>, prefer_dts: bool) -> i64 {
    let (primary, secondary) = if prefer_dts { (dts, pts) } else { (pts, dts) };
    primary.or(secondary).unwrap_or(0)
}

/// Display size for a decoded picture given the stream aspect ratio.
///
/// An aspect of 0 or 1 leaves the picture size untouched. Otherwise the
/// height is kept and the width derived from it, unless that would exceed
/// the frame width, in which case the width is kept and the height derived.
pub fn display_size(width: u32, height: u32, aspect: f64) -> (u32, u32) {
    if aspect == 0.0 || aspect == 1.0 {
        return (width, height);
    }

    let display_width = (height as f64 * aspect).round() as i32 & -3;
    if display_width as i64 > width as i64 {
        let display_height = (width as f64 / aspect).round() as i32 & -3;
        return (width, display_height.max(0) as u32);
    }
    (display_width.max(0) as u32, height)
}
