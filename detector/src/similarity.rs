use motion_watch_common::frame::Frame;

// BT.601 luma weights in 14-bit fixed point. They sum to 1 << 14, so a full
// white difference maps back to exactly 255.
const R_WEIGHT: u32 = 4899;
const G_WEIGHT: u32 = 9617;
const B_WEIGHT: u32 = 1868;
const SHIFT: u32 = 14;
const ROUND: u32 = 1 << (SHIFT - 1);

/// Similarity of two frames in [0, 1]; 1.0 means identical.
///
/// The per-pixel absolute difference is reduced to one intensity channel,
/// summed, and normalized by the largest possible sum (`width * height * 255`).
/// Empty frames and frames of different size are incomparable and score 0.0.
pub fn score(a: &Frame, b: &Frame) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.width() != b.width() || a.height() != b.height() {
        return 0.0;
    }

    let total: u64 = a
        .pixels()
        .chunks_exact(3)
        .zip(b.pixels().chunks_exact(3))
        .map(|(pa, pb)| {
            u64::from(luma(
                pa[0].abs_diff(pb[0]),
                pa[1].abs_diff(pb[1]),
                pa[2].abs_diff(pb[2]),
            ))
        })
        .sum();

    let max_possible = f64::from(a.width()) * f64::from(a.height()) * 255.0;
    1.0 - total as f64 / max_possible
}

fn luma(r: u8, g: u8, b: u8) -> u32 {
    (u32::from(r) * R_WEIGHT + u32::from(g) * G_WEIGHT + u32::from(b) * B_WEIGHT + ROUND) >> SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32, offset: u8) -> Frame {
        let data = (0..width * height * 3)
            .map(|i| (i as u8).wrapping_mul(7).wrapping_add(offset))
            .collect();
        Frame::from_rgb(width, height, data, 0, 0).unwrap()
    }

    #[test]
    fn identical_frames_score_one() {
        let a = gradient(16, 9, 3);
        assert_eq!(score(&a, &a), 1.0);
        assert_eq!(score(&a, &a.clone()), 1.0);
    }

    #[test]
    fn black_and_white_score_zero() {
        let black = Frame::solid(8, 8, [0, 0, 0], 0, 0);
        let white = Frame::solid(8, 8, [255, 255, 255], 0, 1);
        assert_eq!(score(&black, &white), 0.0);
    }

    #[test]
    fn incomparable_frames_score_zero() {
        let a = Frame::solid(8, 8, [10, 10, 10], 0, 0);
        let wider = Frame::solid(9, 8, [10, 10, 10], 0, 1);
        let taller = Frame::solid(8, 9, [10, 10, 10], 0, 2);
        let empty = Frame::empty(0, 3);

        assert_eq!(score(&a, &wider), 0.0);
        assert_eq!(score(&a, &taller), 0.0);
        assert_eq!(score(&a, &empty), 0.0);
        assert_eq!(score(&empty, &a), 0.0);
        assert_eq!(score(&empty, &empty), 0.0);
    }

    #[test]
    fn symmetric() {
        let a = gradient(12, 7, 0);
        let b = gradient(12, 7, 91);
        let ab = score(&a, &b);
        assert!(ab > 0.0 && ab < 1.0);
        assert_eq!(ab, score(&b, &a));
    }

    #[test]
    fn half_changed_scores_half() {
        let a = Frame::from_rgb(2, 1, vec![0, 0, 0, 0, 0, 0], 0, 0).unwrap();
        let b = Frame::from_rgb(2, 1, vec![0, 0, 0, 255, 255, 255], 0, 1).unwrap();
        assert!((score(&a, &b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn channels_are_luma_weighted() {
        let black = Frame::solid(1, 1, [0, 0, 0], 0, 0);
        let red = Frame::solid(1, 1, [255, 0, 0], 0, 1);
        let green = Frame::solid(1, 1, [0, 255, 0], 0, 2);
        // Green carries most of the perceived intensity
        assert!(score(&black, &green) < score(&black, &red));
        assert!((score(&black, &red) - (1.0 - 76.0 / 255.0)).abs() < 1e-12);
    }
}
