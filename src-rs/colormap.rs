use image::Rgb;
use serde::{Deserialize, Serialize};

const VIRIDIS_ANCHORS: [[u8; 3]; 5] = [
    [68, 1, 84],
    [59, 82, 139],
    [33, 145, 140],
    [94, 201, 98],
    [253, 231, 37],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colormap {
    Viridis,
    Hot,
    Turbo,
}

impl Colormap {
    pub fn map(self, t: f64) -> Rgb<u8> {
        match self {
            Colormap::Viridis => viridis(t),
            Colormap::Hot => hot(t),
            Colormap::Turbo => turbo(t),
        }
    }
}

fn clamp_unit(t: f64) -> f64 {
    if t.is_nan() {
        return 0.0;
    }
    t.clamp(0.0, 1.0)
}

fn lerp(a: [u8; 3], b: [u8; 3], t: f64) -> Rgb<u8> {
    let t = clamp_unit(t);
    let ch = |i: usize| {
        let (x, y) = (f64::from(a[i]), f64::from(b[i]));
        (x + (y - x) * t).round().clamp(0.0, 255.0) as u8
    };
    Rgb([ch(0), ch(1), ch(2)])
}

pub fn viridis(t: f64) -> Rgb<u8> {
    let t = clamp_unit(t);
    let last = VIRIDIS_ANCHORS.len() - 1;
    let pos = t * last as f64;
    let i = (pos.floor() as usize).min(last);
    let j = (i + 1).min(last);
    lerp(VIRIDIS_ANCHORS[i], VIRIDIS_ANCHORS[j], pos - i as f64)
}

/// Black to red to yellow to white in three equal segments.
pub fn hot(t: f64) -> Rgb<u8> {
    let t = clamp_unit(t);
    let (r, g, b) = if t < 1.0 / 3.0 {
        (3.0 * t, 0.0, 0.0)
    } else if t < 2.0 / 3.0 {
        (1.0, 3.0 * t - 1.0, 0.0)
    } else {
        (1.0, 1.0, 3.0 * t - 2.0)
    };
    Rgb([to_byte(r), to_byte(g), to_byte(b)])
}

pub fn turbo(t: f64) -> Rgb<u8> {
    let t = clamp_unit(t);
    let r = (1.5 * t - 0.1).clamp(0.0, 1.0);
    let g = (1.5 - (2.0 * t - 1.0).abs() * 1.5).clamp(0.0, 1.0);
    let b = (1.2 * (1.0 - t)).clamp(0.0, 1.0);
    Rgb([to_byte(r), to_byte(g), to_byte(b)])
}

fn to_byte(v: f64) -> u8 {
    (255.0 * v.clamp(0.0, 1.0)) as u8
}

/// Range over the finite values, or `[0, 1]` when there are none.
pub fn value_range(values: impl IntoIterator<Item = f64>) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for v in values.into_iter().filter(|v| v.is_finite()) {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if lo.is_finite() && hi.is_finite() {
        (lo, hi)
    } else {
        (0.0, 1.0)
    }
}

/// Position of `v` inside `[lo, hi]`; a collapsed range maps to the start.
/// Non-finite values sit at the middle of the scale.
pub fn normalize(v: f64, lo: f64, hi: f64) -> f64 {
    if !v.is_finite() {
        return 0.5;
    }
    if hi > lo {
        ((v - lo) / (hi - lo)).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_hit_the_anchors() {
        assert_eq!(viridis(0.0), Rgb([68, 1, 84]));
        assert_eq!(viridis(1.0), Rgb([253, 231, 37]));
        assert_eq!(hot(0.0), Rgb([0, 0, 0]));
        assert_eq!(hot(1.0), Rgb([255, 255, 255]));
        assert_eq!(turbo(0.0), Rgb([0, 0, 255]));
        assert_eq!(turbo(1.0), Rgb([255, 0, 0]));
    }

    #[test]
    fn viridis_green_rises_monotonically() {
        let mut prev = 0u8;
        for step in 0..=100 {
            let g = viridis(f64::from(step) / 100.0).0[1];
            assert!(g >= prev, "green dropped at step {step}");
            prev = g;
        }
    }

    #[test]
    fn out_of_range_positions_clamp() {
        assert_eq!(viridis(-3.0), viridis(0.0));
        assert_eq!(hot(7.0), hot(1.0));
        assert_eq!(Colormap::Turbo.map(f64::NAN), turbo(0.0));
    }

    #[test]
    fn hot_passes_through_red_and_yellow() {
        assert_eq!(hot(1.0 / 3.0), Rgb([255, 0, 0]));
        assert_eq!(hot(2.0 / 3.0), Rgb([255, 255, 0]));
    }

    #[test]
    fn range_ignores_non_finite_and_falls_back() {
        assert_eq!(value_range([2.0, f64::NAN, -1.0, f64::INFINITY]), (-1.0, 2.0));
        assert_eq!(value_range([f64::NAN]), (0.0, 1.0));
        assert_eq!(value_range(std::iter::empty()), (0.0, 1.0));
    }

    #[test]
    fn collapsed_range_maps_to_start() {
        assert_eq!(normalize(4.0, 4.0, 4.0), 0.0);
        assert_eq!(normalize(3.0, 2.0, 4.0), 0.5);
        assert_eq!(normalize(9.0, 2.0, 4.0), 1.0);
        assert_eq!(normalize(f64::NAN, 2.0, 4.0), 0.5);
    }
}
