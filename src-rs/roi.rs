use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Rectangle in result-image pixels. Coordinates produced for a cropped mask are local to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> PipelineResult<Self> {
        if w == 0 || h == 0 {
            return Err(PipelineError::InvalidRoi(format!(
                "{w}x{h} has no area"
            )));
        }
        Ok(Self { x, y, w, h })
    }

    /// Clip to an image; fails when nothing of the rectangle is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> PipelineResult<Self> {
        if self.x >= width || self.y >= height {
            return Err(PipelineError::InvalidRoi(format!(
                "origin ({}, {}) lies outside the {width}x{height} image",
                self.x, self.y
            )));
        }
        let w = self.w.min(width - self.x);
        let h = self.h.min(height - self.y);
        Self::new(self.x, self.y, w, h)
    }

    pub fn origin(&self) -> (f64, f64) {
        (f64::from(self.x), f64::from(self.y))
    }
}

impl FromStr for Roi {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(PipelineError::InvalidRoi(format!(
                "expected x,y,w,h but got `{raw}`"
            )));
        }
        let mut nums = [0u32; 4];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part
                .parse::<u32>()
                .map_err(|_| PipelineError::InvalidRoi(format!("`{part}` is not a pixel count")))?;
        }
        Roi::new(nums[0], nums[1], nums[2], nums[3])
    }
}

fn origin_of(roi: Option<&Roi>) -> (f64, f64) {
    roi.map(Roi::origin).unwrap_or((0.0, 0.0))
}

pub fn local_to_global(p: (f64, f64), roi: Option<&Roi>) -> (f64, f64) {
    let (ox, oy) = origin_of(roi);
    (p.0 + ox, p.1 + oy)
}

pub fn global_to_local(p: (f64, f64), roi: Option<&Roi>) -> (f64, f64) {
    let (ox, oy) = origin_of(roi);
    (p.0 - ox, p.1 - oy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_rejects() {
        let roi: Roi = "100, 200,30,40".parse().unwrap();
        assert_eq!(roi, Roi { x: 100, y: 200, w: 30, h: 40 });
        assert!("1,2,3".parse::<Roi>().is_err());
        assert!("1,2,0,4".parse::<Roi>().is_err());
        assert!("a,2,3,4".parse::<Roi>().is_err());
    }

    #[test]
    fn remap_round_trips_for_any_offset() {
        let p = (12.25, 7.5);
        for roi in [None, Some(Roi { x: 0, y: 0, w: 1, h: 1 }), Some(Roi { x: 100, y: 200, w: 5, h: 5 })] {
            let local = global_to_local(p, roi.as_ref());
            assert_eq!(local_to_global(local, roi.as_ref()), p);
        }
    }

    #[test]
    fn clamps_to_image_bounds() {
        let roi = Roi::new(90, 10, 50, 50).unwrap();
        assert_eq!(roi.clamp_to(100, 40).unwrap(), Roi { x: 90, y: 10, w: 10, h: 30 });
        assert!(Roi::new(200, 0, 5, 5).unwrap().clamp_to(100, 100).is_err());
    }
}
