use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};

pub const DEFAULT_EXPANSION_FACTOR: f64 = 3.5;

/// Physical size of one image pixel, with the sample-expansion correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub units_per_pixel: Option<f64>,
    pub unit: String,
    pub expansion_factor: f64,
    pub expansion_enabled: bool,
    #[serde(default)]
    pub auto_detected: Option<DetectedCalibration>,
}

/// What the host reported for the source image; kept for "reset to auto".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedCalibration {
    pub units_per_pixel: f64,
    pub unit: String,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            units_per_pixel: None,
            unit: "\u{b5}m".to_string(),
            expansion_factor: DEFAULT_EXPANSION_FACTOR,
            expansion_enabled: true,
            auto_detected: None,
        }
    }
}

pub fn unit_looks_like_pixel(unit: &str) -> bool {
    let u = unit.trim().to_ascii_lowercase();
    u.is_empty() || u == "pixel" || u == "pixels" || u == "px"
}

/// Convert a pixel-unit measurement into calibrated units.
pub fn to_calibrated(value_px: f64, units_per_pixel: f64, expansion_enabled: bool, factor: f64) -> f64 {
    value_px * effective_units_per_pixel(units_per_pixel, expansion_enabled, factor)
}

pub fn effective_units_per_pixel(units_per_pixel: f64, expansion_enabled: bool, factor: f64) -> f64 {
    if expansion_enabled && factor > 0.0 {
        units_per_pixel / factor
    } else {
        units_per_pixel
    }
}

impl Calibration {
    pub fn effective_factor(&self) -> f64 {
        if self.expansion_enabled && self.expansion_factor > 0.0 {
            self.expansion_factor
        } else {
            1.0
        }
    }

    /// Real-world size of one pixel, or the reason the calibration cannot be used.
    pub fn require(&self) -> PipelineResult<f64> {
        if unit_looks_like_pixel(&self.unit) {
            return Err(PipelineError::CalibrationRequired {
                reason: format!("unit = '{}'", self.unit.trim()),
            });
        }
        match self.units_per_pixel {
            Some(v) if v.is_finite() && v > 0.0 => {
                Ok(effective_units_per_pixel(v, self.expansion_enabled, self.expansion_factor))
            }
            Some(v) => Err(PipelineError::CalibrationRequired {
                reason: format!("pixel size {v} is not positive"),
            }),
            None => Err(PipelineError::CalibrationRequired {
                reason: "pixel size not set".to_string(),
            }),
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.require().is_ok()
    }

    pub fn to_units(&self, value_px: f64) -> Option<f64> {
        self.require().ok()?;
        let upp = self.units_per_pixel?;
        Some(to_calibrated(value_px, upp, self.expansion_enabled, self.expansion_factor))
    }

    /// Inverse of `to_units`, used when parameters are entered in calibrated units.
    pub fn to_pixels(&self, value_units: f64) -> Option<f64> {
        self.require().ok().map(|scale| value_units / scale)
    }

    /// Record what the host detected; seeds the user calibration when none was set.
    /// Returns true when the user calibration was seeded.
    pub fn observe_detected(&mut self, units_per_pixel: Option<f64>, unit: Option<&str>) -> bool {
        let Some(size) = units_per_pixel.filter(|v| v.is_finite() && *v > 0.0) else {
            return false;
        };
        let unit = unit
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or("\u{b5}m")
            .to_string();
        self.auto_detected = Some(DetectedCalibration {
            units_per_pixel: size,
            unit: unit.clone(),
        });
        if self.units_per_pixel.is_none() {
            self.units_per_pixel = Some(size);
            self.unit = unit;
            return true;
        }
        false
    }

    pub fn reset_to_auto(&mut self) -> bool {
        match &self.auto_detected {
            Some(detected) => {
                self.units_per_pixel = Some(detected.units_per_pixel);
                self.unit = detected.unit.clone();
                true
            }
            None => false,
        }
    }

    pub fn set_pixel_size(&mut self, value: f64) -> PipelineResult<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(PipelineError::InvalidParameter {
                parameter: "units-per-pixel".to_string(),
                value: value.to_string(),
            });
        }
        self.units_per_pixel = Some(value);
        Ok(())
    }

    pub fn set_expansion_factor(&mut self, value: f64) -> PipelineResult<()> {
        if !value.is_finite() || value < 1.0 {
            return Err(PipelineError::InvalidParameter {
                parameter: "expansion-factor".to_string(),
                value: value.to_string(),
            });
        }
        self.expansion_factor = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibrated(size: f64, unit: &str, ef: f64, enabled: bool) -> Calibration {
        Calibration {
            units_per_pixel: Some(size),
            unit: unit.to_string(),
            expansion_factor: ef,
            expansion_enabled: enabled,
            auto_detected: None,
        }
    }

    #[test]
    fn pixel_like_units_are_rejected() {
        for unit in ["", "  ", "pixel", "Pixels", "PX"] {
            assert!(unit_looks_like_pixel(unit), "{unit:?}");
            let cal = calibrated(0.5, unit, 1.0, false);
            assert!(matches!(
                cal.require(),
                Err(PipelineError::CalibrationRequired { .. })
            ));
        }
        assert!(!unit_looks_like_pixel("nm"));
    }

    #[test]
    fn missing_or_non_positive_size_blocks() {
        let mut cal = Calibration::default();
        assert!(!cal.is_calibrated());
        cal.units_per_pixel = Some(0.0);
        assert!(!cal.is_calibrated());
        assert!(cal.set_pixel_size(-1.0).is_err());
        cal.set_pixel_size(0.25).unwrap();
        assert!(cal.is_calibrated());
    }

    #[test]
    fn expansion_factor_divides_the_pixel_size() {
        assert_eq!(to_calibrated(3.0, 2.0, true, 4.0), 3.0 * 0.5);
        assert_eq!(to_calibrated(3.0, 2.0, false, 4.0), 6.0);
    }

    #[test]
    fn scalar_conversion_with_expansion() {
        let cal = calibrated(0.2, "\u{b5}m", 5.0, true);
        let shown = cal.to_units(12.5).unwrap();
        assert!((shown - 0.5).abs() < 1e-12);
        assert!((cal.to_pixels(shown).unwrap() - 12.5).abs() < 1e-9);
    }

    #[test]
    fn expansion_factor_below_one_is_invalid() {
        let mut cal = Calibration::default();
        assert!(cal.set_expansion_factor(0.5).is_err());
        cal.set_expansion_factor(4.0).unwrap();
        assert_eq!(cal.effective_factor(), 4.0);
        cal.expansion_enabled = false;
        assert_eq!(cal.effective_factor(), 1.0);
    }

    #[test]
    fn detected_values_seed_and_reset() {
        let mut cal = Calibration::default();
        assert!(cal.observe_detected(Some(0.11), Some("nm")));
        assert_eq!(cal.units_per_pixel, Some(0.11));
        assert_eq!(cal.unit, "nm");

        cal.set_pixel_size(0.3).unwrap();
        cal.unit = "mm".to_string();
        assert!(!cal.observe_detected(Some(0.2), None));
        assert_eq!(cal.units_per_pixel, Some(0.3));

        assert!(cal.reset_to_auto());
        assert_eq!(cal.units_per_pixel, Some(0.2));
        assert_eq!(cal.unit, "\u{b5}m");
    }
}
