use crate::calibration::Calibration;
use crate::composite::BackgroundSource;
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::MetricRecord;
use crate::profile::{PipelineProfile, TaskParams, TaskSpec};
use crate::visibility::Toggles;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Artifacts of the latest segmentation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationRun {
    pub profile: String,
    pub input: PathBuf,
    pub page: u32,
    pub workspace: PathBuf,
    pub labels: PathBuf,
    pub enhanced: Option<PathBuf>,
    pub raw: PathBuf,
    pub width: u32,
    pub height: u32,
    pub created_at: String,
}

/// Everything one operator's work carries between commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub calibration: Calibration,
    /// Keyed by `profile/task`; absent entries use the task's defaults.
    pub params: BTreeMap<String, TaskParams>,
    pub thresholds_bootstrapped: bool,
    pub toggles: Toggles,
    pub background: BackgroundSource,
    pub run: Option<SegmentationRun>,
    pub metrics: BTreeMap<String, MetricRecord>,
    pub updated_at: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            calibration: Calibration::default(),
            params: BTreeMap::new(),
            thresholds_bootstrapped: false,
            toggles: Toggles::default(),
            background: BackgroundSource::Enhanced,
            run: None,
            metrics: BTreeMap::new(),
            updated_at: None,
        }
    }
}

/// Partial parameter change; `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParamUpdate {
    pub min_distance: Option<f64>,
    pub threshold_rel: Option<f64>,
    pub sigma: Option<f64>,
    pub keep_low: Option<f64>,
    pub keep_high: Option<f64>,
    pub max_pair_px: Option<f64>,
}

fn param_key(profile: &str, task: &str) -> String {
    format!("{profile}/{task}")
}

fn check_range(parameter: &str, value: f64, valid: bool) -> PipelineResult<f64> {
    if value.is_finite() && valid {
        Ok(value)
    } else {
        Err(PipelineError::InvalidParameter {
            parameter: parameter.to_string(),
            value: value.to_string(),
        })
    }
}

impl Session {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| PipelineError::io(format!("failed to read session {}", path.display()), e))?;
        serde_json::from_str(&raw).map_err(|source| PipelineError::Json {
            context: format!("invalid session {}", path.display()),
            source,
        })
    }

    /// Write next to the target, then rename over it.
    pub fn save(&mut self, path: &Path) -> PipelineResult<()> {
        self.updated_at = Some(chrono::Utc::now().to_rfc3339());
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| PipelineError::io(format!("failed to create {}", dir.display()), e))?;
        let raw = serde_json::to_string_pretty(self).map_err(|source| PipelineError::Json {
            context: "failed to encode session".to_string(),
            source,
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| PipelineError::io(format!("failed to create a temp file in {}", dir.display()), e))?;
        tmp.write_all(raw.as_bytes())
            .map_err(|e| PipelineError::io("failed to write session", e))?;
        tmp.persist(path)
            .map_err(|e| PipelineError::io(format!("failed to replace {}", path.display()), e.error))?;
        Ok(())
    }

    pub fn require_run(&self) -> PipelineResult<&SegmentationRun> {
        self.run.as_ref().ok_or(PipelineError::NoSegmentation)
    }

    pub fn params_for(&self, profile: &str, task: &TaskSpec) -> TaskParams {
        self.params
            .get(&param_key(profile, &task.name))
            .copied()
            .unwrap_or(task.params)
    }

    /// Apply `update`; distances are given in calibrated units when `in_units` is set.
    pub fn update_params(
        &mut self,
        profile: &str,
        task: &TaskSpec,
        update: ParamUpdate,
        in_units: bool,
    ) -> PipelineResult<TaskParams> {
        let to_px = |v: f64| -> PipelineResult<f64> {
            if in_units {
                let scale = self.calibration.require()?;
                Ok(v / scale)
            } else {
                Ok(v)
            }
        };
        let mut p = self.params_for(profile, task);
        if let Some(v) = update.min_distance {
            p.min_distance = check_range("min-distance", to_px(v)?, v > 0.0)?;
        }
        if let Some(v) = update.max_pair_px {
            p.max_pair_px = check_range("max-pair", to_px(v)?, v > 0.0)?;
        }
        if let Some(v) = update.threshold_rel {
            p.threshold_rel = check_range("threshold-rel", v, (0.0..=1.0).contains(&v))?;
        }
        if let Some(v) = update.sigma {
            p.sigma = check_range("sigma", v, v >= 0.0)?;
        }
        if let Some(v) = update.keep_low {
            p.keep_low = check_range("keep-low", v, (0.0..1.0).contains(&v))?;
        }
        if let Some(v) = update.keep_high {
            p.keep_high = check_range("keep-high", v, (0.0..1.0).contains(&v))?;
        }
        if p.keep_low + p.keep_high >= 1.0 {
            return Err(PipelineError::InvalidParameter {
                parameter: "keep-low + keep-high".to_string(),
                value: (p.keep_low + p.keep_high).to_string(),
            });
        }
        self.params.insert(param_key(profile, &task.name), p);
        Ok(p)
    }

    /// The first time a calibration is usable, derive pixel thresholds from the physical
    /// defaults of every task that has them. Explicit settings are left alone.
    pub fn bootstrap_thresholds(&mut self, profiles: &[PipelineProfile]) -> bool {
        if self.thresholds_bootstrapped {
            return false;
        }
        if !self.calibration.is_calibrated() {
            return false;
        }
        for profile in profiles {
            for task in &profile.tasks {
                let Some((min_distance, max_pair)) = task.physical_defaults else {
                    continue;
                };
                let (Some(min_px), Some(max_px)) = (
                    self.calibration.to_pixels(min_distance),
                    self.calibration.to_pixels(max_pair),
                ) else {
                    continue;
                };
                let key = param_key(&profile.name, &task.name);
                if self.params.contains_key(&key) {
                    continue;
                }
                let mut p = task.params;
                p.min_distance = min_px;
                p.max_pair_px = max_px;
                log::info!(
                    "[{}] thresholds from calibration: min distance {:.2} px, max pair {:.2} px",
                    task.name,
                    p.min_distance,
                    p.max_pair_px
                );
                self.params.insert(key, p);
            }
        }
        self.thresholds_bootstrapped = true;
        true
    }

    /// A new run replaces every result tied to the previous one.
    pub fn start_run(&mut self, run: SegmentationRun) {
        self.metrics.clear();
        self.background = if run.enhanced.is_some() {
            BackgroundSource::Enhanced
        } else {
            BackgroundSource::Raw
        };
        self.run = Some(run);
    }
}
