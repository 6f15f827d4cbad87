use crate::error::{PipelineError, PipelineResult};
use crate::profile::PipelineProfile;
use crate::provision::{default_launchers, ProvisionSettings, MANIFEST, STALE_LOCK_AFTER};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ASSETS_ROOT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/assets");

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppConfig {
    pub base_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub scratch_dir: Option<PathBuf>,
    pub python_launchers: Option<Vec<Vec<String>>>,
    /// `[major, minor]`
    pub min_python: (u32, u32),
    pub probe_timeout_ms: u64,
    pub profiles: Vec<PipelineProfile>,
    pub alpha_override: Option<f32>,
}

/// On-disk form; every key is optional and falls back to the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    base_dir: Option<PathBuf>,
    assets_dir: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    python_launchers: Option<Vec<Vec<String>>>,
    min_python: Option<(u32, u32)>,
    probe_timeout_ms: Option<u64>,
    profiles: Vec<PipelineProfile>,
    alpha_override: Option<f32>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn default_base_dir(var: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    non_empty(var("HOME"))
        .or_else(|| non_empty(var("USERPROFILE")))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".histoseg")
}

impl AppConfig {
    fn defaults(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            assets_dir: PathBuf::from(ASSETS_ROOT),
            scratch_dir: None,
            python_launchers: None,
            min_python: (3, 8),
            probe_timeout_ms: 5000,
            profiles: Vec::new(),
            alpha_override: None,
        }
    }

    /// Defaults, then the config file, then `HISTOSEG_*` environment overrides.
    pub fn load(explicit: Option<&Path>) -> PipelineResult<Self> {
        Self::load_with(explicit, &|k| env::var(k).ok())
    }

    pub fn load_with(explicit: Option<&Path>, var: &dyn Fn(&str) -> Option<String>) -> PipelineResult<Self> {
        let home_override = non_empty(var("HISTOSEG_HOME")).map(PathBuf::from);
        let base = home_override
            .clone()
            .unwrap_or_else(|| default_base_dir(var));
        let mut cfg = Self::defaults(base.clone());

        let file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Some(base.join("config.json")).filter(|p| p.is_file()),
        };
        if let Some(path) = file {
            let raw = fs::read_to_string(&path)
                .map_err(|e| PipelineError::io(format!("failed to read config {}", path.display()), e))?;
            let parsed: ConfigFile = serde_json::from_str(&raw).map_err(|source| PipelineError::Json {
                context: format!("invalid config {}", path.display()),
                source,
            })?;
            log::debug!("loaded config from {}", path.display());
            cfg.merge(parsed);
        }

        if let Some(home) = home_override {
            cfg.base_dir = home;
        }
        if let Some(assets) = non_empty(var("HISTOSEG_ASSETS")) {
            cfg.assets_dir = PathBuf::from(assets);
        }
        if let Some(scratch) = non_empty(var("HISTOSEG_SCRATCH")) {
            cfg.scratch_dir = Some(PathBuf::from(scratch));
        }
        if let Some(alpha) = cfg.alpha_override {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(PipelineError::InvalidParameter {
                    parameter: "alpha_override".to_string(),
                    value: alpha.to_string(),
                });
            }
        }
        Ok(cfg)
    }

    fn merge(&mut self, file: ConfigFile) {
        if let Some(v) = file.base_dir {
            self.base_dir = v;
        }
        if let Some(v) = file.assets_dir {
            self.assets_dir = v;
        }
        if file.scratch_dir.is_some() {
            self.scratch_dir = file.scratch_dir;
        }
        if file.python_launchers.is_some() {
            self.python_launchers = file.python_launchers;
        }
        if let Some(v) = file.min_python {
            self.min_python = v;
        }
        if let Some(v) = file.probe_timeout_ms {
            self.probe_timeout_ms = v;
        }
        self.profiles = file.profiles;
        if file.alpha_override.is_some() {
            self.alpha_override = file.alpha_override;
        }
    }

    pub fn session_path(&self) -> PathBuf {
        self.base_dir.join("session.json")
    }

    pub fn provision_settings(&self) -> ProvisionSettings {
        ProvisionSettings {
            base_dir: self.base_dir.clone(),
            launchers: self.python_launchers.clone().unwrap_or_else(default_launchers),
            min_python: self.min_python,
            probe_timeout: Duration::from_millis(self.probe_timeout_ms.max(1)),
            manifest: MANIFEST.to_string(),
            stale_lock_after: STALE_LOCK_AFTER,
        }
    }
}

/// Where rendered layers go: the flag, else `HISTOSEG_OUT_DIR`, else `.histoseg-out`.
pub fn out_root(flag: Option<&Path>) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| non_empty(env::var("HISTOSEG_OUT_DIR").ok()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(".histoseg-out"))
}
