use crate::composite::{self, BackgroundSource};
use crate::config::AppConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::host::HostSurface;
use crate::metrics::{self, MeasureRequest, MetricRecord};
use crate::overlay::{self, Layer};
use crate::profile::{self, detect_profile_name, find_profile, Enhancement, PipelineProfile, TaskSpec};
use crate::provision::{Provisioner, RuntimeEnvironment};
use crate::roi::Roi;
use crate::runner;
use crate::session::{SegmentationRun, Session};
use crate::visibility::{OverlayGroup, OverlayScene};
use crate::workspace::RunWorkspace;
use image::DynamicImage;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct SegmentRequest {
    pub input: PathBuf,
    pub page: u32,
    pub profile: Option<String>,
    pub detected_units_per_pixel: Option<f64>,
    pub detected_unit: Option<String>,
    pub skip_enhancement: bool,
}

/// Drives one session: provisioning, segmentation, measurements and rendering.
pub struct Pipeline<'a> {
    config: &'a AppConfig,
    profiles: Vec<PipelineProfile>,
    provisioner: Provisioner,
    pub session: Session,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a AppConfig, session: Session) -> Self {
        Self {
            profiles: profile::resolve_profiles(&config.profiles),
            provisioner: Provisioner::new(config.provision_settings()),
            config,
            session,
        }
    }

    pub fn profiles(&self) -> &[PipelineProfile] {
        &self.profiles
    }

    pub fn ensure_environment(&mut self) -> PipelineResult<RuntimeEnvironment> {
        self.provisioner.ensure_environment().map_err(|err| {
            log::error!("[venv] {err}");
            PipelineError::from(err)
        })
    }

    fn run_profile(&self) -> PipelineResult<PipelineProfile> {
        let run = self.session.require_run()?;
        find_profile(&self.profiles, &run.profile)
    }

    /// Task of the active run's profile. A task that only another profile knows means the
    /// segmentation was done with the wrong profile.
    pub fn resolve_task(&self, profile: &PipelineProfile, name: &str) -> PipelineResult<TaskSpec> {
        if let Ok(task) = profile.task(name) {
            return Ok(task.clone());
        }
        if let Some(other) = self.profiles.iter().find(|p| p.task(name).is_ok()) {
            return Err(PipelineError::ProfileMismatch {
                task: name.to_string(),
                expected: other.name.clone(),
                actual: profile.name.clone(),
            });
        }
        Err(PipelineError::UnknownTask {
            profile: profile.name.clone(),
            task: name.to_string(),
        })
    }

    /// Profile named on the command line, else the one of the latest run.
    pub fn profile_or_run(&self, name: Option<&str>) -> PipelineResult<PipelineProfile> {
        match name {
            Some(name) => find_profile(&self.profiles, name),
            None => self.run_profile(),
        }
    }

    pub fn segment(&mut self, req: &SegmentRequest) -> PipelineResult<&SegmentationRun> {
        let profile_name = req
            .profile
            .clone()
            .unwrap_or_else(|| detect_profile_name(&req.input).to_string());
        let profile = find_profile(&self.profiles, &profile_name)?;
        let prefix = format!("[seg:{}] ", profile.model);

        if self
            .session
            .calibration
            .observe_detected(req.detected_units_per_pixel, req.detected_unit.as_deref())
        {
            log::info!("{prefix}using detected calibration");
        }
        if profile.calibration_before_segmentation {
            self.session.calibration.require().inspect_err(|err| log::error!("{prefix}{err}"))?;
        }
        self.session.bootstrap_thresholds(&self.profiles);

        let env = self.ensure_environment()?;
        let ws = RunWorkspace::create(self.config.scratch_dir.as_deref())?;
        ws.install_assets(&self.config.assets_dir, &profile)
            .inspect_err(|err| log::error!("{prefix}{err}"))?;
        let raw = ws
            .save_raw_snapshot(&req.input, req.page)
            .inspect_err(|err| log::error!("{prefix}{err}"))?;

        let path = |p: &Path| p.display().to_string();
        let vars = BTreeMap::from([
            ("script", path(&ws.script(&profile.segment_script))),
            ("input", path(&req.input)),
            ("page", req.page.to_string()),
            ("model", profile.model.clone()),
            ("modeldir", path(&ws.models_dir())),
            ("output", path(&ws.label_image())),
            ("enhanced", path(&ws.enhanced_image())),
            ("enhance", (if req.skip_enhancement { "0" } else { "1" }).to_string()),
        ]);
        let args = profile::expand_args(&profile.segment_args, &vars)?;
        log::info!("{prefix}segmenting {}", req.input.display());
        let outcome = runner::run_logged(&env.python, &args, Some(ws.path()), &prefix)?;
        if !outcome.success() {
            log::error!("{prefix}exited with {:?}", outcome.code);
            return Err(PipelineError::ProcessFailed {
                stage: "segmentation".to_string(),
                code: outcome.code,
                stderr_tail: outcome.stderr_tail,
            });
        }
        let labels_path = ws.label_image();
        if !labels_path.is_file() {
            log::error!("{prefix}no label image at {}", labels_path.display());
            return Err(PipelineError::MissingOutput {
                stage: "segmentation".to_string(),
                path: labels_path,
            });
        }
        let labels = composite::load_labels(&labels_path)?;
        let (width, height) = labels.dimensions();

        let enhanced = match profile.enhancement {
            Enhancement::External if !req.skip_enhancement => {
                Some(ws.enhanced_image()).filter(|p| p.is_file())
            }
            Enhancement::External => None,
            Enhancement::PercentileStretch { low, high } => {
                let stretched = composite::stretch_image(&composite::open_image(&raw)?, low, high);
                let out = ws.enhanced_image();
                composite::save_image(&DynamicImage::ImageLuma8(stretched), &out)?;
                Some(out)
            }
        };
        if enhanced.is_none() {
            log::info!("{prefix}no enhanced background; showing the raw page");
        }

        self.session.start_run(SegmentationRun {
            profile: profile.name.clone(),
            input: req.input.clone(),
            page: req.page,
            workspace: ws.path().to_path_buf(),
            labels: labels_path,
            enhanced,
            raw,
            width,
            height,
            created_at: chrono::Utc::now().to_rfc3339(),
        });
        log::info!("{prefix}done ({width}x{height})");
        self.session.require_run()
    }

    pub fn measure(&mut self, task_name: &str, roi: Option<Roi>) -> PipelineResult<MetricRecord> {
        let profile = self.run_profile()?;
        let task = self.resolve_task(&profile, task_name)?;
        let prefix = format!("[metrics:{}] ", task.name);
        if task.kind != profile::MetricKind::Count {
            self.session
                .calibration
                .require()
                .inspect_err(|err| log::error!("{prefix}{err}"))?;
        }
        self.session.bootstrap_thresholds(&self.profiles);

        let run = self.session.require_run()?.clone();
        let ws = RunWorkspace::open(&run.workspace)?;
        let script = ws.script(&profile.metrics_script);
        if !script.is_file() {
            return Err(PipelineError::MissingAsset { path: script });
        }
        let env = self.ensure_environment()?;
        let labels = composite::load_labels(&run.labels)?;
        let params = self.session.params_for(&profile.name, &task);
        let record = metrics::run_measurement(&MeasureRequest {
            python: &env.python,
            script: &script,
            work_dir: ws.path(),
            task: &task,
            params: &params,
            labels: &labels,
            roi,
        })
        .inspect_err(|err| log::error!("{prefix}{err}"))?;

        log::info!("{prefix}{}", record.summary(&self.session.calibration));
        self.session.metrics.insert(task.name.clone(), record.clone());
        Ok(record)
    }

    pub fn set_background(&mut self, source: BackgroundSource) -> PipelineResult<()> {
        let profile = self.run_profile()?;
        if !profile.background_toggle {
            return Err(PipelineError::BackgroundToggleUnsupported(profile.name));
        }
        let run = self.session.require_run()?;
        if source == BackgroundSource::Enhanced && run.enhanced.is_none() {
            return Err(PipelineError::InvalidParameter {
                parameter: "background".to_string(),
                value: "this run produced no enhanced image".to_string(),
            });
        }
        self.session.background = source;
        Ok(())
    }

    /// Build every overlay group from the session state and apply the toggles.
    pub fn build_scene(&self, profile: &PipelineProfile, size: (u32, u32)) -> OverlayScene {
        let mut scene = OverlayScene::new();
        scene.replace_group(OverlayGroup::Legend, overlay::legend_items(profile));
        for task in &profile.tasks {
            let Some(record) = self.session.metrics.get(&task.name) else {
                continue;
            };
            for (group, items) in metrics::record_groups(record, task, &self.session.calibration, size) {
                scene.replace_group(group, items);
            }
        }
        let line = metrics::banner_line(profile, &self.session.metrics, &self.session.calibration);
        scene.replace_group(
            OverlayGroup::StatsBanner,
            overlay::stats_banner_items(size.0, size.1, &line),
        );
        scene.apply_all(&self.session.toggles);
        scene
    }

    /// Recomposite from the unchanged label image and publish both layers.
    pub fn render(&self, host: &mut dyn HostSurface) -> PipelineResult<Value> {
        let profile = self.run_profile()?;
        let run = self.session.require_run()?;
        let bg_path = match (self.session.background, &run.enhanced) {
            (BackgroundSource::Enhanced, Some(enhanced)) => enhanced,
            _ => &run.raw,
        };
        let background = composite::load_rgb(bg_path)?;
        let labels = composite::load_labels(&run.labels)?;
        let alpha = self.config.alpha_override.unwrap_or(profile.alpha);
        let layers = composite::composite(&background, &labels, &profile.lut(), alpha)?;

        let scene = self.build_scene(&profile, labels.dimensions());
        let bg_layer = overlay::render_layer(&layers.background, scene.visible_items(), Layer::Background);
        let ov_layer = overlay::render_layer(&layers.overlay, scene.visible_items(), Layer::Overlay);

        let cal = &self.session.calibration;
        let metrics: BTreeMap<&str, Value> = self
            .session
            .metrics
            .iter()
            .map(|(name, rec)| {
                let value = rec.value(cal).map(|(v, unit)| json!({ "value": v, "unit": unit }));
                (
                    name.as_str(),
                    json!({
                        "summary": rec.summary(cal),
                        "display": value,
                        "scalar_px": rec.scalar_px,
                        "points": rec.points.len(),
                        "pairs": rec.pairs.len(),
                        "roi": rec.roi,
                        "measured_at": rec.measured_at,
                    }),
                )
            })
            .collect();
        let visible: Vec<&str> = scene.visible_groups().iter().map(|g| g.as_str()).collect();
        let mut sidecar = json!({
            "profile": profile.name,
            "input": run.input,
            "page": run.page,
            "workspace": run.workspace,
            "background": self.session.background,
            "alpha": alpha,
            "calibration": cal,
            "metrics": metrics,
            "visible_groups": visible,
            "rendered_at": chrono::Utc::now().to_rfc3339(),
        });
        let written = host.show_layers(&[("background", &bg_layer), ("overlay", &ov_layer)], &sidecar)?;
        sidecar["files"] = json!(written);
        Ok(sidecar)
    }
}
