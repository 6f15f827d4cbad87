mod calibration;
mod colormap;
mod composite;
mod config;
mod error;
mod host;
mod metrics;
mod overlay;
mod pipeline;
mod profile;
mod provision;
mod roi;
mod runner;
mod session;
mod visibility;
mod workspace;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use composite::BackgroundSource;
use config::{out_root, AppConfig};
use error::PipelineError;
use host::FileHost;
use pipeline::{Pipeline, SegmentRequest};
use profile::PipelineProfile;
use roi::Roi;
use serde_json::{json, Value};
use session::{ParamUpdate, Session};
use std::path::{Path, PathBuf};
use visibility::OverlayGroup;

#[derive(Parser, Debug)]
#[command(
    name = "histoseg",
    version,
    about = "Run microscopy segmentation and measurements, and render calibrated overlays"
)]
struct Cli {
    /// Config file (default: <base_dir>/config.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Session file (default: <base_dir>/session.json)
    #[arg(long, global = true)]
    session: Option<PathBuf>,
    /// Directory for rendered layers (default: $HISTOSEG_OUT_DIR or .histoseg-out)
    #[arg(long, global = true)]
    out: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or validate the isolated analysis environment
    Provision,
    /// List built-in and configured pipeline profiles
    Profiles,
    /// Show or change the pixel calibration
    Calibrate(CalibrateArgs),
    /// Segment an image and render the labelled overlay
    Segment(SegmentArgs),
    /// Run a measurement task on the latest segmentation
    Measure(MeasureArgs),
    /// Show or change a task's parameters
    Params(ParamsArgs),
    /// Show or hide an overlay group
    Toggle(ToggleArgs),
    /// Switch the background between the enhanced image and the raw page
    Background(BackgroundArgs),
    /// Re-render every layer from the session
    Render,
    /// Print the session summary
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn enabled(self) -> bool {
        self == Switch::On
    }
}

#[derive(Args, Debug)]
struct CalibrateArgs {
    /// Real-world size of one pixel
    #[arg(long)]
    units_per_pixel: Option<f64>,
    /// Unit label (e.g. µm); pixel-like units leave the image uncalibrated
    #[arg(long)]
    unit: Option<String>,
    /// Sample expansion factor (>= 1)
    #[arg(long)]
    expansion_factor: Option<f64>,
    /// Apply the expansion factor to conversions
    #[arg(long, value_enum)]
    expansion: Option<Switch>,
    /// Restore the calibration detected for the last input image
    #[arg(long)]
    reset_auto: bool,
}

#[derive(Args, Debug)]
struct SegmentArgs {
    /// Input image
    input: PathBuf,
    /// Page / plane index passed to the segmentation step
    #[arg(long, default_value_t = 0)]
    page: u32,
    /// Pipeline profile (default: detected from the file name)
    #[arg(long)]
    profile: Option<String>,
    /// Calibration reported for the input image
    #[arg(long)]
    detected_units_per_pixel: Option<f64>,
    #[arg(long, requires = "detected_units_per_pixel")]
    detected_unit: Option<String>,
    /// Ask the segmentation step not to produce an enhanced background
    #[arg(long)]
    skip_enhancement: bool,
}

#[derive(Args, Debug)]
struct MeasureArgs {
    /// Task name of the active profile (e.g. thickness, process, nuclei, rbc)
    task: String,
    /// Restrict the measurement to x,y,w,h in image pixels
    #[arg(long)]
    roi: Option<Roi>,
}

#[derive(Args, Debug)]
struct ParamsArgs {
    task: String,
    /// Profile owning the task (default: profile of the latest run)
    #[arg(long)]
    profile: Option<String>,
    /// Minimum peak separation
    #[arg(long)]
    min_distance: Option<f64>,
    /// Relative peak threshold (0..1)
    #[arg(long)]
    threshold_rel: Option<f64>,
    /// Smoothing sigma
    #[arg(long)]
    sigma: Option<f64>,
    /// Fraction of the smallest objects to drop
    #[arg(long)]
    keep_low: Option<f64>,
    /// Fraction of the largest objects to drop
    #[arg(long)]
    keep_high: Option<f64>,
    /// Maximum pairing distance
    #[arg(long)]
    max_pair: Option<f64>,
    /// Distances are given in calibrated units instead of pixels
    #[arg(long)]
    in_units: bool,
}

#[derive(Args, Debug)]
struct ToggleArgs {
    group: OverlayGroup,
    #[arg(value_enum)]
    state: Switch,
}

#[derive(Args, Debug)]
struct BackgroundArgs {
    #[arg(value_enum)]
    source: BackgroundSource,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("HISTOSEG_LOG", "info")).init();
    if let Err(err) = run() {
        let defect = err
            .downcast_ref::<PipelineError>()
            .is_some_and(PipelineError::is_packaging_defect);
        if defect {
            eprintln!("error: packaging defect: {err:#}");
        } else {
            eprintln!("error: {err:#}");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    let session_path = cli.session.clone().unwrap_or_else(|| config.session_path());
    let out_dir = out_root(cli.out.as_deref());

    let session = Session::load(&session_path)?;
    let mut pipeline = Pipeline::new(&config, session);
    let saves = cli.command.saves_session();
    let report = dispatch(&mut pipeline, cli.command, &out_dir)?;
    if saves {
        pipeline
            .session
            .save(&session_path)
            .with_context(|| format!("failed to save session {}", session_path.display()))?;
    }
    print_json(&report)
}

impl Commands {
    fn saves_session(&self) -> bool {
        !matches!(self, Commands::Provision | Commands::Profiles | Commands::Status)
    }
}

fn dispatch(pipeline: &mut Pipeline<'_>, command: Commands, out_dir: &Path) -> Result<Value> {
    match command {
        Commands::Provision => command_provision(pipeline),
        Commands::Profiles => Ok(profiles_json(pipeline.profiles())),
        Commands::Calibrate(args) => command_calibrate(pipeline, args),
        Commands::Segment(args) => command_segment(pipeline, args, out_dir),
        Commands::Measure(args) => command_measure(pipeline, args, out_dir),
        Commands::Params(args) => command_params(pipeline, args),
        Commands::Toggle(args) => command_toggle(pipeline, args, out_dir),
        Commands::Background(args) => {
            pipeline.set_background(args.source)?;
            render_to(pipeline, out_dir)
        }
        Commands::Render => render_to(pipeline, out_dir),
        Commands::Status => Ok(status(pipeline)),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn command_provision(pipeline: &mut Pipeline<'_>) -> Result<Value> {
    let env = pipeline.ensure_environment()?;
    Ok(json!({ "ready": true, "environment": env }))
}

fn profiles_json(profiles: &[PipelineProfile]) -> Value {
    let rows: Vec<Value> = profiles
        .iter()
        .map(|p| {
            let tasks: Vec<Value> = p
                .tasks
                .iter()
                .map(|t| json!({ "name": t.name, "kind": t.kind, "banner": t.banner_label }))
                .collect();
            let labels: Vec<Value> = p
                .labels
                .iter()
                .map(|c| json!({ "value": c.value, "name": c.name, "color": c.color }))
                .collect();
            json!({
                "name": p.name,
                "model": p.model,
                "alpha": p.alpha,
                "enhancement": p.enhancement,
                "background_toggle": p.background_toggle,
                "calibration_before_segmentation": p.calibration_before_segmentation,
                "labels": labels,
                "tasks": tasks,
            })
        })
        .collect();
    json!({ "profiles": rows })
}

fn calibration_json(pipeline: &Pipeline<'_>) -> Value {
    let cal = &pipeline.session.calibration;
    json!({
        "calibration": cal,
        "calibrated": cal.is_calibrated(),
        "effective_units_per_pixel": cal.require().ok(),
        "effective_expansion_factor": cal.effective_factor(),
    })
}

fn command_calibrate(pipeline: &mut Pipeline<'_>, args: CalibrateArgs) -> Result<Value> {
    let cal = &mut pipeline.session.calibration;
    if args.reset_auto && !cal.reset_to_auto() {
        log::warn!("[calibrate] no detected calibration to restore");
    }
    if let Some(size) = args.units_per_pixel {
        cal.set_pixel_size(size)?;
    }
    if let Some(unit) = args.unit {
        cal.unit = unit.trim().to_string();
    }
    if let Some(factor) = args.expansion_factor {
        cal.set_expansion_factor(factor)?;
    }
    if let Some(state) = args.expansion {
        cal.expansion_enabled = state.enabled();
    }
    if !cal.is_calibrated() {
        log::warn!("[calibrate] image is uncalibrated; unit-dependent measurements are blocked");
    }
    let profiles = pipeline.profiles().to_vec();
    pipeline.session.bootstrap_thresholds(&profiles);
    Ok(calibration_json(pipeline))
}

fn command_segment(pipeline: &mut Pipeline<'_>, args: SegmentArgs, out_dir: &Path) -> Result<Value> {
    let run = pipeline
        .segment(&SegmentRequest {
            input: args.input,
            page: args.page,
            profile: args.profile,
            detected_units_per_pixel: args.detected_units_per_pixel,
            detected_unit: args.detected_unit,
            skip_enhancement: args.skip_enhancement,
        })?
        .clone();
    let mut report = render_to(pipeline, out_dir)?;
    report["run"] = json!(run);
    Ok(report)
}

fn command_measure(pipeline: &mut Pipeline<'_>, args: MeasureArgs, out_dir: &Path) -> Result<Value> {
    let record = pipeline.measure(&args.task, args.roi)?;
    let cal = &pipeline.session.calibration;
    let summary = record.summary(cal);
    let value = record.value(cal).map(|(v, unit)| json!({ "value": v, "unit": unit }));
    let mut report = render_to(pipeline, out_dir)?;
    report["measurement"] = json!({
        "task": record.task,
        "summary": summary,
        "value": value,
        "roi": record.roi,
        "points": record.points.len(),
        "pairs": record.pairs.len(),
    });
    Ok(report)
}

fn command_params(pipeline: &mut Pipeline<'_>, args: ParamsArgs) -> Result<Value> {
    let profile = pipeline.profile_or_run(args.profile.as_deref())?;
    let task = pipeline.resolve_task(&profile, &args.task)?;
    let update = ParamUpdate {
        min_distance: args.min_distance,
        threshold_rel: args.threshold_rel,
        sigma: args.sigma,
        keep_low: args.keep_low,
        keep_high: args.keep_high,
        max_pair_px: args.max_pair,
    };
    let params = if update == ParamUpdate::default() {
        pipeline.session.params_for(&profile.name, &task)
    } else {
        pipeline
            .session
            .update_params(&profile.name, &task, update, args.in_units)?
    };
    let cal = &pipeline.session.calibration;
    Ok(json!({
        "profile": profile.name,
        "task": task.name,
        "params": params,
        "min_distance_units": cal.to_units(params.min_distance),
        "max_pair_units": cal.to_units(params.max_pair_px),
        "unit": cal.unit,
    }))
}

fn command_toggle(pipeline: &mut Pipeline<'_>, args: ToggleArgs, out_dir: &Path) -> Result<Value> {
    pipeline.session.toggles.set(args.group, args.state.enabled());
    if pipeline.session.run.is_none() {
        return Ok(json!({
            "group": args.group,
            "visible": args.state.enabled(),
            "rendered": false,
        }));
    }
    render_to(pipeline, out_dir)
}

fn render_to(pipeline: &Pipeline<'_>, out_dir: &Path) -> Result<Value> {
    let mut host = FileHost::new(out_dir);
    let sidecar = pipeline.render(&mut host)?;
    log::info!("[render] layers written to {}", host.out_dir().display());
    Ok(sidecar)
}

fn status(pipeline: &Pipeline<'_>) -> Value {
    let session = &pipeline.session;
    let cal = &session.calibration;
    let metrics: Vec<Value> = session
        .metrics
        .values()
        .map(|r| json!({ "task": r.task, "summary": r.summary(cal), "measured_at": r.measured_at }))
        .collect();
    let toggles: Vec<Value> = OverlayGroup::ALL
        .iter()
        .map(|g| json!({ "group": g, "visible": session.toggles.is_visible(*g) }))
        .collect();
    let mut report = calibration_json(pipeline);
    report["run"] = json!(session.run);
    report["background"] = json!(session.background);
    report["metrics"] = json!(metrics);
    report["toggles"] = json!(toggles);
    report["thresholds_bootstrapped"] = json!(session.thresholds_bootstrapped);
    report["updated_at"] = json!(session.updated_at);
    report
}
