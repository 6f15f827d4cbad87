use crate::calibration::Calibration;
use crate::composite::{load_labels, save_image};
use crate::error::{PipelineError, PipelineResult};
use crate::overlay::{self, OverlayItem};
use crate::profile::{expand_args, LabelSelector, MetricKind, PipelineProfile, TaskParams, TaskSpec};
use crate::roi::{local_to_global, Roi};
use crate::runner;
use crate::visibility::OverlayGroup;
use image::{DynamicImage, GrayImage, Luma};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Fixed per-task artifact names inside the run workspace; reruns overwrite them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFiles {
    pub mask: PathBuf,
    pub scalar: PathBuf,
    pub csv: PathBuf,
    pub labels: PathBuf,
    pub contours: PathBuf,
    pub outer_contours: PathBuf,
}

impl TaskFiles {
    pub fn in_dir(dir: &Path, task: &str) -> Self {
        Self {
            mask: dir.join(format!("{task}_mask.tif")),
            scalar: dir.join(format!("{task}.txt")),
            csv: dir.join(format!("{task}.csv")),
            labels: dir.join(format!("{task}_labels.tif")),
            contours: dir.join(format!("{task}_contours.tif")),
            outer_contours: dir.join(format!("{task}_outer_contours.tif")),
        }
    }

    fn outputs(&self) -> [&Path; 5] {
        [
            &self.scalar,
            &self.csv,
            &self.labels,
            &self.contours,
            &self.outer_contours,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub x: f64,
    pub y: f64,
    /// Pixel units; absent when the row carried no value.
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPair {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl MetricPair {
    pub fn length_px(&self) -> f64 {
        (self.x1 - self.x0).hypot(self.y1 - self.y0)
    }
}

/// Result of one measurement, stored in pixel units and image-global coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub task: String,
    pub kind: MetricKind,
    pub scalar_px: Option<f64>,
    #[serde(default)]
    pub points: Vec<MetricPoint>,
    #[serde(default)]
    pub pairs: Vec<MetricPair>,
    pub roi: Option<Roi>,
    #[serde(default)]
    pub contour_files: Vec<PathBuf>,
    pub measured_at: String,
}

impl MetricRecord {
    /// Scalar in display units with its unit label. Counts are unitless.
    pub fn value(&self, calibration: &Calibration) -> Option<(f64, String)> {
        let v = self.scalar_px?;
        match self.kind {
            MetricKind::Count => Some((v, String::new())),
            _ => calibration
                .to_units(v)
                .map(|units| (units, calibration.unit.clone())),
        }
    }

    pub fn summary(&self, calibration: &Calibration) -> String {
        match (self.kind, self.value(calibration)) {
            (_, None) => "unavailable".to_string(),
            (MetricKind::Count, Some((v, _))) => format!("{}", v.round() as i64),
            (_, Some((v, unit))) => format!("{} {unit}", overlay::format_value(v)),
        }
    }
}

/// 255 where the selector matches, 0 elsewhere, cropped to the ROI when one is given.
/// Returns the mask and the ROI clipped to the label image.
pub fn build_mask(
    labels: &GrayImage,
    selector: LabelSelector,
    roi: Option<&Roi>,
) -> PipelineResult<(GrayImage, Option<Roi>)> {
    let (w, h) = labels.dimensions();
    let roi = roi.map(|r| r.clamp_to(w, h)).transpose()?;
    let (ox, oy, mw, mh) = match roi {
        Some(r) => (r.x, r.y, r.w, r.h),
        None => (0, 0, w, h),
    };
    let mask = GrayImage::from_fn(mw, mh, |x, y| {
        let label = labels.get_pixel(ox + x, oy + y).0[0];
        Luma([if selector.matches(label) { 255 } else { 0 }])
    });
    Ok((mask, roi))
}

pub fn read_scalar(path: &Path) -> Option<f64> {
    let raw = fs::read_to_string(path).ok()?;
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_row(line: &str) -> Option<Vec<f64>> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    fields.iter().map(|f| f.parse::<f64>().ok()).collect()
}

/// `x,y[,value]` rows in mask-local pixels. Headers and malformed rows are skipped.
pub fn parse_points(text: &str, roi: Option<&Roi>) -> Vec<MetricPoint> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(parse_row)
        .filter(|row| row.len() >= 2)
        .map(|row| {
            let (x, y) = local_to_global((row[0], row[1]), roi);
            let value = row.get(2).copied().filter(|v| v.is_finite());
            MetricPoint { x, y, value }
        })
        .collect()
}

/// `x0,y0,x1,y1` rows in mask-local pixels.
pub fn parse_pairs(text: &str, roi: Option<&Roi>) -> Vec<MetricPair> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(parse_row)
        .filter(|row| row.len() >= 4)
        .map(|row| {
            let (x0, y0) = local_to_global((row[0], row[1]), roi);
            let (x1, y1) = local_to_global((row[2], row[3]), roi);
            MetricPair { x0, y0, x1, y1 }
        })
        .collect()
}

pub struct MeasureRequest<'a> {
    pub python: &'a Path,
    pub script: &'a Path,
    pub work_dir: &'a Path,
    pub task: &'a TaskSpec,
    pub params: &'a TaskParams,
    pub labels: &'a GrayImage,
    pub roi: Option<Roi>,
}

pub fn measurement_vars(files: &TaskFiles, script: &Path, params: &TaskParams) -> BTreeMap<&'static str, String> {
    let path = |p: &Path| p.display().to_string();
    BTreeMap::from([
        ("script", path(script)),
        ("mask", path(&files.mask)),
        ("out_txt", path(&files.scalar)),
        ("out_csv", path(&files.csv)),
        ("out_labels", path(&files.labels)),
        ("out_contours", path(&files.contours)),
        ("out_outer_contours", path(&files.outer_contours)),
        ("min_distance", params.min_distance.to_string()),
        ("threshold_rel", params.threshold_rel.to_string()),
        ("sigma", params.sigma.to_string()),
        ("keep_low", params.keep_low.to_string()),
        ("keep_high", params.keep_high.to_string()),
        ("max_pair_px", params.max_pair_px.to_string()),
    ])
}

/// Mask, run and parse one task. A non-zero exit fails the task; a missing or unreadable
/// scalar only makes the value unavailable.
///
/// The process writes into a per-attempt directory. Its outputs replace the fixed names
/// only after a zero exit, so a failed rerun leaves the previous record's files in place.
pub fn run_measurement(req: &MeasureRequest<'_>) -> PipelineResult<MetricRecord> {
    let task = req.task;
    let prefix = format!("[metrics:{}] ", task.name);
    let files = TaskFiles::in_dir(req.work_dir, &task.name);

    let (mask, roi) = build_mask(req.labels, task.selector, req.roi.as_ref())?;
    save_image(&DynamicImage::ImageLuma8(mask), &files.mask)?;

    let attempt = tempfile::Builder::new()
        .prefix(".attempt_")
        .tempdir_in(req.work_dir)
        .map_err(|e| PipelineError::io(format!("failed to create an attempt directory in {}", req.work_dir.display()), e))?;
    let staged = TaskFiles {
        mask: files.mask.clone(),
        ..TaskFiles::in_dir(attempt.path(), &task.name)
    };

    let args = expand_args(&task.args, &measurement_vars(&staged, req.script, req.params))?;
    log::info!("{prefix}computing {}", task.name);
    let outcome = runner::run_logged(req.python, &args, Some(req.work_dir), &prefix)?;
    if !outcome.success() {
        log::error!("{prefix}exited with {:?}", outcome.code);
        return Err(PipelineError::ProcessFailed {
            stage: format!("measurement `{}`", task.name),
            code: outcome.code,
            stderr_tail: outcome.stderr_tail,
        });
    }
    promote_outputs(&staged, &files)?;

    let scalar_px = read_scalar(&files.scalar);
    if scalar_px.is_none() {
        log::warn!("{prefix}no readable value in {}", files.scalar.display());
    }
    let csv = fs::read_to_string(&files.csv).unwrap_or_default();
    let (points, pairs) = match task.kind {
        MetricKind::Thickness => (parse_points(&csv, roi.as_ref()), Vec::new()),
        MetricKind::Spacing => (Vec::new(), parse_pairs(&csv, roi.as_ref())),
        MetricKind::Count => (Vec::new(), Vec::new()),
    };
    let contour_files = [&files.outer_contours, &files.contours]
        .into_iter()
        .filter(|p| p.exists())
        .cloned()
        .collect();

    Ok(MetricRecord {
        task: task.name.clone(),
        kind: task.kind,
        scalar_px,
        points,
        pairs,
        roi,
        contour_files,
        measured_at: chrono::Utc::now().to_rfc3339(),
    })
}

/// Replace every fixed output with the attempt's version. Outputs the attempt did not
/// produce are removed so an old file is never read as a new result.
fn promote_outputs(staged: &TaskFiles, files: &TaskFiles) -> PipelineResult<()> {
    for (from, to) in staged.outputs().into_iter().zip(files.outputs()) {
        if to.exists() {
            fs::remove_file(to).map_err(|e| PipelineError::io(format!("failed to remove {}", to.display()), e))?;
        }
        if from.exists() {
            fs::rename(from, to).map_err(|e| {
                PipelineError::io(format!("failed to move {} -> {}", from.display(), to.display()), e)
            })?;
        }
    }
    Ok(())
}

fn display_scale(calibration: &Calibration) -> (f64, String) {
    match calibration.require() {
        Ok(scale) => (scale, calibration.unit.clone()),
        Err(_) => (1.0, "px".to_string()),
    }
}

/// Overlay groups produced by one task's record, with values in display units.
pub fn record_groups(
    record: &MetricRecord,
    task: &TaskSpec,
    calibration: &Calibration,
    image_size: (u32, u32),
) -> Vec<(OverlayGroup, Vec<OverlayItem>)> {
    let (scale, unit) = display_scale(calibration);
    let (img_w, img_h) = image_size;
    let mut groups = Vec::new();

    let colormap = task
        .color_bar
        .as_ref()
        .map(|b| b.colormap)
        .unwrap_or(crate::colormap::Colormap::Viridis);
    let markers = match task.kind {
        MetricKind::Thickness if !record.points.is_empty() => {
            let pts: Vec<(f64, f64, f64)> = record
                .points
                .iter()
                .map(|p| (p.x, p.y, p.value.map_or(f64::NAN, |v| v * scale)))
                .collect();
            Some(overlay::point_marker_items(&pts, colormap))
        }
        MetricKind::Spacing if !record.pairs.is_empty() => {
            let segs: Vec<_> = record
                .pairs
                .iter()
                .map(|p| ((p.x0, p.y0), (p.x1, p.y1), p.length_px() * scale))
                .collect();
            Some(overlay::pair_line_items(&segs, colormap))
        }
        _ => None,
    };
    if let Some((items, (lo, hi))) = markers {
        if let Some(group) = task.marker_group {
            groups.push((group, items));
        }
        if let Some(bar) = &task.color_bar {
            let label = format!("{} ({unit})", bar.label);
            let bar_items = overlay::color_bar_items(img_w, img_h, bar.slot, lo, hi, &label, bar.colormap);
            groups.push((bar.group, bar_items));
        }
    }

    if let Some(style) = &task.contours {
        let origin = record
            .roi
            .map(|r| (r.x as i32, r.y as i32))
            .unwrap_or((0, 0));
        let mut items = Vec::new();
        for path in &record.contour_files {
            match load_labels(path) {
                Ok(edges) => items.push(overlay::contour_item(&edges, style.color, style.thickness, origin)),
                Err(err) => log::warn!("[metrics:{}] skipping contours: {err}", record.task),
            }
        }
        groups.push((style.group, items));
    }
    groups
}

/// One line summarising the latest value of every task the profile defines.
pub fn banner_line(
    profile: &PipelineProfile,
    records: &BTreeMap<String, MetricRecord>,
    calibration: &Calibration,
) -> String {
    let parts: Vec<String> = profile
        .tasks
        .iter()
        .map(|task| {
            let shown = records
                .get(&task.name)
                .filter(|r| r.value(calibration).is_some())
                .map(|r| r.summary(calibration))
                .unwrap_or_else(|| "N/A".to_string());
            format!("{}: {shown}", task.banner_label)
        })
        .collect();
    format!(" {}", parts.join("   |   "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{builtin_profiles, find_profile};
    use tempfile::tempdir;

    fn calibrated(size: f64, ef: f64) -> Calibration {
        Calibration {
            units_per_pixel: Some(size),
            unit: "\u{b5}m".to_string(),
            expansion_factor: ef,
            expansion_enabled: true,
            auto_detected: None,
        }
    }

    fn record(kind: MetricKind, scalar: Option<f64>) -> MetricRecord {
        MetricRecord {
            task: "thickness".to_string(),
            kind,
            scalar_px: scalar,
            points: Vec::new(),
            pairs: Vec::new(),
            roi: None,
            contour_files: Vec::new(),
            measured_at: String::new(),
        }
    }

    #[test]
    fn mask_is_cropped_to_roi() {
        let labels = GrayImage::from_fn(6, 4, |x, _| Luma([if x >= 3 { 2 } else { 1 }]));
        let roi = Roi::new(2, 1, 10, 2).unwrap();
        let (mask, clipped) = build_mask(&labels, LabelSelector::Label(2), Some(&roi)).unwrap();
        assert_eq!(clipped, Some(Roi { x: 2, y: 1, w: 4, h: 2 }));
        assert_eq!(mask.dimensions(), (4, 2));
        assert_eq!(mask.get_pixel(0, 0).0[0], 0);
        assert_eq!(mask.get_pixel(1, 0).0[0], 255);

        let (full, none) = build_mask(&labels, LabelSelector::AnyForeground, None).unwrap();
        assert_eq!(none, None);
        assert!(full.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn pair_rows_are_remapped_by_roi_origin() {
        let roi = Roi::new(100, 200, 50, 50).unwrap();
        let pairs = parse_pairs("x0,y0,x1,y1\n10,10,20,20\n", Some(&roi));
        assert_eq!(
            pairs,
            vec![MetricPair {
                x0: 110.0,
                y0: 210.0,
                x1: 120.0,
                y1: 220.0
            }]
        );
    }

    #[test]
    fn malformed_point_rows_are_skipped() {
        let text = "1,2,3.5\n\nbad,row\n4,5\n7\n8,9,nan\n";
        let pts = parse_points(text, None);
        assert_eq!(pts.len(), 3);
        assert_eq!(pts[0].value, Some(3.5));
        assert_eq!(pts[1].value, None);
        assert_eq!(pts[2].value, None);
    }

    #[test]
    fn scalar_is_converted_with_expansion() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("thickness.txt");
        fs::write(&path, "12.5\n").unwrap();
        let rec = record(MetricKind::Thickness, read_scalar(&path));
        let (v, unit) = rec.value(&calibrated(0.2, 5.0)).unwrap();
        assert!((v - 0.5).abs() < 1e-12);
        assert_eq!(unit, "\u{b5}m");
        assert_eq!(rec.summary(&calibrated(0.2, 5.0)), "0.500 \u{b5}m");
    }

    #[test]
    fn missing_or_garbage_scalar_is_unavailable() {
        let dir = tempdir().unwrap();
        assert_eq!(read_scalar(&dir.path().join("absent.txt")), None);
        let junk = dir.path().join("junk.txt");
        fs::write(&junk, "Traceback").unwrap();
        assert_eq!(read_scalar(&junk), None);
        let rec = record(MetricKind::Thickness, None);
        assert_eq!(rec.summary(&calibrated(0.2, 5.0)), "unavailable");
    }

    #[test]
    fn counts_stay_unitless() {
        let rec = record(MetricKind::Count, Some(42.0));
        assert_eq!(rec.summary(&Calibration::default()), "42");
    }

    #[test]
    fn banner_marks_missing_metrics() {
        let profile = find_profile(&builtin_profiles(), "brightfield-40x").unwrap();
        let mut records = BTreeMap::new();
        records.insert("thickness".to_string(), record(MetricKind::Thickness, Some(12.5)));
        let line = banner_line(&profile, &records, &calibrated(0.2, 5.0));
        assert_eq!(line, " GBM thickness: 0.500 \u{b5}m   |   Process NND: N/A");
    }

    #[test]
    fn spacing_record_renders_lines_and_bar() {
        let profile = find_profile(&builtin_profiles(), "brightfield-40x").unwrap();
        let task = profile.task("process").unwrap();
        let mut rec = record(MetricKind::Spacing, Some(3.0));
        rec.pairs = parse_pairs("10,10,20,20\n0,0,3,4\n", Some(&Roi::new(100, 200, 40, 40).unwrap()));
        let groups = record_groups(&rec, task, &calibrated(0.5, 1.0), (400, 400));
        let names: Vec<OverlayGroup> = groups.iter().map(|(g, _)| *g).collect();
        assert_eq!(
            names,
            vec![OverlayGroup::ProcessLines, OverlayGroup::ProcessBar, OverlayGroup::ProcessContours]
        );
        assert_eq!(groups[0].1.len(), 2);
        let overlay::Primitive::Line { from, to, .. } = &groups[0].1[0].primitive else {
            panic!("expected a line");
        };
        assert_eq!((*from, *to), ((110.0, 210.0), (120.0, 220.0)));
        assert!(groups[2].1.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn measurement_runs_script_and_parses_outputs() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("metrics.sh");
        fs::write(
            &script,
            "while [ $# -gt 0 ]; do case \"$1\" in \
             --out_txt) txt=\"$2\"; shift;; --out_csv) csv=\"$2\"; shift;; esac; shift; done\n\
             echo computing\n\
             echo 12.5 > \"$txt\"\n\
             printf '1,1,2.0\\n3,3,4.0\\n' > \"$csv\"\n",
        )
        .unwrap();
        let profile = find_profile(&builtin_profiles(), "brightfield-40x").unwrap();
        let task = profile.task("thickness").unwrap();
        let labels = GrayImage::from_pixel(20, 20, Luma([1]));
        let req = MeasureRequest {
            python: Path::new("sh"),
            script: &script,
            work_dir: dir.path(),
            task,
            params: &task.params,
            labels: &labels,
            roi: Some(Roi::new(5, 6, 10, 10).unwrap()),
        };
        let rec = run_measurement(&req).unwrap();
        assert_eq!(rec.scalar_px, Some(12.5));
        assert_eq!(rec.points.len(), 2);
        assert_eq!((rec.points[0].x, rec.points[0].y), (6.0, 7.0));
        assert!(dir.path().join("thickness_mask.tif").exists());
    }

    #[cfg(unix)]
    #[test]
    fn failing_measurement_is_an_error() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("metrics.sh");
        fs::write(&script, "echo boom 1>&2; exit 4\n").unwrap();
        let profile = find_profile(&builtin_profiles(), "brightfield-40x").unwrap();
        let task = profile.task("thickness").unwrap();
        let labels = GrayImage::from_pixel(4, 4, Luma([1]));
        let req = MeasureRequest {
            python: Path::new("sh"),
            script: &script,
            work_dir: dir.path(),
            task,
            params: &task.params,
            labels: &labels,
            roi: None,
        };
        match run_measurement(&req) {
            Err(PipelineError::ProcessFailed { code, stderr_tail, .. }) => {
                assert_eq!(code, Some(4));
                assert_eq!(stderr_tail, vec!["boom".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn failed_rerun_keeps_previous_outputs() {
        let dir = tempdir().unwrap();
        let edges = dir.path().join("edges.tif");
        let mut ring = GrayImage::new(8, 8);
        ring.put_pixel(4, 4, Luma([255]));
        ring.save(&edges).unwrap();
        let script = dir.path().join("metrics.sh");
        fs::write(
            &script,
            format!(
                "[ -e fail ] && {{ echo broken 1>&2; exit 2; }}\n\
                 while [ $# -gt 0 ]; do case \"$1\" in \
                 --out_txt) txt=\"$2\"; shift;; --out_outer_contours) outer=\"$2\"; shift;; esac; shift; done\n\
                 echo 3.0 > \"$txt\"\n\
                 cp {} \"$outer\"\n",
                edges.display()
            ),
        )
        .unwrap();
        let profile = find_profile(&builtin_profiles(), "brightfield-40x").unwrap();
        let task = profile.task("process").unwrap();
        let labels = GrayImage::from_pixel(8, 8, Luma([2]));
        let req = MeasureRequest {
            python: Path::new("sh"),
            script: &script,
            work_dir: dir.path(),
            task,
            params: &task.params,
            labels: &labels,
            roi: None,
        };
        let first = run_measurement(&req).unwrap();
        let files = TaskFiles::in_dir(dir.path(), "process");
        assert_eq!(first.contour_files, vec![files.outer_contours.clone()]);

        fs::write(dir.path().join("fail"), "").unwrap();
        assert!(matches!(
            run_measurement(&req),
            Err(PipelineError::ProcessFailed { code: Some(2), .. })
        ));
        assert!(files.outer_contours.is_file());
        assert_eq!(read_scalar(&files.scalar), Some(3.0));
        let groups = record_groups(&first, task, &calibrated(0.5, 1.0), (8, 8));
        let (group, items) = groups.last().unwrap();
        assert_eq!(*group, OverlayGroup::ProcessContours);
        assert_eq!(items.len(), 1);
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".attempt_"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(unix)]
    #[test]
    fn outputs_missing_from_a_rerun_are_cleared() {
        let dir = tempdir().unwrap();
        let files = TaskFiles::in_dir(dir.path(), "thickness");
        fs::write(&files.csv, "1,1,9.0\n").unwrap();
        let script = dir.path().join("metrics.sh");
        fs::write(
            &script,
            "while [ $# -gt 0 ]; do case \"$1\" in --out_txt) txt=\"$2\"; shift;; esac; shift; done\n\
             echo 1.0 > \"$txt\"\n",
        )
        .unwrap();
        let profile = find_profile(&builtin_profiles(), "brightfield-40x").unwrap();
        let task = profile.task("thickness").unwrap();
        let labels = GrayImage::from_pixel(4, 4, Luma([1]));
        let req = MeasureRequest {
            python: Path::new("sh"),
            script: &script,
            work_dir: dir.path(),
            task,
            params: &task.params,
            labels: &labels,
            roi: None,
        };
        let rec = run_measurement(&req).unwrap();
        assert_eq!(rec.scalar_px, Some(1.0));
        assert!(rec.points.is_empty());
        assert!(!files.csv.exists());
    }
}
