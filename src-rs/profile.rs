use crate::colormap::Colormap;
use crate::error::{PipelineError, PipelineResult};
use crate::visibility::OverlayGroup;
use image::Rgb;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelClass {
    pub value: u8,
    pub name: String,
    pub color: [u8; 3],
}

/// Where the "enhanced" background comes from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Enhancement {
    /// The segmentation process writes it next to the label image.
    External,
    /// Computed here from the raw plane.
    PercentileStretch { low: f64, high: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Per-point values along a medial axis; rows are `x,y[,value]`.
    Thickness,
    /// Nearest-neighbour pairs; rows are `x0,y0,x1,y1`.
    Spacing,
    /// Object count; the scalar is unitless.
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSelector {
    Label(u8),
    AnyForeground,
}

impl LabelSelector {
    pub fn matches(self, label: u8) -> bool {
        match self {
            LabelSelector::Label(v) => label == v,
            LabelSelector::AnyForeground => label != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    pub min_distance: f64,
    pub threshold_rel: f64,
    pub sigma: f64,
    pub keep_low: f64,
    pub keep_high: f64,
    pub max_pair_px: f64,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            min_distance: 3.28,
            threshold_rel: 0.26,
            sigma: 2.0,
            keep_low: 0.20,
            keep_high: 0.02,
            max_pair_px: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContourStyle {
    pub color: [u8; 3],
    pub thickness: u32,
    pub group: OverlayGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorBarSpec {
    pub colormap: Colormap,
    pub group: OverlayGroup,
    pub slot: u32,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub kind: MetricKind,
    pub selector: LabelSelector,
    /// Group for dots or pair lines.
    #[serde(default)]
    pub marker_group: Option<OverlayGroup>,
    #[serde(default)]
    pub color_bar: Option<ColorBarSpec>,
    #[serde(default)]
    pub contours: Option<ContourStyle>,
    #[serde(default)]
    pub params: TaskParams,
    /// Physical defaults converted to pixels once a calibration exists: (min distance, max pair).
    #[serde(default)]
    pub physical_defaults: Option<(f64, f64)>,
    pub banner_label: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineProfile {
    pub name: String,
    pub model: String,
    pub model_asset: String,
    pub labels: Vec<LabelClass>,
    pub alpha: f32,
    pub enhancement: Enhancement,
    pub background_toggle: bool,
    pub calibration_before_segmentation: bool,
    pub segment_script: String,
    pub metrics_script: String,
    pub segment_args: Vec<String>,
    pub tasks: Vec<TaskSpec>,
}

impl PipelineProfile {
    /// Label value -> overlay colour; index 0 and unknown labels have none.
    pub fn lut(&self) -> Vec<Option<Rgb<u8>>> {
        let len = self
            .labels
            .iter()
            .map(|l| usize::from(l.value) + 1)
            .max()
            .unwrap_or(0);
        let mut lut = vec![None; len];
        for class in self.labels.iter().filter(|c| c.value != 0) {
            lut[usize::from(class.value)] = Some(Rgb(class.color));
        }
        lut
    }

    pub fn legend_entries(&self) -> Vec<&LabelClass> {
        self.labels.iter().filter(|c| c.value != 0).collect()
    }

    pub fn task(&self, name: &str) -> PipelineResult<&TaskSpec> {
        self.tasks
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| PipelineError::UnknownTask {
                profile: self.name.clone(),
                task: name.to_string(),
            })
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

fn brightfield_segment_args() -> Vec<String> {
    args(&[
        "{script}", "--tif", "{input}", "--page", "{page}", "--model", "{model}",
        "--modeldir", "{modeldir}", "--output", "{output}", "--save_enhanced", "{enhanced}",
        "--enhance", "{enhance}",
    ])
}

fn thickness_args() -> Vec<String> {
    args(&[
        "{script}", "--task", "thickness", "--mask", "{mask}", "--px", "1",
        "--out_txt", "{out_txt}", "--out_csv", "{out_csv}",
    ])
}

fn watershed_args(task: &str) -> Vec<String> {
    let mut list = args(&["{script}", "--task"]);
    list.push(task.to_string());
    list.extend(args(&[
        "--mask", "{mask}", "--px", "1", "--max_pair_px", "{max_pair_px}",
        "--ws_min_dist", "{min_distance}", "--ws_thresh_rel", "{threshold_rel}",
        "--ws_sigma", "{sigma}", "--keep_low", "{keep_low}", "--keep_high", "{keep_high}",
        "--out_labels", "{out_labels}", "--out_contours", "{out_contours}",
        "--out_outer_contours", "{out_outer_contours}", "--out_txt", "{out_txt}",
        "--out_csv", "{out_csv}",
    ]));
    list
}

fn thickness_task(selector: LabelSelector) -> TaskSpec {
    TaskSpec {
        name: "thickness".to_string(),
        kind: MetricKind::Thickness,
        selector,
        marker_group: Some(OverlayGroup::AxisDots),
        color_bar: Some(ColorBarSpec {
            colormap: Colormap::Viridis,
            group: OverlayGroup::AxisBar,
            slot: 0,
            label: "Thickness".to_string(),
        }),
        contours: None,
        params: TaskParams::default(),
        physical_defaults: None,
        banner_label: "GBM thickness".to_string(),
        args: thickness_args(),
    }
}

fn process_task(selector: LabelSelector) -> TaskSpec {
    TaskSpec {
        name: "process".to_string(),
        kind: MetricKind::Spacing,
        selector,
        marker_group: Some(OverlayGroup::ProcessLines),
        color_bar: Some(ColorBarSpec {
            colormap: Colormap::Hot,
            group: OverlayGroup::ProcessBar,
            slot: 1,
            label: "Proc dist".to_string(),
        }),
        contours: Some(ContourStyle {
            color: [255, 240, 6],
            thickness: 1,
            group: OverlayGroup::ProcessContours,
        }),
        params: TaskParams::default(),
        physical_defaults: Some((0.08, 1.5)),
        banner_label: "Process NND".to_string(),
        args: watershed_args("proc"),
    }
}

fn count_task(
    name: &str,
    external: &str,
    label: u8,
    color: [u8; 3],
    group: OverlayGroup,
    min_distance: f64,
    banner: &str,
) -> TaskSpec {
    TaskSpec {
        name: name.to_string(),
        kind: MetricKind::Count,
        selector: LabelSelector::Label(label),
        marker_group: None,
        color_bar: None,
        contours: Some(ContourStyle {
            color,
            thickness: 2,
            group,
        }),
        params: TaskParams {
            min_distance,
            threshold_rel: 0.30,
            sigma: 2.0,
            keep_low: 0.40,
            keep_high: 0.00,
            max_pair_px: 20.0,
        },
        physical_defaults: None,
        banner_label: banner.to_string(),
        args: watershed_args(external),
    }
}

fn class(value: u8, name: &str, color: [u8; 3]) -> LabelClass {
    LabelClass {
        value,
        name: name.to_string(),
        color,
    }
}

pub fn builtin_profiles() -> Vec<PipelineProfile> {
    vec![
        PipelineProfile {
            name: "brightfield-20x".to_string(),
            model: "20x".to_string(),
            model_asset: "20x.hdf5".to_string(),
            labels: vec![
                class(0, "Background", [0, 0, 130]),
                class(1, "Nucleus", [91, 24, 199]),
                class(2, "RBC", [242, 91, 96]),
                class(3, "Tube", [240, 203, 73]),
                class(4, "Glomerulus", [89, 195, 71]),
                class(5, "GBM", [76, 98, 246]),
            ],
            alpha: 0.45,
            enhancement: Enhancement::External,
            background_toggle: true,
            calibration_before_segmentation: true,
            segment_script: "segment.py".to_string(),
            metrics_script: "metrics.py".to_string(),
            segment_args: brightfield_segment_args(),
            tasks: vec![
                count_task("nuclei", "nuc", 1, [255, 255, 0], OverlayGroup::NucContours, 40.0, "Nuclei count"),
                count_task("rbc", "rbc", 2, [255, 255, 255], OverlayGroup::RbcContours, 15.0, "RBC count"),
            ],
        },
        PipelineProfile {
            name: "brightfield-40x".to_string(),
            model: "40x".to_string(),
            model_asset: "40x.hdf5".to_string(),
            labels: vec![
                class(0, "Background", [105, 105, 105]),
                class(1, "GBM", [255, 0, 255]),
                class(2, "Podocyte foot processes", [0, 255, 255]),
            ],
            alpha: 0.45,
            enhancement: Enhancement::External,
            background_toggle: true,
            calibration_before_segmentation: true,
            segment_script: "segment.py".to_string(),
            metrics_script: "metrics.py".to_string(),
            segment_args: brightfield_segment_args(),
            tasks: vec![
                thickness_task(LabelSelector::Label(1)),
                process_task(LabelSelector::Label(2)),
            ],
        },
        PipelineProfile {
            name: "fluorescence".to_string(),
            model: "NHS_SINGLE_CHANNEL".to_string(),
            model_asset: "NHS_ester_single.hdf5".to_string(),
            labels: vec![
                class(1, "GBM", [255, 0, 255]),
                class(2, "Nuclei", [255, 0, 0]),
            ],
            alpha: 0.40,
            enhancement: Enhancement::PercentileStretch {
                low: 1.0,
                high: 99.7,
            },
            background_toggle: false,
            calibration_before_segmentation: false,
            segment_script: "segment.py".to_string(),
            metrics_script: "metrics.py".to_string(),
            segment_args: args(&[
                "{script}", "--nd2", "{input}", "--z", "{page}", "--modeldir", "{modeldir}",
                "--model", "{model}", "--output", "{output}", "--channel", "0",
            ]),
            tasks: vec![
                thickness_task(LabelSelector::Label(1)),
                process_task(LabelSelector::AnyForeground),
            ],
        },
    ]
}

/// Built-ins overridden (by name) or extended by configured profiles.
pub fn resolve_profiles(extra: &[PipelineProfile]) -> Vec<PipelineProfile> {
    let mut by_name: BTreeMap<String, PipelineProfile> = builtin_profiles()
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect();
    for profile in extra {
        by_name.insert(profile.name.clone(), profile.clone());
    }
    by_name.into_values().collect()
}

pub fn find_profile(profiles: &[PipelineProfile], name: &str) -> PipelineResult<PipelineProfile> {
    profiles
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .cloned()
        .ok_or_else(|| PipelineError::UnknownProfile(name.to_string()))
}

/// Guess the brightfield magnification from the file name.
pub fn detect_profile_name(input: &Path) -> &'static str {
    let name = input
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if name.contains("20x") || name.contains("x20") {
        return "brightfield-20x";
    }
    "brightfield-40x"
}

/// Substitute `{name}` placeholders. Unknown placeholders are an error.
pub fn expand_args(template: &[String], vars: &BTreeMap<&str, String>) -> PipelineResult<Vec<String>> {
    template
        .iter()
        .map(|arg| expand_one(arg, vars))
        .collect()
}

fn expand_one(arg: &str, vars: &BTreeMap<&str, String>) -> PipelineResult<String> {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let key = &after[..end];
        let value = vars.get(key).ok_or_else(|| PipelineError::InvalidParameter {
            parameter: "argument template".to_string(),
            value: format!("unknown placeholder {{{key}}} in `{arg}`"),
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lut_skips_background() {
        let profiles = builtin_profiles();
        let bf40 = find_profile(&profiles, "brightfield-40x").unwrap();
        let lut = bf40.lut();
        assert_eq!(lut.len(), 3);
        assert_eq!(lut[0], None);
        assert_eq!(lut[1], Some(Rgb([255, 0, 255])));
        assert_eq!(bf40.legend_entries().len(), 2);
    }

    #[test]
    fn configured_profiles_override_builtins() {
        let mut custom = find_profile(&builtin_profiles(), "brightfield-20x").unwrap();
        custom.alpha = 0.9;
        let mut extra = custom.clone();
        extra.name = "lab-special".to_string();
        let all = resolve_profiles(&[custom, extra]);
        assert_eq!(all.len(), 4);
        assert_eq!(find_profile(&all, "brightfield-20x").unwrap().alpha, 0.9);
        assert!(find_profile(&all, "LAB-SPECIAL").is_ok());
        assert!(matches!(
            find_profile(&all, "nope"),
            Err(PipelineError::UnknownProfile(_))
        ));
    }

    #[test]
    fn detects_magnification_from_name() {
        assert_eq!(detect_profile_name(Path::new("/a/kidney_20X_01.tif")), "brightfield-20x");
        assert_eq!(detect_profile_name(Path::new("x20-slide.tif")), "brightfield-20x");
        assert_eq!(detect_profile_name(Path::new("slide_60x.tif")), "brightfield-40x");
        assert_eq!(detect_profile_name(Path::new("plain.tif")), "brightfield-40x");
    }

    #[test]
    fn expands_placeholders() {
        let mut vars = BTreeMap::new();
        vars.insert("mask", "/tmp/m.tif".to_string());
        vars.insert("script", "metrics.py".to_string());
        let out = expand_args(&args(&["{script}", "--mask={mask}", "--px", "1"]), &vars).unwrap();
        assert_eq!(out, vec!["metrics.py", "--mask=/tmp/m.tif", "--px", "1"]);
        assert!(expand_args(&args(&["{missing}"]), &vars).is_err());
    }

    #[test]
    fn every_builtin_template_is_complete() {
        let keys = [
            "script", "input", "page", "model", "modeldir", "output", "enhanced", "enhance",
            "mask", "out_txt", "out_csv", "out_labels", "out_contours", "out_outer_contours",
            "min_distance", "threshold_rel", "sigma", "keep_low", "keep_high", "max_pair_px",
        ];
        let vars: BTreeMap<&str, String> = keys.iter().map(|k| (*k, "v".to_string())).collect();
        for profile in builtin_profiles() {
            expand_args(&profile.segment_args, &vars).unwrap();
            for task in &profile.tasks {
                expand_args(&task.args, &vars).unwrap();
            }
        }
    }

    #[test]
    fn selectors_match_labels() {
        assert!(LabelSelector::Label(2).matches(2));
        assert!(!LabelSelector::Label(2).matches(1));
        assert!(LabelSelector::AnyForeground.matches(5));
        assert!(!LabelSelector::AnyForeground.matches(0));
    }
}
