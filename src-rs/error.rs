use std::path::PathBuf;
use thiserror::Error;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(
        "no usable Python {min_major}.{min_minor}+ with the venv module was found (tried: {tried}).\n\
         Install Python {min_major}.{min_minor}+ (https://www.python.org/downloads/) and re-run this command."
    )]
    NoInterpreter {
        min_major: u32,
        min_minor: u32,
        tried: String,
    },

    #[error(
        "failed to create the isolated environment at {path} (exit code {code:?}); \
         check that the interpreter can run `-m venv` and try again"
    )]
    EnvironmentCreate { path: PathBuf, code: Option<i32> },

    #[error(
        "dependency installation failed (exit code {code:?}); \
         see the [pip] log lines for details and check internet access"
    )]
    DependencyInstall { code: Option<i32> },

    #[error(
        "another provisioning run holds {path}; wait for it to finish \
         (or delete the file if no provisioning is running)"
    )]
    Locked { path: PathBuf },

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(
        "image is uncalibrated ({reason}); set a real-world pixel size and unit first, e.g. \
         `histoseg calibrate --units-per-pixel 0.25 --unit um`"
    )]
    CalibrationRequired { reason: String },

    #[error("no segmentation result for this session; run `histoseg segment` first")]
    NoSegmentation,

    #[error("task `{task}` needs a `{expected}` segmentation but the last run used `{actual}`")]
    ProfileMismatch {
        task: String,
        expected: String,
        actual: String,
    },

    #[error("{stage} exited with code {code:?}{}", format_tail(.stderr_tail))]
    ProcessFailed {
        stage: String,
        code: Option<i32>,
        stderr_tail: Vec<String>,
    },

    #[error("{stage} finished but did not write {path}")]
    MissingOutput { stage: String, path: PathBuf },

    #[error("bundled asset missing: {path}")]
    MissingAsset { path: PathBuf },

    #[error("unknown profile `{0}`")]
    UnknownProfile(String),

    #[error("profile `{profile}` has no task `{task}`")]
    UnknownTask { profile: String, task: String },

    #[error("profile `{0}` does not support switching the background after a run")]
    BackgroundToggleUnsupported(String),

    #[error("invalid region of interest: {0}")]
    InvalidRoi(String),

    #[error("invalid value for {parameter}: {value}")]
    InvalidParameter { parameter: String, value: String },

    #[error("cannot read page {page} of {path}: {reason}")]
    Page {
        path: PathBuf,
        page: u32,
        reason: String,
    },

    #[error("image error for {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Self::Image {
            path: path.into(),
            source,
        }
    }

    /// Resource extraction failures point at a broken installation rather than bad input.
    pub fn is_packaging_defect(&self) -> bool {
        matches!(self, Self::MissingAsset { .. })
    }
}

fn format_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        return String::new();
    }
    format!("; last output:\n{}", tail.join("\n"))
}
