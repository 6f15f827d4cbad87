use crate::error::{PipelineError, PipelineResult};
use image::RgbImage;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Where rendered results are shown. Layers are given bottom first.
pub trait HostSurface {
    fn show_layers(&mut self, layers: &[(&str, &RgbImage)], sidecar: &Value) -> PipelineResult<Vec<PathBuf>>;
}

/// Writes each layer as `<name>.png` and the sidecar as `result.json`.
#[derive(Debug, Clone)]
pub struct FileHost {
    out_dir: PathBuf,
}

impl FileHost {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }
}

impl HostSurface for FileHost {
    fn show_layers(&mut self, layers: &[(&str, &RgbImage)], sidecar: &Value) -> PipelineResult<Vec<PathBuf>> {
        fs::create_dir_all(&self.out_dir)
            .map_err(|e| PipelineError::io(format!("failed to create {}", self.out_dir.display()), e))?;
        let mut written = Vec::with_capacity(layers.len() + 1);
        for (name, img) in layers {
            let path = self.out_dir.join(format!("{name}.png"));
            img.save(&path).map_err(|err| PipelineError::image(&path, err))?;
            written.push(path);
        }
        let sidecar_path = self.out_dir.join("result.json");
        let raw = serde_json::to_string_pretty(sidecar).map_err(|source| PipelineError::Json {
            context: "failed to encode result sidecar".to_string(),
            source,
        })?;
        fs::write(&sidecar_path, raw)
            .map_err(|e| PipelineError::io(format!("failed to write JSON: {}", sidecar_path.display()), e))?;
        written.push(sidecar_path);
        Ok(written)
    }
}
