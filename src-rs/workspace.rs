use crate::composite::{open_image, save_image};
use crate::error::{PipelineError, PipelineResult};
use crate::profile::PipelineProfile;
use image::{DynamicImage, GrayAlphaImage, GrayImage, ImageBuffer, RgbImage, RgbaImage};
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::ColorType;

const SCRIPTS: &str = "scripts";
const MODELS: &str = "models";

/// Scratch directory owned by one segmentation run. It outlives the process so later
/// measurements can reuse its artifacts; a new run gets a new directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunWorkspace {
    root: PathBuf,
}

impl RunWorkspace {
    pub fn create(scratch_root: Option<&Path>) -> PipelineResult<Self> {
        let parent = scratch_root
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&parent)
            .map_err(|e| PipelineError::io(format!("failed to create {}", parent.display()), e))?;
        let root = tempfile::Builder::new()
            .prefix("histoseg_")
            .tempdir_in(&parent)
            .map_err(|e| PipelineError::io(format!("failed to create a workspace in {}", parent.display()), e))?
            .keep();
        log::info!("workspace {}", root.display());
        Ok(Self { root })
    }

    pub fn open(root: &Path) -> PipelineResult<Self> {
        if !root.is_dir() {
            return Err(PipelineError::NoSegmentation);
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join(SCRIPTS)
    }

    pub fn script(&self, name: &str) -> PathBuf {
        self.scripts_dir().join(name)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join(MODELS)
    }

    pub fn label_image(&self) -> PathBuf {
        self.root.join("labels.tif")
    }

    pub fn enhanced_image(&self) -> PathBuf {
        self.root.join("enhanced.png")
    }

    pub fn raw_snapshot(&self) -> PathBuf {
        self.root.join("input_page_raw.png")
    }

    /// Copy the scripts tree and the profile's model into the workspace.
    pub fn install_assets(&self, assets_dir: &Path, profile: &PipelineProfile) -> PipelineResult<()> {
        let scripts_src = assets_dir.join(SCRIPTS);
        for script in [&profile.segment_script, &profile.metrics_script] {
            let path = scripts_src.join(script);
            if !path.is_file() {
                return Err(PipelineError::MissingAsset { path });
            }
        }
        copy_dir(&scripts_src, &self.scripts_dir())?;

        let model_src = assets_dir.join(MODELS).join(&profile.model_asset);
        if !model_src.is_file() {
            return Err(PipelineError::MissingAsset { path: model_src });
        }
        let model_dst = self.models_dir().join(&profile.model_asset);
        fs::create_dir_all(self.models_dir())
            .map_err(|e| PipelineError::io(format!("failed to create {}", self.models_dir().display()), e))?;
        fs::copy(&model_src, &model_dst).map_err(|e| {
            PipelineError::io(
                format!("failed to copy {} -> {}", model_src.display(), model_dst.display()),
                e,
            )
        })?;
        Ok(())
    }

    /// Decode the requested input page once and keep it as PNG for later raw-background
    /// renders. Pages past the first are only addressable in TIFF stacks.
    pub fn save_raw_snapshot(&self, input: &Path, page: u32) -> PipelineResult<PathBuf> {
        let img = if page == 0 {
            open_image(input)?
        } else {
            read_tiff_page(input, page)?
        };
        let out = self.raw_snapshot();
        save_image(&img, &out)?;
        Ok(out)
    }
}

/// Decode one directory of a multi-page TIFF.
pub fn read_tiff_page(path: &Path, page: u32) -> PipelineResult<DynamicImage> {
    let fail = |reason: String| PipelineError::Page {
        path: path.to_path_buf(),
        page,
        reason,
    };
    let file = fs::File::open(path).map_err(|e| PipelineError::io(format!("failed to open {}", path.display()), e))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| fail(format!("not a TIFF stack ({e})")))?;
    decoder
        .seek_to_image(page as usize)
        .map_err(|e| fail(format!("no such page ({e})")))?;
    let (w, h) = decoder.dimensions().map_err(|e| fail(e.to_string()))?;
    let color = decoder.colortype().map_err(|e| fail(e.to_string()))?;
    let data = decoder.read_image().map_err(|e| fail(e.to_string()))?;
    let img = match (color, data) {
        (ColorType::Gray(8), DecodingResult::U8(buf)) => GrayImage::from_raw(w, h, buf).map(DynamicImage::ImageLuma8),
        (ColorType::GrayA(8), DecodingResult::U8(buf)) => {
            GrayAlphaImage::from_raw(w, h, buf).map(DynamicImage::ImageLumaA8)
        }
        (ColorType::RGB(8), DecodingResult::U8(buf)) => RgbImage::from_raw(w, h, buf).map(DynamicImage::ImageRgb8),
        (ColorType::RGBA(8), DecodingResult::U8(buf)) => RgbaImage::from_raw(w, h, buf).map(DynamicImage::ImageRgba8),
        (ColorType::Gray(16), DecodingResult::U16(buf)) => {
            ImageBuffer::from_raw(w, h, buf).map(DynamicImage::ImageLuma16)
        }
        (ColorType::RGB(16), DecodingResult::U16(buf)) => ImageBuffer::from_raw(w, h, buf).map(DynamicImage::ImageRgb16),
        (ColorType::RGBA(16), DecodingResult::U16(buf)) => {
            ImageBuffer::from_raw(w, h, buf).map(DynamicImage::ImageRgba16)
        }
        (other, _) => return Err(fail(format!("unsupported sample layout {other:?}"))),
    };
    img.ok_or_else(|| fail(format!("pixel data does not fill {w}x{h}")))
}

fn copy_dir(src: &Path, dst: &Path) -> PipelineResult<()> {
    fs::create_dir_all(dst).map_err(|e| PipelineError::io(format!("failed to create {}", dst.display()), e))?;
    let entries = fs::read_dir(src).map_err(|e| PipelineError::io(format!("failed to read {}", src.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(format!("failed to read {}", src.display()), e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| {
                PipelineError::io(format!("failed to copy {} -> {}", from.display(), to.display()), e)
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{builtin_profiles, find_profile};
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn assets(dir: &Path) -> PathBuf {
        let root = dir.join("assets");
        fs::create_dir_all(root.join("scripts/helpers")).unwrap();
        fs::create_dir_all(root.join("models")).unwrap();
        fs::write(root.join("scripts/segment.py"), "print('seg')").unwrap();
        fs::write(root.join("scripts/metrics.py"), "print('metrics')").unwrap();
        fs::write(root.join("scripts/helpers/io.py"), "").unwrap();
        fs::write(root.join("models/40x.hdf5"), "weights").unwrap();
        root
    }

    #[test]
    fn each_run_gets_its_own_directory() {
        let dir = tempdir().unwrap();
        let a = RunWorkspace::create(Some(dir.path())).unwrap();
        let b = RunWorkspace::create(Some(dir.path())).unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());
        let name = a.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("histoseg_"));
        assert_eq!(RunWorkspace::open(a.path()).unwrap(), a);
    }

    #[test]
    fn installs_scripts_and_model() {
        let dir = tempdir().unwrap();
        let assets = assets(dir.path());
        let ws = RunWorkspace::create(Some(dir.path())).unwrap();
        let profile = find_profile(&builtin_profiles(), "brightfield-40x").unwrap();
        ws.install_assets(&assets, &profile).unwrap();
        assert!(ws.script("segment.py").is_file());
        assert!(ws.scripts_dir().join("helpers/io.py").is_file());
        assert!(ws.models_dir().join("40x.hdf5").is_file());
    }

    #[test]
    fn missing_model_is_a_packaging_defect() {
        let dir = tempdir().unwrap();
        let assets = assets(dir.path());
        let ws = RunWorkspace::create(Some(dir.path())).unwrap();
        let profile = find_profile(&builtin_profiles(), "brightfield-20x").unwrap();
        let err = ws.install_assets(&assets, &profile).unwrap_err();
        assert!(err.is_packaging_defect());
    }

    #[test]
    fn snapshot_is_written_as_png() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("slide.png");
        RgbImage::from_pixel(3, 2, Rgb([10, 20, 30])).save(&input).unwrap();
        let ws = RunWorkspace::create(Some(dir.path())).unwrap();
        let out = ws.save_raw_snapshot(&input, 0).unwrap();
        assert_eq!(out, ws.raw_snapshot());
        assert_eq!(image::open(out).unwrap().to_rgb8().get_pixel(2, 1), &Rgb([10, 20, 30]));
    }

    fn write_stack(path: &Path, pages: &[u8]) {
        let file = fs::File::create(path).unwrap();
        let mut enc = tiff::encoder::TiffEncoder::new(file).unwrap();
        for &v in pages {
            enc.write_image::<tiff::encoder::colortype::Gray8>(4, 3, &[v; 12]).unwrap();
        }
    }

    #[test]
    fn snapshot_reads_the_requested_page() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("stack.tif");
        write_stack(&input, &[10, 200]);
        let ws = RunWorkspace::create(Some(dir.path())).unwrap();
        let out = ws.save_raw_snapshot(&input, 1).unwrap();
        let snap = image::open(out).unwrap().to_luma8();
        assert_eq!(snap.dimensions(), (4, 3));
        assert_eq!(snap.get_pixel(3, 2).0[0], 200);
        ws.save_raw_snapshot(&input, 0).unwrap();
        assert_eq!(image::open(ws.raw_snapshot()).unwrap().to_luma8().get_pixel(0, 0).0[0], 10);
    }

    #[test]
    fn missing_page_is_an_error() {
        let dir = tempdir().unwrap();
        let stack = dir.path().join("stack.tif");
        write_stack(&stack, &[10, 200]);
        let ws = RunWorkspace::create(Some(dir.path())).unwrap();
        assert!(matches!(
            ws.save_raw_snapshot(&stack, 2),
            Err(PipelineError::Page { page: 2, .. })
        ));
        assert!(!ws.raw_snapshot().exists());

        let png = dir.path().join("slide.png");
        RgbImage::from_pixel(3, 2, Rgb([10, 20, 30])).save(&png).unwrap();
        assert!(matches!(
            ws.save_raw_snapshot(&png, 1),
            Err(PipelineError::Page { page: 1, .. })
        ));
    }

    #[test]
    fn opening_a_vanished_workspace_means_no_segmentation() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            RunWorkspace::open(&dir.path().join("gone")),
            Err(PipelineError::NoSegmentation)
        ));
    }
}
