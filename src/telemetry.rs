//! Scalar and image telemetry.
//!
//! Emission never fails from the caller's point of view: a sink that cannot
//! write logs a warning and drops the record, and training continues.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{GanError, Result};

/// Pixels between grid cells.
const GRID_PADDING: usize = 2;

/// Destination for training telemetry.
pub trait TelemetrySink {
    /// Record `value` for series `name` at `step`.
    fn emit_scalar(&mut self, name: &str, value: f64, step: usize);

    /// Record a `(B, C, H, W)` image batch with values in `[-1, 1]`.
    fn emit_image(&mut self, name: &str, images: &Tensor, step: usize);

    /// Flush buffered records. Only the first call has an effect.
    fn finalize(&mut self);
}

/// One scalar observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    /// Series name.
    pub name: String,
    /// Global iteration.
    pub step: usize,
    /// Observed value.
    pub value: f64,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
}

/// Series name to `[wall_time, step, value]` points.
type ScalarHistory = BTreeMap<String, Vec<(f64, usize, f64)>>;

/// File-backed sink.
///
/// Layout under the summary directory:
///
/// - `scalars.jsonl`: one [`ScalarRecord`] per line, appended as emitted
/// - `images/<name>_<step>.png`: image batches rendered as a grid
/// - `all_scalars.json`: written by `finalize`, maps each series to
///   `[wall_time, step, value]` triples
pub struct SummaryWriter {
    dir: PathBuf,
    scalars: Option<BufWriter<File>>,
    history: ScalarHistory,
    finalized: bool,
}

impl SummaryWriter {
    /// Open (or create) the summary directory.
    ///
    /// Records already present in `scalars.jsonl` from earlier runs are
    /// loaded so `all_scalars.json` keeps covering the whole history.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join("images"))?;
        let path = dir.join("scalars.jsonl");
        let history = read_history(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            dir,
            scalars: Some(BufWriter::new(file)),
            history,
            finalized: false,
        })
    }

    /// Directory receiving the summaries.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the PNG written for `name` at `step`.
    pub fn image_path(&self, name: &str, step: usize) -> PathBuf {
        self.dir
            .join("images")
            .join(format!("{}_{step:08}.png", sanitize(name)))
    }

    fn write_scalar(&mut self, record: &ScalarRecord) -> Result<()> {
        let writer = self
            .scalars
            .as_mut()
            .ok_or_else(|| GanError::config("summary writer already finalized"))?;
        let line = serde_json::to_string(record)
            .map_err(|e| GanError::config(format!("scalar encoding failed: {e}")))?;
        writeln!(writer, "{line}")?;
        Ok(())
    }

    fn write_image(&self, name: &str, images: &Tensor, step: usize) -> Result<()> {
        let grid = image_grid(images)?;
        grid.save(self.image_path(name, step))?;
        Ok(())
    }

    fn export_scalars(&self) -> Result<()> {
        let export: BTreeMap<&str, Vec<(f64, usize, f64)>> = self
            .history
            .iter()
            .map(|(name, points)| (name.as_str(), points.clone()))
            .collect();
        let json = serde_json::to_string_pretty(&export)
            .map_err(|e| GanError::config(format!("scalar export failed: {e}")))?;
        fs::write(self.dir.join("all_scalars.json"), json)?;
        Ok(())
    }
}

impl TelemetrySink for SummaryWriter {
    fn emit_scalar(&mut self, name: &str, value: f64, step: usize) {
        let record = ScalarRecord {
            name: name.to_string(),
            step,
            value,
            wall_time: wall_time(),
        };
        if let Err(e) = self.write_scalar(&record) {
            tracing::warn!("Dropping scalar {name}@{step}: {e}");
            return;
        }
        self.history
            .entry(record.name)
            .or_default()
            .push((record.wall_time, step, value));
    }

    fn emit_image(&mut self, name: &str, images: &Tensor, step: usize) {
        if let Err(e) = self.write_image(name, images, step) {
            tracing::warn!("Dropping image {name}@{step}: {e}");
        }
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        if let Some(mut writer) = self.scalars.take() {
            if let Err(e) = writer.flush() {
                tracing::warn!("Failed to flush scalars: {e}");
            }
        }
        match self.export_scalars() {
            Ok(()) => tracing::info!("Exported scalars to {}", self.dir.display()),
            Err(e) => tracing::warn!("Failed to export scalars: {e}"),
        }
    }
}

/// Sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct InMemoryTelemetry {
    /// Scalars in emission order.
    pub scalars: Vec<ScalarRecord>,
    /// `(name, step, dims)` of every image batch.
    pub images: Vec<(String, usize, Vec<usize>)>,
    /// Number of `finalize` calls that flushed.
    pub flushes: usize,
    finalized: bool,
}

impl InMemoryTelemetry {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Values of series `name` in emission order.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.scalars
            .iter()
            .filter(|r| r.name == name)
            .map(|r| (r.step, r.value))
            .collect()
    }
}

impl TelemetrySink for InMemoryTelemetry {
    fn emit_scalar(&mut self, name: &str, value: f64, step: usize) {
        self.scalars.push(ScalarRecord {
            name: name.to_string(),
            step,
            value,
            wall_time: wall_time(),
        });
    }

    fn emit_image(&mut self, name: &str, images: &Tensor, step: usize) {
        self.images
            .push((name.to_string(), step, images.dims().to_vec()));
    }

    fn finalize(&mut self) {
        if !self.finalized {
            self.finalized = true;
            self.flushes += 1;
        }
    }
}

/// Render a `(B, C, H, W)` batch in `[-1, 1]` as a padded RGB grid with
/// `ceil(sqrt(B))` columns. Single-channel images are shown in gray.
pub fn image_grid(images: &Tensor) -> Result<RgbImage> {
    let (batch, channels, height, width) = images.dims4()?;
    if !matches!(channels, 1 | 3) {
        return Err(GanError::shape_mismatch(
            "1 or 3 channels",
            format!("{channels} channels"),
        ));
    }
    let values: Vec<f32> = images
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1()?;

    let cols = ((batch as f64).sqrt().ceil() as usize).max(1);
    let rows = batch.div_ceil(cols).max(1);
    let grid_w = cols * (width + GRID_PADDING) + GRID_PADDING;
    let grid_h = rows * (height + GRID_PADDING) + GRID_PADDING;
    let mut grid = RgbImage::new(grid_w as u32, grid_h as u32);

    let plane = height * width;
    let to_u8 = |v: f32| ((v + 1.0) * 127.5).round().clamp(0.0, 255.0) as u8;
    for b in 0..batch {
        let x0 = GRID_PADDING + (b % cols) * (width + GRID_PADDING);
        let y0 = GRID_PADDING + (b / cols) * (height + GRID_PADDING);
        let base = b * channels * plane;
        for y in 0..height {
            for x in 0..width {
                let at = |c: usize| to_u8(values[base + c * plane + y * width + x]);
                let pixel = if channels == 1 {
                    let g = at(0);
                    Rgb([g, g, g])
                } else {
                    Rgb([at(0), at(1), at(2)])
                };
                grid.put_pixel((x0 + x) as u32, (y0 + y) as u32, pixel);
            }
        }
    }
    Ok(grid)
}

fn read_history(path: &Path) -> Result<ScalarHistory> {
    let mut history = ScalarHistory::new();
    if !path.exists() {
        return Ok(history);
    }
    let mut skipped = 0usize;
    for line in BufReader::new(File::open(path)?).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ScalarRecord>(&line) {
            Ok(record) => history.entry(record.name).or_default().push((
                record.wall_time,
                record.step,
                record.value,
            )),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::warn!("Skipped {skipped} unreadable lines in {}", path.display());
    }
    Ok(history)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn wall_time() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(b: usize, c: usize, value: f32) -> Tensor {
        (Tensor::ones((b, c, 3, 5), DType::F32, &Device::Cpu).unwrap() * f64::from(value)).unwrap()
    }

    #[test]
    fn test_image_grid_layout() {
        let grid = image_grid(&batch(5, 3, 1.0)).unwrap();
        // 3 columns, 2 rows
        assert_eq!(grid.width() as usize, 3 * (5 + 2) + 2);
        assert_eq!(grid.height() as usize, 2 * (3 + 2) + 2);
        assert_eq!(grid.get_pixel(2, 2), &Rgb([255, 255, 255]));
        assert_eq!(grid.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_image_grid_grayscale_and_range() {
        let grid = image_grid(&batch(1, 1, -1.0)).unwrap();
        assert_eq!(grid.get_pixel(2, 2), &Rgb([0, 0, 0]));

        let clipped = image_grid(&batch(1, 1, 4.0)).unwrap();
        assert_eq!(clipped.get_pixel(2, 2), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_image_grid_rejects_bad_shape() {
        assert!(image_grid(&batch(2, 2, 0.0)).is_err());
        let flat = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(image_grid(&flat).is_err());
    }

    #[test]
    fn test_summary_writer_scalars_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SummaryWriter::create(dir.path()).unwrap();

        writer.emit_scalar("epoch/generator_loss", 1.5, 1);
        writer.emit_scalar("epoch/generator_loss", 1.25, 101);
        writer.emit_scalar("epoch/discriminator_loss", 0.75, 1);
        writer.finalize();

        let lines = fs::read_to_string(dir.path().join("scalars.jsonl")).unwrap();
        let records: Vec<ScalarRecord> = lines
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].step, 101);

        let export: BTreeMap<String, Vec<(f64, usize, f64)>> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("all_scalars.json")).unwrap(),
        )
        .unwrap();
        let gen = &export["epoch/generator_loss"];
        assert_eq!(gen.len(), 2);
        assert_eq!((gen[1].1, gen[1].2), (101, 1.25));
    }

    #[test]
    fn test_summary_writer_export_spans_reopened_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = SummaryWriter::create(dir.path()).unwrap();
        first.emit_scalar("epoch/generator_loss", 2.0, 1);
        first.finalize();

        let mut second = SummaryWriter::create(dir.path()).unwrap();
        second.emit_scalar("epoch/generator_loss", 1.0, 5);
        second.finalize();

        let export: ScalarHistory = serde_json::from_str(
            &fs::read_to_string(dir.path().join("all_scalars.json")).unwrap(),
        )
        .unwrap();
        let steps: Vec<usize> = export["epoch/generator_loss"].iter().map(|p| p.1).collect();
        assert_eq!(steps, vec![1, 5]);
    }

    #[test]
    fn test_summary_writer_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SummaryWriter::create(dir.path()).unwrap();
        writer.emit_image("Real image 0", &batch(4, 3, 0.0), 1);

        let path = writer.image_path("Real image 0", 1);
        assert!(path.ends_with("images/Real_image_0_00000001.png"));
        let img = image::open(&path).unwrap();
        assert_eq!(img.width() as usize, 2 * (5 + 2) + 2);
    }

    #[test]
    fn test_summary_writer_failures_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SummaryWriter::create(dir.path()).unwrap();

        writer.emit_image("bad", &batch(1, 2, 0.0), 1);
        assert!(!writer.image_path("bad", 1).exists());

        writer.finalize();
        writer.emit_scalar("late", 1.0, 2);
        writer.finalize();
        assert!(dir.path().join("all_scalars.json").exists());
    }

    #[test]
    fn test_in_memory_finalize_is_idempotent() {
        let mut sink = InMemoryTelemetry::new();
        sink.emit_scalar("a", 1.0, 1);
        sink.emit_scalar("b", 2.0, 1);
        sink.emit_scalar("a", 3.0, 2);
        sink.emit_image("img", &batch(2, 1, 0.0), 2);
        sink.finalize();
        sink.finalize();

        assert_eq!(sink.series("a"), vec![(1, 1.0), (2, 3.0)]);
        assert_eq!(sink.images[0].2, vec![2, 1, 3, 5]);
        assert_eq!(sink.flushes, 1);
    }
}
