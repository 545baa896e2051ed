//! Training data sources.
//!
//! The trainer pulls `(B, C, H, W)` batches with values in `[-1, 1]` from
//! a [`DataSource`]. [`ImageFolder`] reads image files from disk;
//! [`TensorDataset`] serves a tensor already in memory.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::ImageSettings;
use crate::error::{GanError, Result};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Finite sequence of batches, restarted once per epoch.
pub trait DataSource {
    /// Number of batches one epoch yields.
    fn num_iterations(&self) -> usize;

    /// Rewind to the first batch of a new epoch.
    fn start_epoch(&mut self) -> Result<()>;

    /// Next batch of the current epoch, or `None` when it is exhausted.
    fn next_batch(&mut self) -> Result<Option<Tensor>>;

    /// Release resources. Called once when training ends.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Images found under a directory, decoded batch by batch.
///
/// Every image is resized to fill the configured geometry (centre crop),
/// converted to RGB or grayscale, and scaled from `[0, 255]` to `[-1, 1]`.
/// Only full batches are produced; the remainder of a shuffled epoch is
/// dropped.
///
/// # Example
///
/// ```no_run
/// use candle_core::Device;
/// use dcgan_rs::config::ImageSettings;
/// use dcgan_rs::data::{DataSource, ImageFolder};
///
/// # fn main() -> dcgan_rs::Result<()> {
/// let mut faces = ImageFolder::open("./data/celeba", ImageSettings::default(), 64, 7, Device::Cpu)?;
/// faces.start_epoch()?;
/// while let Some(batch) = faces.next_batch()? {
///     assert_eq!(batch.dims(), &[64, 3, 64, 64]);
/// }
/// # Ok(())
/// # }
/// ```
pub struct ImageFolder {
    root: PathBuf,
    paths: Vec<PathBuf>,
    image: ImageSettings,
    batch_size: usize,
    cursor: usize,
    rng: ChaCha8Rng,
    device: Device,
}

impl ImageFolder {
    /// Index every image under `root` (recursively).
    ///
    /// # Errors
    ///
    /// Returns [`GanError::Config`] for a zero `batch_size` and
    /// [`GanError::Data`] if `root` holds fewer images than one batch.
    pub fn open<P: AsRef<Path>>(
        root: P,
        image: ImageSettings,
        batch_size: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(GanError::config("batch_size must be > 0"));
        }
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(GanError::data(format!(
                "image directory {} does not exist",
                root.display()
            )));
        }
        let paths = collect_images(&root)?;
        if paths.len() < batch_size {
            return Err(GanError::data(format!(
                "{} holds {} images, fewer than one batch of {batch_size}",
                root.display(),
                paths.len()
            )));
        }
        tracing::info!("Indexed {} images under {}", paths.len(), root.display());

        Ok(Self {
            root,
            paths,
            image,
            batch_size,
            cursor: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            device,
        })
    }

    /// Number of indexed images.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// True when no image was indexed.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let ImageSettings {
            channels,
            height,
            width,
        } = self.image;
        let decoded = image::open(path)?.resize_to_fill(width as u32, height as u32, FilterType::Triangle);

        let interleaved: Vec<u8> = if channels == 1 {
            decoded.to_luma8().into_raw()
        } else {
            decoded.to_rgb8().into_raw()
        };

        // HWC -> CHW
        let plane = height * width;
        let mut chw = vec![0.0f32; channels * plane];
        for (i, value) in interleaved.iter().enumerate() {
            let pixel = i / channels;
            let channel = i % channels;
            chw[channel * plane + pixel] = f32::from(*value) / 127.5 - 1.0;
        }
        Ok(chw)
    }
}

impl DataSource for ImageFolder {
    fn num_iterations(&self) -> usize {
        self.paths.len() / self.batch_size
    }

    fn start_epoch(&mut self) -> Result<()> {
        self.paths.shuffle(&mut self.rng);
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Tensor>> {
        if self.cursor + self.batch_size > self.paths.len() {
            return Ok(None);
        }

        let ImageSettings {
            channels,
            height,
            width,
        } = self.image;
        let mut values = Vec::with_capacity(self.batch_size * self.image.pixels());
        for path in &self.paths[self.cursor..self.cursor + self.batch_size] {
            values.extend(self.load(path)?);
        }
        self.cursor += self.batch_size;

        let batch = Tensor::from_vec(
            values,
            (self.batch_size, channels, height, width),
            &self.device,
        )?;
        Ok(Some(batch))
    }

    fn finalize(&mut self) -> Result<()> {
        tracing::debug!("Closing image folder {}", self.root.display());
        Ok(())
    }
}

fn collect_images(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_image(&path) {
                found.push(path);
            }
        }
    }
    // read_dir order is platform dependent
    found.sort();
    Ok(found)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// In-memory `(N, C, H, W)` tensor served in order, full batches only.
pub struct TensorDataset {
    images: Tensor,
    batch_size: usize,
    cursor: usize,
}

impl TensorDataset {
    /// Wrap `images`, which must be 4-dimensional.
    pub fn new(images: Tensor, batch_size: usize) -> Result<Self> {
        if images.rank() != 4 {
            return Err(GanError::shape_mismatch(
                "[N, C, H, W]",
                format!("{:?}", images.dims()),
            ));
        }
        if batch_size == 0 {
            return Err(GanError::config("batch_size must be > 0"));
        }
        Ok(Self {
            images,
            batch_size,
            cursor: 0,
        })
    }

    /// `num_batches` batches of uniform noise in `[-1, 1]`, for smoke runs.
    pub fn synthetic(
        image: ImageSettings,
        batch_size: usize,
        num_batches: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let count = batch_size * num_batches;
        let values: Vec<f32> = (0..count * image.pixels())
            .map(|_| rng.gen_range(-1.0f32..=1.0))
            .collect();
        let images = Tensor::from_vec(
            values,
            (count, image.channels, image.height, image.width),
            device,
        )?;
        Self::new(images, batch_size)
    }

    /// Number of images held.
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    /// True when the tensor holds no image.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataSource for TensorDataset {
    fn num_iterations(&self) -> usize {
        self.len() / self.batch_size
    }

    fn start_epoch(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Tensor>> {
        if self.cursor + self.batch_size > self.len() {
            return Ok(None);
        }
        let batch = self.images.narrow(0, self.cursor, self.batch_size)?;
        self.cursor += self.batch_size;
        Ok(Some(batch))
    }
}
