//! Image-folder datasets and their batch loaders.
//!
//! A split is a directory of class subdirectories, each holding images.
//! Loaders decode batches ahead of time on a shared rayon pool and hand back
//! `(inputs [B, 3, 224, 224], labels [B])` tensors on the target device.
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::ThreadPool;
use tch::{Device, Tensor};

use crate::config::{
    FinetuneConfig, IMAGENET_MEAN, IMAGENET_STD, IMG_SIZE, NUM_CLASSES, RESIZE_SIZE, TRAIN_SPLIT,
    VAL_SPLIT,
};
use crate::error::{FinetuneError, Result};

/// Batches decoded ahead of the one being consumed.
const PREFETCH_BATCHES: usize = 2;

const IMG_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff"];

// RandomSizedCrop bounds
const CROP_ATTEMPTS: usize = 10;
const MIN_AREA_FRACTION: f64 = 0.08;
const MIN_ASPECT: f64 = 3.0 / 4.0;
const MAX_ASPECT: f64 = 4.0 / 3.0;

/// One half of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Train,
    Val,
}

impl Phase {
    pub fn split_name(self) -> &'static str {
        match self {
            Phase::Train => TRAIN_SPLIT,
            Phase::Val => VAL_SPLIT,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.split_name())
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMG_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Sorted names of the class subdirectories of a split.
pub fn list_classes(split_dir: &Path) -> Result<Vec<String>> {
    if !split_dir.is_dir() {
        return Err(FinetuneError::MissingSplit(split_dir.to_path_buf()));
    }
    let mut classes: Vec<String> = fs::read_dir(split_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| p.file_name().and_then(|s| s.to_str()).map(|s| s.to_string()))
        .collect();
    classes.sort();
    Ok(classes)
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_images(&path, out)?;
        } else if is_image(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// Labelled image paths of one split.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    split: String,
    classes: Vec<String>,
    samples: Vec<(PathBuf, i64)>,
}

impl ImageFolder {
    /// Scans `base/split`. With `classes` given, labels come from that list
    /// and any other class directory is rejected.
    pub fn open(base: &Path, split: &str, classes: Option<&[String]>) -> Result<Self> {
        let split_dir = base.join(split);
        let found = list_classes(&split_dir)?;
        let classes = match classes {
            Some(classes) => classes.to_vec(),
            None => found.clone(),
        };

        let index_map: HashMap<&str, i64> = classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i as i64))
            .collect();

        let mut samples = Vec::new();
        for class_name in &found {
            let Some(&class_idx) = index_map.get(class_name.as_str()) else {
                return Err(FinetuneError::UnknownClass {
                    split: split.to_string(),
                    class: class_name.clone(),
                });
            };

            let mut img_paths = Vec::new();
            collect_images(&split_dir.join(class_name), &mut img_paths)?;
            img_paths.sort();

            debug!("{split} class {class_idx}: {class_name} ({} images)", img_paths.len());
            samples.extend(img_paths.into_iter().map(|p| (p, class_idx)));
        }

        if samples.is_empty() {
            return Err(FinetuneError::EmptySplit(split.to_string()));
        }

        Ok(Self { split: split.to_string(), classes, samples })
    }

    pub fn split(&self) -> &str {
        &self.split
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn samples(&self) -> &[(PathBuf, i64)] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Per-split preprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Random sized crop, then a random horizontal flip.
    Train { size: u32 },
    /// Shorter side rescaled to `resize`, then a centre crop.
    Eval { resize: u32, crop: u32 },
}

impl Transform {
    pub fn train() -> Self {
        Transform::Train { size: IMG_SIZE }
    }

    pub fn eval() -> Self {
        Transform::Eval { resize: RESIZE_SIZE, crop: IMG_SIZE }
    }

    pub fn output_size(&self) -> u32 {
        match *self {
            Transform::Train { size } => size,
            Transform::Eval { crop, .. } => crop,
        }
    }

    pub fn apply<R: Rng>(&self, img: DynamicImage, rng: &mut R) -> DynamicImage {
        match *self {
            Transform::Train { size } => {
                let img = random_sized_crop(&img, size, rng);
                if rng.gen_bool(0.5) {
                    img.fliph()
                } else {
                    img
                }
            }
            Transform::Eval { resize, crop } => center_crop(&scale(&img, resize), crop),
        }
    }
}

/// Resizes so that the shorter side equals `shorter`, keeping the aspect ratio.
pub fn scale(img: &DynamicImage, shorter: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w.min(h) == shorter {
        return img.clone();
    }
    let (nw, nh) = if w < h {
        (shorter, (u64::from(shorter) * u64::from(h) / u64::from(w)) as u32)
    } else {
        ((u64::from(shorter) * u64::from(w) / u64::from(h)) as u32, shorter)
    };
    img.resize_exact(nw, nh, FilterType::Triangle)
}

pub fn center_crop(img: &DynamicImage, size: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    let (cw, ch) = (size.min(w), size.min(h));
    let x = (w - cw) / 2;
    let y = (h - ch) / 2;
    let cropped = img.crop_imm(x, y, cw, ch);
    if cw == size && ch == size {
        cropped
    } else {
        cropped.resize_exact(size, size, FilterType::Triangle)
    }
}

fn random_sized_crop<R: Rng>(img: &DynamicImage, size: u32, rng: &mut R) -> DynamicImage {
    let (w, h) = img.dimensions();
    let area = f64::from(w) * f64::from(h);
    for _ in 0..CROP_ATTEMPTS {
        let target_area = rng.gen_range(MIN_AREA_FRACTION..=1.0) * area;
        let aspect_ratio = rng.gen_range(MIN_ASPECT..=MAX_ASPECT);

        let mut cw = (target_area * aspect_ratio).sqrt().round() as u32;
        let mut ch = (target_area / aspect_ratio).sqrt().round() as u32;
        if rng.gen_bool(0.5) {
            std::mem::swap(&mut cw, &mut ch);
        }

        if cw > 0 && ch > 0 && cw <= w && ch <= h {
            let x = rng.gen_range(0..=w - cw);
            let y = rng.gen_range(0..=h - ch);
            return img.crop_imm(x, y, cw, ch).resize_exact(size, size, FilterType::Triangle);
        }
    }
    center_crop(&scale(img, size), size)
}

/// CHW float data in [0, 1], normalised with the ImageNet statistics.
pub fn to_normalized_chw(img: &DynamicImage) -> Vec<f32> {
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (i, px) in rgb.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (f32::from(px[c]) / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    data
}

fn load_sample(path: &Path, transform: Transform, seed: u64) -> Result<Vec<f32>> {
    let img = image::open(path)
        .map_err(|source| FinetuneError::Image { path: path.to_path_buf(), source })?;
    let mut rng = StdRng::seed_from_u64(seed);
    Ok(to_normalized_chw(&transform.apply(img, &mut rng)))
}

/// Shuffling batch loader over an [`ImageFolder`].
pub struct SplitLoader {
    folder: ImageFolder,
    transform: Transform,
    batch_size: usize,
    shuffle: bool,
    pool: Arc<ThreadPool>,
    rng: StdRng,
}

impl SplitLoader {
    pub fn new(
        folder: ImageFolder,
        transform: Transform,
        batch_size: usize,
        pool: Arc<ThreadPool>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { folder, transform, batch_size: batch_size.max(1), shuffle: true, pool, rng }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Number of batches per pass.
    pub fn len(&self) -> usize {
        self.folder.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.folder.is_empty()
    }

    /// Number of images in the split.
    pub fn dataset_len(&self) -> usize {
        self.folder.len()
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Starts a pass over the split, reshuffled when shuffling is on.
    ///
    /// Decoding runs ahead on the loader pool, at most `PREFETCH_BATCHES`
    /// batches in front of the consumer.
    pub fn iter(&mut self, device: Device) -> Batches {
        let mut order: Vec<usize> = (0..self.folder.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        let samples = self.folder.samples();
        let jobs: Vec<Vec<(PathBuf, i64, u64)>> = order
            .chunks(self.batch_size)
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|&i| (samples[i].0.clone(), samples[i].1, self.rng.gen()))
                    .collect()
            })
            .collect();

        let remaining = jobs.len();
        let transform = self.transform;
        let (tx, rx) = mpsc::sync_channel(PREFETCH_BATCHES);
        self.pool.spawn(move || {
            for job in jobs {
                let decoded = decode_batch(&job, transform);
                let failed = decoded.is_err();
                if tx.send(decoded).is_err() || failed {
                    break;
                }
            }
        });

        Batches { rx, remaining, side: i64::from(transform.output_size()), device }
    }
}

/// Images and labels of one batch, decoded off the training thread.
type DecodedBatch = (Vec<Vec<f32>>, Vec<i64>);

fn decode_batch(job: &[(PathBuf, i64, u64)], transform: Transform) -> Result<DecodedBatch> {
    let images = job
        .par_iter()
        .map(|(path, _, seed)| load_sample(path, transform, *seed))
        .collect::<Result<Vec<_>>>()?;
    let labels = job.iter().map(|(_, label, _)| *label).collect();
    Ok((images, labels))
}

impl fmt::Debug for SplitLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitLoader")
            .field("split", &self.folder.split())
            .field("images", &self.folder.len())
            .field("batch_size", &self.batch_size)
            .field("shuffle", &self.shuffle)
            .field("transform", &self.transform)
            .finish()
    }
}

/// One pass over a [`SplitLoader`].
pub struct Batches {
    rx: mpsc::Receiver<Result<DecodedBatch>>,
    remaining: usize,
    side: i64,
    device: Device,
}

impl Iterator for Batches {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        // A closed channel means the decoder stopped early.
        let decoded = self.rx.recv().ok()?;
        self.remaining -= 1;
        let side = self.side;
        Some(decoded.map(|(images, labels)| {
            let xs: Vec<Tensor> = images
                .iter()
                .map(|data| Tensor::from_slice(data).reshape([3, side, side]))
                .collect();
            (Tensor::stack(&xs, 0).to(self.device), Tensor::from_slice(&labels).to(self.device))
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

/// Loaders, split sizes, class names and device of a run.
#[derive(Debug)]
pub struct DataContext {
    pub train: SplitLoader,
    pub val: SplitLoader,
    pub classes: Vec<String>,
    pub device: Device,
}

impl DataContext {
    pub fn open(config: &FinetuneConfig, device: Device) -> Result<Self> {
        let train_folder = ImageFolder::open(&config.data_dir, TRAIN_SPLIT, None)?;
        let classes = train_folder.classes().to_vec();
        if classes.len() != NUM_CLASSES as usize {
            return Err(FinetuneError::ClassCount { expected: NUM_CLASSES as usize, found: classes });
        }
        let val_folder = ImageFolder::open(&config.data_dir, VAL_SPLIT, Some(classes.as_slice()))?;

        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(config.threads.max(1))
                .thread_name(|i| format!("loader-{i}"))
                .build()?,
        );

        info!(
            "dataset {}: train {} images, val {} images, classes {:?}",
            config.data_dir.display(),
            train_folder.len(),
            val_folder.len(),
            classes
        );

        let train = SplitLoader::new(
            train_folder,
            Transform::train(),
            config.batch_size,
            Arc::clone(&pool),
            config.seed,
        );
        let val = SplitLoader::new(
            val_folder,
            Transform::eval(),
            config.batch_size,
            pool,
            config.seed.map(|s| s.wrapping_add(1)),
        );
        Ok(Self { train, val, classes, device })
    }

    pub fn loader_mut(&mut self, phase: Phase) -> &mut SplitLoader {
        match phase {
            Phase::Train => &mut self.train,
            Phase::Val => &mut self.val,
        }
    }

    pub fn size(&self, phase: Phase) -> usize {
        match phase {
            Phase::Train => self.train.dataset_len(),
            Phase::Val => self.val.dataset_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(w: u32, h: u32, color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb(color)))
    }

    #[test]
    fn image_extensions() {
        assert!(is_image(Path::new("a/b.JPG")));
        assert!(is_image(Path::new("a/b.png")));
        assert!(!is_image(Path::new("a/b.txt")));
        assert!(!is_image(Path::new("a/noext")));
    }

    #[test]
    fn scale_keeps_aspect() {
        let img = scale(&solid(400, 300, [0, 0, 0]), 256);
        assert_eq!(img.dimensions(), (341, 256));
        let img = scale(&solid(300, 600, [0, 0, 0]), 256);
        assert_eq!(img.dimensions(), (256, 512));
    }

    #[test]
    fn eval_transform_is_deterministic_224() {
        let mut rng = StdRng::seed_from_u64(0);
        let img = Transform::eval().apply(solid(320, 240, [10, 20, 30]), &mut rng);
        assert_eq!(img.dimensions(), (224, 224));
    }

    #[test]
    fn train_transform_outputs_224() {
        let mut rng = StdRng::seed_from_u64(7);
        for (w, h) in [(50, 50), (640, 480), (30, 500)] {
            let img = Transform::train().apply(solid(w, h, [1, 2, 3]), &mut rng);
            assert_eq!(img.dimensions(), (224, 224));
        }
    }

    #[test]
    fn normalization_layout() {
        let data = to_normalized_chw(&solid(2, 2, [255, 0, 255]));
        assert_eq!(data.len(), 12);
        let red = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let green = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        assert!((data[0] - red).abs() < 1e-6);
        assert!((data[4] - green).abs() < 1e-6);
    }
}
