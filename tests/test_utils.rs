#![allow(dead_code)]
use std::fs;
use std::path::Path;

use image::{Rgb, RgbImage};
use oirds_finetune::FinetuneConfig;

pub const CLASSES: [&str; 2] = ["cars", "empty"];

fn colour(class: usize) -> [u8; 3] {
    if class == 0 {
        [200, 40, 40]
    } else {
        [40, 40, 200]
    }
}

pub fn write_image(path: &Path, class: usize, w: u32, h: u32) {
    let [r, g, b] = colour(class);
    let img = RgbImage::from_fn(w, h, |x, y| {
        Rgb([r.wrapping_add((x % 16) as u8), g.wrapping_add((y % 16) as u8), b])
    });
    img.save(path).unwrap();
}

/// `per_class` images per class in both `train` and `val`.
pub fn write_toy_dataset(root: &Path, per_class: usize) {
    for split in ["train", "val"] {
        for (class, name) in CLASSES.iter().enumerate() {
            let dir = root.join(split).join(name);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                write_image(&dir.join(format!("{i}.png")), class, 64 + 8 * i as u32, 48);
            }
        }
    }
}

pub fn toy_config(architecture: &str, data: &Path, output: &Path) -> FinetuneConfig {
    let mut config = FinetuneConfig::new(architecture);
    config.data_dir = data.to_path_buf();
    config.output_dir = output.to_path_buf();
    config.epochs = 1;
    config.batch_size = 2;
    config.threads = 2;
    config.seed = Some(0);
    config.force_cpu = true;
    config.progress = false;
    config
}

pub fn dir_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir).map(|mut entries| entries.next().is_none()).unwrap_or(true)
}
