mod test_utils;

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use oirds_finetune::data::{DataContext, ImageFolder, Phase, SplitLoader, Transform};
use oirds_finetune::FinetuneError;
use tch::Device;
use test_utils::*;

fn pool() -> Arc<rayon::ThreadPool> {
    Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap())
}

#[test]
fn image_folder_classes_and_labels() {
    let dir = tempfile::tempdir().unwrap();
    write_toy_dataset(dir.path(), 2);
    let nested = dir.path().join("train").join("empty").join("more");
    fs::create_dir_all(&nested).unwrap();
    write_image(&nested.join("deep.png"), 1, 32, 32);
    fs::write(dir.path().join("train").join("cars").join("notes.txt"), "x").unwrap();

    let folder = ImageFolder::open(dir.path(), "train", None).unwrap();
    assert_eq!(folder.classes(), ["cars".to_string(), "empty".to_string()]);
    assert_eq!(folder.len(), 5);
    let labels: Vec<i64> = folder.samples().iter().map(|(_, l)| *l).collect();
    assert_eq!(labels, [0, 0, 1, 1, 1]);
}

#[test]
fn missing_and_empty_splits() {
    let dir = tempfile::tempdir().unwrap();
    let err = ImageFolder::open(dir.path(), "train", None).unwrap_err();
    assert!(matches!(err, FinetuneError::MissingSplit(_)));

    fs::create_dir_all(dir.path().join("val").join("cars")).unwrap();
    let err = ImageFolder::open(dir.path(), "val", None).unwrap_err();
    assert!(matches!(err, FinetuneError::EmptySplit(ref s) if s == "val"));
}

#[test]
fn val_uses_train_classes() {
    let dir = tempfile::tempdir().unwrap();
    write_toy_dataset(dir.path(), 1);
    let classes = vec!["cars".to_string(), "empty".to_string()];
    let val = ImageFolder::open(dir.path(), "val", Some(classes.as_slice())).unwrap();
    assert_eq!(val.len(), 2);

    let extra = dir.path().join("val").join("trucks");
    fs::create_dir_all(&extra).unwrap();
    write_image(&extra.join("0.png"), 0, 32, 32);
    let err = ImageFolder::open(dir.path(), "val", Some(classes.as_slice())).unwrap_err();
    assert!(matches!(err, FinetuneError::UnknownClass { ref class, .. } if class == "trucks"));
}

#[test]
fn loader_batches() {
    let dir = tempfile::tempdir().unwrap();
    write_toy_dataset(dir.path(), 3);
    let folder = ImageFolder::open(dir.path(), "train", None).unwrap();
    let mut loader = SplitLoader::new(folder, Transform::train(), 4, pool(), Some(1));
    assert_eq!(loader.dataset_len(), 6);
    assert_eq!(loader.len(), 2);

    let mut sizes = Vec::new();
    let mut labels = Vec::new();
    for batch in loader.iter(Device::Cpu) {
        let (xs, ys) = batch.unwrap();
        assert_eq!(&xs.size()[1..], &[3, 224, 224]);
        sizes.push(xs.size()[0]);
        labels.extend(Vec::<i64>::try_from(&ys).unwrap());
    }
    assert_eq!(sizes, [4, 2]);
    labels.sort();
    assert_eq!(labels, [0, 0, 0, 1, 1, 1]);
}

#[test]
fn seeded_loaders_agree() {
    let dir = tempfile::tempdir().unwrap();
    write_toy_dataset(dir.path(), 4);
    let order = |seed| {
        let folder = ImageFolder::open(dir.path(), "train", None).unwrap();
        let mut loader = SplitLoader::new(folder, Transform::train(), 8, pool(), Some(seed));
        let (xs, ys) = loader.iter(Device::Cpu).next().unwrap().unwrap();
        (xs, Vec::<i64>::try_from(&ys).unwrap())
    };
    let (xs1, ys1) = order(5);
    let (xs2, ys2) = order(5);
    assert_eq!(ys1, ys2);
    assert!(xs1.equal(&xs2));
}

#[test]
fn unshuffled_eval_pass_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    write_toy_dataset(dir.path(), 2);
    let folder = ImageFolder::open(dir.path(), "val", None).unwrap();
    let mut loader = SplitLoader::new(folder, Transform::eval(), 4, pool(), None).with_shuffle(false);
    let (a, la) = loader.iter(Device::Cpu).next().unwrap().unwrap();
    let (b, lb) = loader.iter(Device::Cpu).next().unwrap().unwrap();
    assert!(a.equal(&b));
    assert!(la.equal(&lb));
}

#[test]
fn read_ahead_pass_keeps_batch_order() {
    let dir = tempfile::tempdir().unwrap();
    write_toy_dataset(dir.path(), 2);
    let folder = ImageFolder::open(dir.path(), "train", None).unwrap();
    let single = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap());
    let mut loader = SplitLoader::new(folder, Transform::eval(), 1, single, None).with_shuffle(false);

    // An abandoned pass must not stall the next one.
    let first = loader.iter(Device::Cpu).next().unwrap().unwrap();

    let mut batches = loader.iter(Device::Cpu);
    assert_eq!(batches.size_hint(), (0, Some(4)));
    let mut labels = Vec::new();
    for (i, batch) in batches.by_ref().enumerate() {
        let (xs, ys) = batch.unwrap();
        if i == 0 {
            assert!(xs.equal(&first.0));
        }
        labels.extend(Vec::<i64>::try_from(&ys).unwrap());
    }
    assert_eq!(labels, [0, 0, 1, 1]);
    assert!(batches.next().is_none());
}

#[test]
fn decode_failure_ends_the_pass() {
    let dir = tempfile::tempdir().unwrap();
    write_toy_dataset(dir.path(), 1);
    fs::write(dir.path().join("val").join("cars").join("broken.png"), b"not an image").unwrap();
    let folder = ImageFolder::open(dir.path(), "val", None).unwrap();
    let mut loader = SplitLoader::new(folder, Transform::eval(), 1, pool(), None).with_shuffle(false);

    let mut batches = loader.iter(Device::Cpu);
    assert!(batches.next().unwrap().is_ok());
    assert!(matches!(batches.next().unwrap(), Err(FinetuneError::Image { .. })));
    assert!(batches.next().is_none());
}

#[test]
fn data_context_reports_splits() {
    let dir = tempfile::tempdir().unwrap();
    write_toy_dataset(dir.path(), 1);
    let config = toy_config("resnet18", dir.path(), dir.path());
    let data = DataContext::open(&config, Device::Cpu).unwrap();
    assert_eq!(data.classes, ["cars".to_string(), "empty".to_string()]);
    assert_eq!(data.size(Phase::Train), 2);
    assert_eq!(data.size(Phase::Val), 2);
    assert_eq!(data.val.transform(), Transform::eval());
}

#[test]
fn two_classes_required() {
    let dir = tempfile::tempdir().unwrap();
    write_toy_dataset(dir.path(), 1);
    let third = dir.path().join("train").join("trucks");
    fs::create_dir_all(&third).unwrap();
    write_image(&third.join("0.png"), 0, 32, 32);

    let config = toy_config("resnet18", dir.path(), dir.path());
    let err = DataContext::open(&config, Device::Cpu).unwrap_err();
    match err {
        FinetuneError::ClassCount { expected, found } => {
            assert_eq!(expected, 2);
            assert_eq!(found.into_iter().collect::<HashSet<_>>().len(), 3);
        }
        other => panic!("unexpected error {other}"),
    }
}
