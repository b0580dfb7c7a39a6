use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use tch::{nn, Device, Kind};

use crate::data::{DataContext, Phase, SplitLoader};
use crate::error::Result;
use crate::model::{FineTuneModel, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainSettings {
    pub epochs: usize,
    pub progress: bool,
}

/// Loss and accuracy of one phase of one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseStats {
    pub phase: Phase,
    /// Sum of the batch-mean losses divided by the split size.
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
    pub corrects: i64,
    pub batches: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub train: PhaseStats,
    pub val: PhaseStats,
}

#[derive(Debug)]
pub struct TrainOutcome {
    pub best_acc: f64,
    /// Copy of the model at its best validation epoch, `None` if accuracy never rose above 0.
    pub best: Option<Snapshot>,
    pub history: Vec<EpochReport>,
    pub elapsed: Duration,
}

impl TrainOutcome {
    pub fn val_accuracies(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().map(|r| r.val.accuracy)
    }
}

fn phase_bar(phase: Phase, batches: usize, progress: bool) -> ProgressBar {
    if !progress {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(batches as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "  [{prefix}] {elapsed_precise} │{bar:48.magenta/blue}│ {pos}/{len} • {per_sec} • eta {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░"),
    );
    pb.set_prefix(phase.to_string());
    pb
}

/// One pass over `loader`. Parameters are updated only when an optimizer is given.
fn run_phase(
    model: &mut FineTuneModel,
    mut optimizer: Option<&mut nn::Optimizer>,
    loader: &mut SplitLoader,
    device: Device,
    phase: Phase,
    progress: bool,
) -> Result<PhaseStats> {
    model.set_train(optimizer.is_some());

    let split_size = loader.dataset_len();
    let pb = phase_bar(phase, loader.len(), progress);

    let mut running_loss = 0.0;
    let mut running_corrects = 0i64;
    let mut batches = 0usize;

    for batch in loader.iter(device) {
        pb.inc(1);
        let (inputs, labels) = batch?;

        if let Some(opt) = optimizer.as_mut() {
            opt.zero_grad();
        }

        let outputs = if optimizer.is_some() {
            model.forward(&inputs)
        } else {
            tch::no_grad(|| model.forward(&inputs))
        };
        let preds = outputs.argmax(1, false);
        let loss = outputs.cross_entropy_for_logits(&labels);

        if let Some(opt) = optimizer.as_mut() {
            loss.backward();
            opt.step();
        }

        running_loss += loss.double_value(&[]);
        running_corrects += preds.eq_tensor(&labels).sum(Kind::Int64).int64_value(&[]);
        batches += 1;
    }
    pb.finish_and_clear();

    let split_size_f = split_size.max(1) as f64;
    Ok(PhaseStats {
        phase,
        loss: running_loss / split_size_f,
        accuracy: running_corrects as f64 / split_size_f,
        samples: split_size,
        corrects: running_corrects,
        batches,
    })
}

/// Recomputes loss and accuracy of a split in evaluation mode.
pub fn evaluate(model: &mut FineTuneModel, loader: &mut SplitLoader) -> Result<PhaseStats> {
    let device = model.device();
    run_phase(model, None, loader, device, Phase::Val, false)
}

/// Runs `settings.epochs` epochs of training then validation and keeps a copy
/// of the model each time validation accuracy improves.
pub fn train_model(
    model: &mut FineTuneModel,
    optimizer: &mut nn::Optimizer,
    data: &mut DataContext,
    settings: &TrainSettings,
) -> Result<TrainOutcome> {
    let since = Instant::now();
    let device = data.device;

    let mut best_acc = 0.0;
    let mut best = None;
    let mut history = Vec::with_capacity(settings.epochs);

    for epoch in 0..settings.epochs {
        println!("Epoch {}/{}", epoch, settings.epochs - 1);
        println!("{}", "-".repeat(10));

        let train = run_phase(
            model,
            Some(&mut *optimizer),
            data.loader_mut(Phase::Train),
            device,
            Phase::Train,
            settings.progress,
        )?;
        println!("{} Loss: {:.4} Acc: {:.4}", train.phase, train.loss, train.accuracy);

        let val = run_phase(
            model,
            None,
            data.loader_mut(Phase::Val),
            device,
            Phase::Val,
            settings.progress,
        )?;
        println!("{} Loss: {:.4} Acc: {:.4}", val.phase, val.loss, val.accuracy);

        if val.accuracy > best_acc {
            best_acc = val.accuracy;
            best = Some(Snapshot::capture(model));
            debug!("epoch {epoch}: new best val accuracy {best_acc:.4}");
        }

        history.push(EpochReport { epoch, train, val });
        println!();
    }

    let elapsed = since.elapsed();
    let secs = elapsed.as_secs_f64();
    println!("Training complete in {:.0}m {:.0}s", (secs / 60.0).floor(), secs % 60.0);
    println!("Best val Acc: {best_acc:.4}");

    Ok(TrainOutcome { best_acc, best, history, elapsed })
}
