use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use oirds_finetune::config::{BATCH_SIZE, DATA_DIR, EPOCHS, OUTPUT_DIR, THREADS};
use oirds_finetune::FinetuneConfig;

#[derive(Parser)]
#[command(about = "Fine-tunes a pretrained network into a two-class image classifier.")]
pub struct Args {
    /// Network name: resnet18 or alexnet.
    #[arg(value_name = "MODEL")]
    model: String,

    /// Dataset directory holding `train` and `val` image folders.
    #[arg(short, long, default_value = DATA_DIR)]
    data: PathBuf,

    /// Pretrained weights (.ot or .safetensors). Default "[MODEL].ot", skipped if absent.
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Directory receiving modelDef-[MODEL].pth and finemodel-[MODEL].pth.
    #[arg(short, long, default_value = OUTPUT_DIR)]
    output: PathBuf,

    /// Number of epochs.
    #[arg(short, long, default_value_t = EPOCHS)]
    epochs: usize,

    /// Images per batch.
    #[arg(short, long, default_value_t = BATCH_SIZE)]
    batch_size: usize,

    /// Image loading threads.
    #[arg(short, long, default_value_t = THREADS)]
    threads: usize,

    /// Seed for shuffling, augmentation and weight initialisation.
    #[arg(long)]
    seed: Option<u64>,

    /// Stay on the CPU even when CUDA is available.
    #[arg(long)]
    cpu: bool,

    /// Hide the per-phase progress bars.
    #[arg(long)]
    no_progress: bool,

    /// More log output, repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Silence all log output.
    #[arg(short, long)]
    quiet: bool,
}

impl From<&Args> for FinetuneConfig {
    fn from(args: &Args) -> Self {
        Self {
            architecture: args.model.clone(),
            data_dir: args.data.clone(),
            weights: args.weights.clone(),
            output_dir: args.output.clone(),
            epochs: args.epochs,
            batch_size: args.batch_size,
            threads: args.threads,
            seed: args.seed,
            force_cpu: args.cpu,
            progress: !args.no_progress,
        }
    }
}

fn main() -> anyhow::Result<()> {
    println!("Usage: oirds-finetune resnet18/alexnet");

    let args = Args::parse();

    let verbosity = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    stderrlog::new()
        .module("oirds_finetune")
        .show_module_names(false)
        .quiet(args.quiet)
        .verbosity(verbosity)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    tch::set_num_threads(num_cpus::get() as i32);

    let summary = oirds_finetune::run(&FinetuneConfig::from(&args))?;

    println!(
        "Saved {} and {}",
        summary.artifacts.model_def.display(),
        summary.artifacts.state.display()
    );
    Ok(())
}
