mod data;
mod model;
mod train;

use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;

use crate::data::Dataset;
use crate::model::ModelKind;
use crate::train::TrainConfig;

/// Train a character-level language model on a plaintext corpus.
#[derive(Parser, Debug)]
struct Args {
    /// Which model to train
    #[arg(long, value_enum, default_value = "transformer")]
    model: ModelKind,
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    #[arg(long, default_value_t = 32)]
    sequence_length: usize,
    #[arg(long, default_value_t = 16)]
    embed_size: usize,
    /// Plaintext (or gzipped) training corpus
    #[arg(long, default_value = "data/input.txt")]
    corpus: PathBuf,
    #[arg(long, default_value_t = 3000)]
    steps: usize,
    #[arg(long, default_value_t = 0.01)]
    learning_rate: f64,
    /// Fraction of the corpus that becomes the train split
    #[arg(long, default_value_t = 0.9)]
    split_ratio: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let text = data::read_corpus(&args.corpus)?;
    let device = Device::cuda_if_available(0)?;
    let mut ds = Dataset::new(&text, args.split_ratio, args.seed, &device)?;
    let cfg = TrainConfig {
        model: args.model,
        batch_size: args.batch_size,
        sequence_length: args.sequence_length,
        embed_size: args.embed_size,
        steps: args.steps,
        learning_rate: args.learning_rate,
        seed: args.seed,
        ..TrainConfig::default()
    };
    train::run(&mut ds, &cfg)
}
