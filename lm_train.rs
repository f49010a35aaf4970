//! Trains a language model from a topology, a vocabulary and a corpus.
//!
//! ```bash
//! RUST_LOG=info lm_train --topology rnn.json --vocab vocab.txt \
//!     --train train.txt --valid valid.txt --config train.json \
//!     --output model.bin --encoding sparse
//! ```

use clap::Parser;
use rust_neural_lm::config::{load_config, TrainConfig};
use rust_neural_lm::driver::Driver;
use rust_neural_lm::model::{Model, ModelFormat, WeightEncoding};
use rust_neural_lm::reader::Corpus;
use rust_neural_lm::topology::load_topology;
use rust_neural_lm::utils::SimpleRng;
use rust_neural_lm::vocab::{load_vocab, Vocabulary};
use rust_neural_lm::Result;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lm_train", about = "Train a neural language model")]
struct Args {
    /// Topology document (JSON).
    #[arg(long)]
    topology: PathBuf,

    /// Vocabulary, one word per line.
    #[arg(long)]
    vocab: PathBuf,

    /// Training corpus, one sentence per line.
    #[arg(long)]
    train: PathBuf,

    /// Validation corpus evaluated after every epoch.
    #[arg(long)]
    valid: Option<PathBuf>,

    /// Training configuration (JSON); defaults apply when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where to write the trained model.
    #[arg(long)]
    output: PathBuf,

    /// Write the human-readable text image instead of the binary one.
    #[arg(long)]
    text: bool,

    /// Weight encoding of the model image: dense, sparse or quantized.
    #[arg(long, default_value = "dense")]
    encoding: WeightEncoding,
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => TrainConfig::default(),
    };
    let options = config.to_options()?;
    let topology = load_topology(&args.topology)?;
    let vocab = load_vocab(&args.vocab)?;

    let mut rng = SimpleRng::new(options.seed);
    let model = Model::from_topology(&topology, vocab, &mut rng)?;
    info!(
        words = model.vocab().size(),
        components = model.components().len(),
        parameters = model.num_parameters(),
        "model built"
    );

    let train = Corpus::File(args.train.clone());
    let valid = args.valid.clone().map(Corpus::File);
    let mut driver = Driver::new(model);
    let history = driver.train(&train, valid.as_ref(), options)?;
    if let Some(last) = history.last() {
        info!(
            epochs = history.len(),
            entropy = last.entropy(),
            ppl = last.perplexity(),
            "training finished"
        );
    }

    let model = driver.finish()?;
    let format = if args.text {
        ModelFormat::Text
    } else {
        ModelFormat::Binary
    };
    model.save(&args.output, format, args.encoding)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run(Args::parse()) {
        error!("{}", err);
        process::exit(1);
    }
}
