//! Scores a corpus with a trained language model.
//!
//! ```bash
//! lm_eval --model model.bin --test test.txt --threads 4
//! ```

use clap::Parser;
use rust_neural_lm::driver::{Driver, TrainOptions};
use rust_neural_lm::model::Model;
use rust_neural_lm::reader::{tokenize, Corpus};
use rust_neural_lm::Result;
use std::path::PathBuf;
use std::process;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lm_eval", about = "Compute entropy and perplexity of a corpus")]
struct Args {
    /// Model image written by lm_train.
    #[arg(long)]
    model: PathBuf,

    /// Test corpus, one sentence per line.
    #[arg(long)]
    test: PathBuf,

    /// Evaluation threads.
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Print the log10 probability of every sentence, in corpus order.
    #[arg(long)]
    print_sentences: bool,
}

fn run(args: Args) -> Result<()> {
    let model = Model::load(&args.model)?;
    let corpus = Corpus::File(args.test.clone());

    if args.print_sentences {
        for line in corpus.load_lines()? {
            let (ids, _) = tokenize(model.vocab(), &line);
            if ids.is_empty() {
                continue;
            }
            let logp = model.sentence_logprob(&ids);
            println!("{:.6}\t{}", logp / std::f64::consts::LN_10, line.trim());
        }
    }

    let mut driver = Driver::new(model);
    driver.setup(TrainOptions {
        num_threads: args.threads,
        num_readers: 1,
        ..TrainOptions::default()
    })?;
    let stats = driver.evaluate(&corpus)?;
    println!(
        "words: {}  sentences: {}  oovs: {}  logp: {:.4}  entropy: {:.4}  ppl: {:.4}",
        stats.words(),
        stats.sentences(),
        stats.reader.oovs,
        stats.logp(),
        stats.entropy(),
        stats.perplexity()
    );
    Ok(())
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
