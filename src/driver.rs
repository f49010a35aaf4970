//! Training and evaluation sessions.
//!
//! A [`Driver`] owns the model behind an `Arc` and runs the reader/updater
//! pipeline over it:
//!
//! ```text
//! Idle → Setup → Running → Draining → Stopped
//!          ↑                              │
//!          └──────────── setup ───────────┘
//! ```
//!
//! `setup` validates the options and builds one Shared Weight Updater per
//! distinct weight; nothing is spawned when it fails. `start` loads the
//! corpus and spawns the threads, `run_to_completion` waits for them and
//! merges their statistics, and `finish` hands the trained model back.

use crate::error::{LmError, Result};
use crate::model::Model;
use crate::reader::{spawn_readers, BatchPool, Corpus, ReaderOptions, ReaderStats, UpdaterEnd};
use crate::updater::{BpttStats, Updater, UpdaterOptions, UpdaterTable};
use crate::utils::lr_scheduler::{Constant, ExponentialDecay, Halving, LRScheduler, StepDecay};
use crate::weights::UpdateParams;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Setup,
    Running,
    Draining,
    Stopped,
}

/// Epoch-level learning rate schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerSpec {
    Constant,
    StepDecay { step_size: usize, gamma: f32 },
    Exponential { gamma: f32 },
    Halving { min_improvement: f64 },
}

impl SchedulerSpec {
    pub fn build(&self, initial_lr: f32) -> Box<dyn LRScheduler> {
        match *self {
            Self::Constant => Box::new(Constant::new(initial_lr)),
            Self::StepDecay { step_size, gamma } => {
                Box::new(StepDecay::new(initial_lr, step_size, gamma))
            }
            Self::Exponential { gamma } => Box::new(ExponentialDecay::new(initial_lr, gamma)),
            Self::Halving { min_improvement } => Box::new(Halving::new(initial_lr, min_improvement)),
        }
    }
}

/// Options of a training session.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOptions {
    /// Updater threads.
    pub num_threads: usize,
    /// Reader threads.
    pub num_readers: usize,
    /// Sentences per batch.
    pub batch_capacity: usize,
    /// Batches circulating between readers and updaters; 0 picks twice the
    /// thread count.
    pub num_slots: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub l2_penalty: f32,
    pub bptt: usize,
    pub bptt_block: usize,
    pub error_cutoff: f32,
    /// Tokens between flushes of a thread's staged deltas; 0 flushes only
    /// when the thread exits.
    pub flush_interval: usize,
    pub dirty_capacity: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub epochs: usize,
    pub scheduler: SchedulerSpec,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            num_threads: 1,
            num_readers: 1,
            batch_capacity: 32,
            num_slots: 0,
            learning_rate: 0.1,
            momentum: 0.0,
            l2_penalty: 0.0,
            bptt: 1,
            bptt_block: 1,
            error_cutoff: 50.0,
            flush_interval: 1,
            dirty_capacity: 4096,
            shuffle: false,
            seed: 1,
            epochs: 1,
            scheduler: SchedulerSpec::Constant,
        }
    }
}

impl TrainOptions {
    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(LmError::invalid_option("num_threads must be at least 1"));
        }
        if self.num_readers == 0 {
            return Err(LmError::invalid_option("num_readers must be at least 1"));
        }
        if self.batch_capacity == 0 {
            return Err(LmError::invalid_option("batch_capacity must be at least 1"));
        }
        if self.bptt == 0 {
            return Err(LmError::invalid_option("bptt must be at least 1"));
        }
        if self.bptt_block == 0 {
            return Err(LmError::invalid_option("bptt_block must be at least 1"));
        }
        if !(self.learning_rate >= 0.0 && self.learning_rate.is_finite()) {
            return Err(LmError::invalid_option("learning_rate must be non-negative"));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(LmError::invalid_option("momentum must be in [0, 1)"));
        }
        if self.l2_penalty < 0.0 {
            return Err(LmError::invalid_option("l2_penalty must be non-negative"));
        }
        if self.error_cutoff < 0.0 {
            return Err(LmError::invalid_option("error_cutoff must be non-negative"));
        }
        if self.dirty_capacity == 0 {
            return Err(LmError::invalid_option("dirty_capacity must be at least 1"));
        }
        Ok(())
    }

    pub fn update_params(&self) -> UpdateParams {
        UpdateParams {
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            l2_penalty: self.l2_penalty,
            flush_interval: self.flush_interval,
            dirty_capacity: self.dirty_capacity,
        }
    }

    pub fn updater_options(&self) -> UpdaterOptions {
        UpdaterOptions {
            bptt: self.bptt,
            bptt_block: self.bptt_block,
            error_cutoff: self.error_cutoff,
        }
    }

    fn slots(&self) -> usize {
        if self.num_slots == 0 {
            2 * self.num_threads.max(self.num_readers)
        } else {
            self.num_slots
        }
    }
}

/// Counters of one updater thread.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThreadStats {
    /// Words, not counting sentence ends.
    pub words: usize,
    pub sentences: usize,
    /// Natural-log probability of every token including sentence ends.
    pub logp: f64,
    pub bptt: BpttStats,
}

impl ThreadStats {
    pub fn merge(&mut self, other: &ThreadStats) {
        self.words += other.words;
        self.sentences += other.sentences;
        self.logp += other.logp;
        self.bptt.merge(&other.bptt);
    }

    fn tokens(&self) -> usize {
        self.words + self.sentences
    }

    /// Bits per token.
    pub fn entropy(&self) -> f64 {
        match self.tokens() {
            0 => 0.0,
            n => -self.logp / std::f64::consts::LN_2 / n as f64,
        }
    }

    pub fn perplexity(&self) -> f64 {
        match self.tokens() {
            0 => 1.0,
            n => (-self.logp / n as f64).exp(),
        }
    }
}

/// Merged statistics of one pass over a corpus.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochStats {
    pub totals: ThreadStats,
    /// Per updater thread, by thread id.
    pub threads: Vec<ThreadStats>,
    pub reader: ReaderStats,
    pub forced_flushes: usize,
    pub elapsed: Duration,
}

impl EpochStats {
    pub fn words(&self) -> usize {
        self.totals.words
    }

    pub fn sentences(&self) -> usize {
        self.totals.sentences
    }

    pub fn logp(&self) -> f64 {
        self.totals.logp
    }

    pub fn entropy(&self) -> f64 {
        self.totals.entropy()
    }

    pub fn perplexity(&self) -> f64 {
        self.totals.perplexity()
    }

    pub fn words_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.totals.words as f64 / secs
        } else {
            0.0
        }
    }
}

/// Cloneable handle that requests a cooperative stop of the running pass.
///
/// Readers stop before taking another empty batch and updaters stop after
/// returning their current batch; every staged delta is still flushed. A
/// stop requested before [`Driver::start`] is cleared by it.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
thread_local! {
    /// Sentence count after which the current updater thread panics.
    static PANIC_AFTER: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

/// Training/evaluation session over one model.
pub struct Driver {
    model: Arc<Model>,
    state: SessionState,
    options: TrainOptions,
    table: Option<Arc<UpdaterTable>>,
    training: bool,
    stop: Arc<AtomicBool>,
    readers: Vec<JoinHandle<ReaderStats>>,
    workers: Vec<JoinHandle<ThreadStats>>,
    started: Option<Instant>,
    #[cfg(test)]
    panic_after: Option<usize>,
}

impl Driver {
    pub fn new(model: Model) -> Self {
        Self {
            model: Arc::new(model),
            state: SessionState::Idle,
            options: TrainOptions::default(),
            table: None,
            training: false,
            stop: Arc::new(AtomicBool::new(false)),
            readers: Vec::new(),
            workers: Vec::new(),
            started: None,
            #[cfg(test)]
            panic_after: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn options(&self) -> &TrainOptions {
        &self.options
    }

    /// Shared Weight Updaters of the current setup.
    pub fn table(&self) -> Option<&Arc<UpdaterTable>> {
        self.table.as_ref()
    }

    fn expect_state(&self, allowed: &[SessionState], action: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LmError::session(format!(
                "cannot {} while {:?}",
                action, self.state
            )))
        }
    }

    /// Validates `options` and prepares the shared weight updaters.
    pub fn setup(&mut self, options: TrainOptions) -> Result<()> {
        self.expect_state(&[SessionState::Idle, SessionState::Setup, SessionState::Stopped], "set up")?;
        options.validate()?;
        let table = UpdaterTable::new(&self.model, options.update_params(), options.num_threads);
        info!(
            threads = options.num_threads,
            readers = options.num_readers,
            weights = table.len(),
            lr = options.learning_rate,
            bptt = options.bptt,
            bptt_block = options.bptt_block,
            "session set up"
        );
        self.table = Some(Arc::new(table));
        self.options = options;
        self.state = SessionState::Setup;
        Ok(())
    }

    /// Spawns the reader and updater threads for one training pass.
    pub fn start(&mut self, corpus: &Corpus) -> Result<()> {
        self.expect_state(&[SessionState::Setup], "start")?;
        let table = self.table.clone();
        self.launch(corpus, table)?;
        self.training = true;
        Ok(())
    }

    fn launch(&mut self, corpus: &Corpus, table: Option<Arc<UpdaterTable>>) -> Result<()> {
        let lines = Arc::new(corpus.load_lines()?);
        let opts = self.options.clone();
        self.stop.store(false, Ordering::SeqCst);

        let pool = BatchPool::new(opts.slots(), opts.batch_capacity);
        let reader_opts = ReaderOptions {
            num_readers: opts.num_readers,
            shuffle: opts.shuffle,
            seed: opts.seed,
        };
        self.readers = spawn_readers(
            lines,
            Arc::clone(self.model.vocab()),
            &pool,
            reader_opts,
            Arc::clone(&self.stop),
        )?;

        for tid in 0..opts.num_threads {
            let model = Arc::clone(&self.model);
            let table = table.clone();
            let end = pool.updater_end();
            let stop = Arc::clone(&self.stop);
            let updater_opts = opts.updater_options();
            #[cfg(test)]
            let panic_after = self.panic_after.filter(|_| tid == 0);
            let spawned = thread::Builder::new()
                .name(format!("updater-{}", tid))
                .spawn(move || {
                    #[cfg(test)]
                    PANIC_AFTER.with(|p| p.set(panic_after));
                    run_updater(&model, table.as_deref(), tid, updater_opts, end, &stop)
                });
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(err) => {
                    drop(pool);
                    self.abort();
                    return Err(err.into());
                }
            }
        }
        drop(pool);

        self.started = Some(Instant::now());
        self.state = SessionState::Running;
        debug!(slots = opts.slots(), "pipeline running");
        Ok(())
    }

    /// Sets the stop flag; threads exit at their next batch boundary.
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Handle for stopping the pass from another thread while
    /// [`Driver::run_to_completion`] is waiting.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    fn abort(&mut self) {
        self.stop();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
        if let Some(table) = &self.table {
            table.flush_all();
        }
        self.state = SessionState::Stopped;
    }

    /// Waits for every thread and merges their statistics.
    pub fn run_to_completion(&mut self) -> Result<EpochStats> {
        self.expect_state(&[SessionState::Running], "run")?;
        self.state = SessionState::Draining;

        let mut failed: Option<String> = None;
        let mut threads = Vec::with_capacity(self.workers.len());
        for (tid, handle) in self.workers.drain(..).enumerate() {
            match handle.join() {
                Ok(stats) => threads.push(stats),
                Err(_) => {
                    self.stop.store(true, Ordering::SeqCst);
                    failed.get_or_insert_with(|| format!("updater-{}", tid));
                    threads.push(ThreadStats::default());
                }
            }
        }
        let mut reader = ReaderStats::default();
        for (rid, handle) in self.readers.drain(..).enumerate() {
            match handle.join() {
                Ok(stats) => reader.merge(&stats),
                Err(_) => {
                    failed.get_or_insert_with(|| format!("reader-{}", rid));
                }
            }
        }

        let mut forced_flushes = 0;
        if let Some(table) = self.table.as_ref().filter(|_| self.training) {
            table.flush_all();
            forced_flushes = table.forced_flushes();
        }
        self.state = SessionState::Stopped;
        self.training = false;
        if let Some(name) = failed {
            return Err(LmError::WorkerPanic(name));
        }

        let mut totals = ThreadStats::default();
        for stats in &threads {
            totals.merge(stats);
        }
        let stats = EpochStats {
            totals,
            threads,
            reader,
            forced_flushes,
            elapsed: self.started.take().map(|t| t.elapsed()).unwrap_or_default(),
        };
        for (tid, t) in stats.threads.iter().enumerate() {
            debug!(
                tid,
                words = t.words,
                sentences = t.sentences,
                logp = t.logp,
                entropy = t.entropy(),
                "thread finished"
            );
        }
        info!(
            words = stats.words(),
            sentences = stats.sentences(),
            oovs = stats.reader.oovs,
            logp = stats.logp(),
            entropy = stats.entropy(),
            ppl = stats.perplexity(),
            words_per_sec = stats.words_per_sec() as u64,
            "pass finished"
        );
        self.model.check_finite();
        Ok(stats)
    }

    /// Computes log-probabilities over `corpus` without training.
    pub fn evaluate(&mut self, corpus: &Corpus) -> Result<EpochStats> {
        self.expect_state(
            &[SessionState::Idle, SessionState::Setup, SessionState::Stopped],
            "evaluate",
        )?;
        let resume = self.state;
        self.options.validate()?;
        self.launch(corpus, None)?;
        self.training = false;
        let stats = self.run_to_completion()?;
        if resume == SessionState::Idle {
            self.state = SessionState::Idle;
        }
        Ok(stats)
    }

    /// Trains for `options.epochs` epochs, adjusting the learning rate
    /// with the configured schedule. With a validation corpus each epoch is
    /// followed by an evaluation whose entropy drives the schedule.
    pub fn train(&mut self, train: &Corpus, valid: Option<&Corpus>, options: TrainOptions) -> Result<Vec<EpochStats>> {
        options.validate()?;
        let mut scheduler = options.scheduler.build(options.learning_rate);
        let mut history = Vec::with_capacity(options.epochs);

        for epoch in 0..options.epochs {
            let mut epoch_opts = options.clone();
            epoch_opts.learning_rate = scheduler.get_lr();
            epoch_opts.seed = options.seed.wrapping_add(epoch as u64);
            info!(epoch, lr = epoch_opts.learning_rate, "epoch started");

            self.setup(epoch_opts)?;
            self.start(train)?;
            history.push(self.run_to_completion()?);
            scheduler.step();

            if let Some(valid) = valid {
                let stats = self.evaluate(valid)?;
                info!(epoch, entropy = stats.entropy(), ppl = stats.perplexity(), "validation");
                if !scheduler.observe_validation(stats.entropy()) {
                    info!(epoch, "validation stopped improving, training finished");
                    break;
                }
            }
        }
        Ok(history)
    }

    /// Ends the session and returns the trained model.
    pub fn finish(self) -> Result<Model> {
        self.expect_state(
            &[SessionState::Idle, SessionState::Setup, SessionState::Stopped],
            "finish",
        )?;
        let model = Arc::clone(&self.model);
        drop(self);
        Arc::try_unwrap(model).map_err(|_| LmError::session("model is still shared"))
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if !self.workers.is_empty() || !self.readers.is_empty() {
            self.abort();
        }
    }
}

fn run_updater(
    model: &Model,
    table: Option<&UpdaterTable>,
    tid: usize,
    opts: UpdaterOptions,
    end: UpdaterEnd,
    stop: &AtomicBool,
) -> ThreadStats {
    let mut updater = Updater::new(model, table, tid, opts);
    let mut stats = ThreadStats::default();

    while let Ok(mut batch) = end.full.recv() {
        for sentence in batch.sentences() {
            let logp: f64 = updater.process_sentence(sentence).iter().sum();
            stats.logp += logp;
            stats.words += sentence.len();
            stats.sentences += 1;
            #[cfg(test)]
            if PANIC_AFTER.with(|p| p.get()) == Some(stats.sentences) {
                panic!("updater-{} failed after {} sentences", tid, stats.sentences);
            }
        }
        batch.clear();
        let _ = end.empty.send(batch);
        if stop.load(Ordering::Relaxed) {
            break;
        }
    }

    updater.flush();
    stats.bptt = updater.bptt_stats();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::GlueSpec;
    use crate::glues::GlueKind;
    use crate::layers::{Combine, LayerKind};
    use crate::utils::SimpleRng;
    use crate::vocab::Vocab;

    fn model() -> Model {
        let mut model = Model::new(Vocab::from_words(["a", "b", "c"]), None).unwrap();
        let comp = model
            .component_builder("ff")
            .add_layer("hidden", 4, LayerKind::Sigmoid, Combine::Sum)
            .add_glue(GlueSpec::new("emb", GlueKind::Embedding, "input", "hidden"))
            .add_glue(GlueSpec::new("out", GlueKind::Output, "hidden", "output"))
            .build(&mut SimpleRng::new(3))
            .unwrap();
        model.add_component(comp).unwrap();
        model
    }

    #[test]
    fn test_validation_rejects_bad_options() {
        let base = TrainOptions::default();
        assert!(base.validate().is_ok());
        for bad in [
            TrainOptions { bptt: 0, ..base.clone() },
            TrainOptions { num_threads: 0, ..base.clone() },
            TrainOptions { batch_capacity: 0, ..base.clone() },
            TrainOptions { momentum: 1.0, ..base.clone() },
            TrainOptions { learning_rate: -0.1, ..base.clone() },
            TrainOptions { error_cutoff: -1.0, ..base.clone() },
        ] {
            assert!(bad.validate().unwrap_err().is_structural());
        }
    }

    #[test]
    fn test_state_machine() {
        let mut driver = Driver::new(model());
        assert_eq!(driver.state(), SessionState::Idle);
        assert!(driver.start(&Corpus::from_lines(["a b"])).is_err());
        assert!(driver.run_to_completion().is_err());

        let failed = driver.setup(TrainOptions { bptt: 0, ..TrainOptions::default() });
        assert!(failed.is_err());
        assert_eq!(driver.state(), SessionState::Idle);

        driver.setup(TrainOptions::default()).unwrap();
        assert_eq!(driver.state(), SessionState::Setup);
        driver.start(&Corpus::from_lines(["a b", "c"])).unwrap();
        assert_eq!(driver.state(), SessionState::Running);
        assert!(driver.setup(TrainOptions::default()).is_err());
        let stats = driver.run_to_completion().unwrap();
        assert_eq!(driver.state(), SessionState::Stopped);
        assert_eq!((stats.sentences(), stats.words()), (2, 3));

        let model = driver.finish().unwrap();
        assert!(model.check_finite());
    }

    #[test]
    fn test_evaluate_matches_model_forward() {
        let model = model();
        let expected = model.sentence_logprob(&[2, 3]) + model.sentence_logprob(&[4]);
        let mut driver = Driver::new(model);
        let stats = driver.evaluate(&Corpus::from_lines(["a b", "c"])).unwrap();
        assert_eq!(driver.state(), SessionState::Idle);
        approx::assert_relative_eq!(stats.logp(), expected, epsilon = 1e-9);
        assert_eq!(stats.forced_flushes, 0);
    }

    #[test]
    fn test_worker_panic_flushes_before_reporting() {
        let model = model();
        let before: Vec<_> = model.weights().iter().map(|w| w.snapshot()).collect();
        let mut driver = Driver::new(model);
        driver.panic_after = Some(1);
        driver
            .setup(TrainOptions {
                batch_capacity: 1,
                num_slots: 2,
                // staged deltas only reach the weights through the final flush
                flush_interval: 0,
                ..TrainOptions::default()
            })
            .unwrap();
        let lines: Vec<String> = (0..40).map(|_| "a b c".to_string()).collect();
        driver.start(&Corpus::Lines(lines)).unwrap();

        let err = driver.run_to_completion().unwrap_err();
        assert!(matches!(&err, LmError::WorkerPanic(name) if name == "updater-0"), "{}", err);
        assert_eq!(driver.state(), SessionState::Stopped);
        let table = driver.table().unwrap();
        for updater in table.updaters() {
            assert_eq!(updater.dirty_len(0), 0);
        }

        let model = driver.finish().unwrap();
        let after: Vec<_> = model.weights().iter().map(|w| w.snapshot()).collect();
        assert_ne!(before, after);
    }

    #[test]
    fn test_stop_handle_is_shared() {
        let driver = Driver::new(model());
        let handle = driver.stop_handle();
        assert!(!handle.is_stopped());
        driver.stop();
        assert!(handle.clone().is_stopped());
    }

    #[test]
    fn test_entropy_and_perplexity() {
        let stats = ThreadStats {
            words: 3,
            sentences: 1,
            logp: 4.0 * (0.25f64).ln(),
            bptt: BpttStats::default(),
        };
        approx::assert_relative_eq!(stats.entropy(), 2.0, epsilon = 1e-12);
        approx::assert_relative_eq!(stats.perplexity(), 4.0, epsilon = 1e-12);
    }
}
