//! Reader side of the training pipeline.
//!
//! Reader threads tokenize sentences into [`ExampleBatch`]es and hand them
//! to updater threads through a [`BatchPool`]: two bounded channels, one
//! holding empty batches ready to be filled and one holding full batches
//! ready to be trained on. A fixed number of batches circulates between
//! them, so memory stays bounded whatever the thread counts.

use crate::error::Result;
use crate::utils::SimpleRng;
use crate::vocab::{Vocab, WordId, SENT_END};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Sentence-start marker some corpora carry; dropped while tokenizing.
const SENT_START: &str = "<s>";

/// Source of sentences, one per line.
#[derive(Debug, Clone)]
pub enum Corpus {
    Lines(Vec<String>),
    File(PathBuf),
}

impl Corpus {
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Lines(lines.into_iter().map(Into::into).collect())
    }

    /// Reads every line.
    pub fn load_lines(&self) -> Result<Vec<String>> {
        match self {
            Self::Lines(lines) => Ok(lines.clone()),
            Self::File(path) => {
                let reader = BufReader::new(File::open(path)?);
                Ok(reader.lines().collect::<std::io::Result<Vec<_>>>()?)
            }
        }
    }
}

/// A bounded unit of tokenized sentences.
#[derive(Debug, Clone)]
pub struct ExampleBatch {
    sentences: Vec<Vec<WordId>>,
    capacity: usize,
}

impl ExampleBatch {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            sentences: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sentence: Vec<WordId>) {
        debug_assert!(!self.is_full(), "batch already holds {} sentences", self.capacity);
        self.sentences.push(sentence);
    }

    pub fn is_full(&self) -> bool {
        self.sentences.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Words held, not counting sentence ends.
    pub fn num_words(&self) -> usize {
        self.sentences.iter().map(Vec::len).sum()
    }

    pub fn sentences(&self) -> &[Vec<WordId>] {
        &self.sentences
    }

    pub fn clear(&mut self) {
        self.sentences.clear();
    }
}

/// Empty and full batch queues, pre-filled with `num_slots` empty batches.
///
/// Thread ends are handed out with [`BatchPool::reader_end`] and
/// [`BatchPool::updater_end`]; the pool itself must be dropped once every
/// thread holds its ends so that the queues disconnect when threads exit.
pub struct BatchPool {
    empty_tx: Sender<ExampleBatch>,
    empty_rx: Receiver<ExampleBatch>,
    full_tx: Sender<ExampleBatch>,
    full_rx: Receiver<ExampleBatch>,
    num_slots: usize,
}

/// Channels used by a reader thread.
#[derive(Clone)]
pub struct ReaderEnd {
    pub empty: Receiver<ExampleBatch>,
    pub full: Sender<ExampleBatch>,
}

/// Channels used by an updater thread.
#[derive(Clone)]
pub struct UpdaterEnd {
    pub full: Receiver<ExampleBatch>,
    pub empty: Sender<ExampleBatch>,
}

impl BatchPool {
    pub fn new(num_slots: usize, capacity: usize) -> Self {
        let num_slots = num_slots.max(1);
        let (empty_tx, empty_rx) = bounded(num_slots);
        let (full_tx, full_rx) = bounded(num_slots);
        for _ in 0..num_slots {
            // cannot fail: capacity equals the number of batches and the receiver is alive
            let _ = empty_tx.send(ExampleBatch::new(capacity));
        }
        Self {
            empty_tx,
            empty_rx,
            full_tx,
            full_rx,
            num_slots,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn reader_end(&self) -> ReaderEnd {
        ReaderEnd {
            empty: self.empty_rx.clone(),
            full: self.full_tx.clone(),
        }
    }

    pub fn updater_end(&self) -> UpdaterEnd {
        UpdaterEnd {
            full: self.full_rx.clone(),
            empty: self.empty_tx.clone(),
        }
    }

    /// Batches currently waiting in the empty and full queues.
    pub fn queued(&self) -> (usize, usize) {
        (self.empty_rx.len(), self.full_rx.len())
    }
}

/// Per-reader counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub sentences: usize,
    pub words: usize,
    pub oovs: usize,
    pub empty_skipped: usize,
}

impl ReaderStats {
    pub fn merge(&mut self, other: &ReaderStats) {
        self.sentences += other.sentences;
        self.words += other.words;
        self.oovs += other.oovs;
        self.empty_skipped += other.empty_skipped;
    }
}

/// Maps `line` to word ids, replacing unknown words by `<unk>`. Returns the
/// ids and the number of unknown words.
pub fn tokenize(vocab: &Vocab, line: &str) -> (Vec<WordId>, usize) {
    let mut oovs = 0;
    let ids = line
        .split_whitespace()
        .filter(|w| *w != SENT_START && *w != SENT_END)
        .map(|w| {
            let (id, oov) = vocab.lookup_or_unk(w);
            oovs += oov as usize;
            id
        })
        .collect();
    (ids, oovs)
}

/// Options shared by all reader threads of a session.
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    pub num_readers: usize,
    pub shuffle: bool,
    pub seed: u64,
}

/// Starts `opts.num_readers` reader threads over contiguous partitions of
/// `lines`.
pub fn spawn_readers(
    lines: Arc<Vec<String>>,
    vocab: Arc<Vocab>,
    pool: &BatchPool,
    opts: ReaderOptions,
    stop: Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<ReaderStats>>> {
    let num_readers = opts.num_readers.max(1);
    let total = lines.len();
    (0..num_readers)
        .map(|rid| {
            let lines = Arc::clone(&lines);
            let vocab = Arc::clone(&vocab);
            let stop = Arc::clone(&stop);
            let end = pool.reader_end();
            let range = (rid * total / num_readers)..((rid + 1) * total / num_readers);
            let handle = thread::Builder::new()
                .name(format!("reader-{}", rid))
                .spawn(move || {
                    let mut order: Vec<usize> = range.collect();
                    if opts.shuffle {
                        SimpleRng::for_thread(opts.seed, rid).shuffle(&mut order);
                    }
                    run_reader(rid, &lines, &order, &vocab, end, &stop)
                })?;
            Ok(handle)
        })
        .collect()
}

fn run_reader(
    rid: usize,
    lines: &[String],
    order: &[usize],
    vocab: &Vocab,
    end: ReaderEnd,
    stop: &AtomicBool,
) -> ReaderStats {
    let mut stats = ReaderStats::default();
    let mut batch: Option<ExampleBatch> = None;

    for &i in order {
        let (ids, oovs) = tokenize(vocab, &lines[i]);
        if ids.is_empty() {
            stats.empty_skipped += 1;
            continue;
        }

        if batch.is_none() {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match end.empty.recv() {
                Ok(empty) => batch = Some(empty),
                Err(_) => break,
            }
        }
        let Some(current) = batch.as_mut() else {
            break;
        };
        stats.sentences += 1;
        stats.words += ids.len();
        stats.oovs += oovs;
        current.push(ids);

        if current.is_full() {
            if let Some(full) = batch.take() {
                if end.full.send(full).is_err() {
                    break;
                }
            }
        }
    }

    if let Some(partial) = batch.take() {
        if !partial.is_empty() {
            let _ = end.full.send(partial);
        }
    }
    debug!(
        reader = rid,
        sentences = stats.sentences,
        words = stats.words,
        oovs = stats.oovs,
        "reader finished"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Arc<Vocab> {
        Arc::new(Vocab::from_words(["the", "cat", "sat"]))
    }

    #[test]
    fn test_tokenize_counts_unknown_words() {
        let vocab = vocab();
        let (ids, oovs) = tokenize(&vocab, "<s> the dog sat </s>");
        assert_eq!(ids, vec![2, 1, 4]);
        assert_eq!(oovs, 1);
        assert_eq!(tokenize(&vocab, "   ").0, Vec::<WordId>::new());
    }

    #[test]
    fn test_batch_capacity() {
        let mut batch = ExampleBatch::new(2);
        batch.push(vec![2, 3]);
        assert!(!batch.is_full());
        batch.push(vec![4]);
        assert!(batch.is_full());
        assert_eq!(batch.num_words(), 3);
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.capacity(), 2);
    }

    #[test]
    fn test_pool_is_prefilled() {
        let pool = BatchPool::new(3, 4);
        assert_eq!(pool.queued(), (3, 0));
        let end = pool.reader_end();
        let batch = end.empty.recv().unwrap();
        assert_eq!(batch.capacity(), 4);
        end.full.send(batch).unwrap();
        assert_eq!(pool.queued(), (2, 1));
    }

    #[test]
    fn test_readers_deliver_every_sentence() {
        let lines: Vec<String> = ["the cat", "", "cat sat", "the dog", "sat", "the the the"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let pool = BatchPool::new(2, 2);
        let updater = pool.updater_end();
        let stop = Arc::new(AtomicBool::new(false));
        let opts = ReaderOptions {
            num_readers: 2,
            shuffle: true,
            seed: 7,
        };
        let handles = spawn_readers(Arc::new(lines), vocab(), &pool, opts, stop).unwrap();
        drop(pool);

        let mut sentences = 0;
        let mut words = 0;
        while let Ok(mut batch) = updater.full.recv() {
            sentences += batch.len();
            words += batch.num_words();
            batch.clear();
            let _ = updater.empty.send(batch);
        }

        let mut stats = ReaderStats::default();
        for handle in handles {
            stats.merge(&handle.join().unwrap());
        }
        assert_eq!(stats.sentences, 5);
        assert_eq!(stats.empty_skipped, 1);
        assert_eq!(stats.oovs, 1);
        assert_eq!(stats.words, 11);
        assert_eq!((sentences, words), (5, 11));
    }

    #[test]
    fn test_stop_flag_ends_readers() {
        let lines: Vec<String> = (0..100).map(|_| "the cat sat".to_string()).collect();
        let pool = BatchPool::new(1, 1);
        let stop = Arc::new(AtomicBool::new(true));
        let opts = ReaderOptions {
            num_readers: 1,
            shuffle: false,
            seed: 1,
        };
        let handles = spawn_readers(Arc::new(lines), vocab(), &pool, opts, stop).unwrap();
        drop(pool);
        let stats = handles.into_iter().next().unwrap().join().unwrap();
        assert_eq!(stats.sentences, 0);
    }

    #[test]
    fn test_file_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.txt");
        std::fs::write(&path, "the cat\nsat\n").unwrap();
        let lines = Corpus::File(path).load_lines().unwrap();
        assert_eq!(lines, vec!["the cat", "sat"]);
        assert!(Corpus::File(dir.path().join("none")).load_lines().is_err());
    }
}
