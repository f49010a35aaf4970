//! Vocabulary lookup.
//!
//! The training engine only needs three capabilities from a vocabulary:
//! word → id, id → word, and its size. `Vocab` is the in-memory
//! implementation used by the binaries and tests.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Integer word id.
pub type WordId = u32;

/// Sentence-end token; also fills the left context before the first word.
pub const SENT_END: &str = "</s>";
/// Out-of-vocabulary token.
pub const UNK: &str = "<unk>";

/// Id of [`SENT_END`].
pub const SENT_END_ID: WordId = 0;
/// Id of [`UNK`].
pub const UNK_ID: WordId = 1;

/// Word ↔ id mapping, immutable during training.
pub trait Vocabulary: Send + Sync {
    /// Id of `word`, if known.
    fn id_of(&self, word: &str) -> Option<WordId>;
    /// Word for `id`, if in range.
    fn word_of(&self, id: WordId) -> Option<&str>;
    /// Number of words including the reserved tokens.
    fn size(&self) -> usize;
}

/// In-memory vocabulary with `</s>` at id 0 and `<unk>` at id 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Vocab {
    words: Vec<String>,
    index: HashMap<String, WordId>,
}

impl Vocab {
    /// Vocabulary holding only the reserved tokens.
    pub fn new() -> Self {
        Self::from_words(std::iter::empty::<&str>())
    }

    /// Builds a vocabulary from `words`, keeping first occurrences in order.
    /// Reserved tokens in the input are ignored.
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut vocab = Self {
            words: Vec::new(),
            index: HashMap::new(),
        };
        vocab.insert(SENT_END);
        vocab.insert(UNK);
        for word in words {
            vocab.insert(word.as_ref());
        }
        vocab
    }

    fn insert(&mut self, word: &str) {
        if self.index.contains_key(word) {
            return;
        }
        let id = self.words.len() as WordId;
        self.words.push(word.to_string());
        self.index.insert(word.to_string(), id);
    }

    /// Id of `word`, mapping unknown words to `<unk>`. The flag is true for
    /// out-of-vocabulary words.
    pub fn lookup_or_unk(&self, word: &str) -> (WordId, bool) {
        match self.index.get(word) {
            Some(&id) => (id, false),
            None => (UNK_ID, true),
        }
    }

    /// All words in id order.
    pub fn words(&self) -> &[String] {
        &self.words
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<String>> for Vocab {
    fn from(words: Vec<String>) -> Self {
        Self::from_words(words)
    }
}

impl From<Vocab> for Vec<String> {
    fn from(vocab: Vocab) -> Self {
        vocab.words
    }
}

impl Vocabulary for Vocab {
    fn id_of(&self, word: &str) -> Option<WordId> {
        self.index.get(word).copied()
    }

    fn word_of(&self, id: WordId) -> Option<&str> {
        self.words.get(id as usize).map(String::as_str)
    }

    fn size(&self) -> usize {
        self.words.len()
    }
}

/// Loads a vocabulary file with one word per line (first column only).
pub fn load_vocab<P: AsRef<Path>>(path: P) -> Result<Vocab> {
    let contents = fs::read_to_string(path)?;
    let words = contents
        .lines()
        .filter_map(|line| line.split_whitespace().next());
    Ok(Vocab::from_words(words))
}
