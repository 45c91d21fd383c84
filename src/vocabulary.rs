//! Word-level vocabulary with four reserved control tokens.
//!
//! Ids are dense: `0..len()`. The reserved tokens always occupy ids 0 to 3,
//! followed by the corpus words in first-seen order.
//!
//! ```text
//! <START> i love pizza <END> <PAD> <PAD>  ->  1 243 5343 645 2 0 0
//! ```

use crate::error::{CaptionError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path, sync::LazyLock};
use tracing::{debug, info};

pub const PAD: usize = 0;
pub const START: usize = 1;
pub const END: usize = 2;
pub const UNK: usize = 3;

pub const PAD_TOKEN: &str = "<PAD>";
pub const START_TOKEN: &str = "<START>";
pub const END_TOKEN: &str = "<END>";
pub const UNK_TOKEN: &str = "<UNK>";

const RESERVED: [&str; 4] = [PAD_TOKEN, START_TOKEN, END_TOKEN, UNK_TOKEN];

static WORD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+|\.|,").expect("static word pattern"));

/// Splits a caption into lowercase words, keeping `.` and `,` as tokens.
/// Any other character is dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    WORD_PATTERN
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// How a word sequence is wrapped when translated to ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Translation {
    /// `<START> words <END>`
    Complete,
    /// `<START> words`, used where the decoder supplies its own end.
    Incomplete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    id_to_word: Vec<String>,
    #[serde(skip)]
    word_to_id: HashMap<String, usize>,
}

impl Vocabulary {
    /// Builds a vocabulary from raw captions.
    pub fn build<I, S>(corpus: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_words(corpus.into_iter().flat_map(|caption| tokenize(caption.as_ref())))
    }

    /// Builds a vocabulary from already tokenized words. Words are lowercased,
    /// duplicates keep their first id.
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut vocabulary = Self::reserved_only();
        for word in words {
            let word = word.as_ref().to_lowercase();
            if vocabulary.word_to_id.contains_key(&word) {
                continue;
            }
            vocabulary.word_to_id.insert(word.clone(), vocabulary.id_to_word.len());
            vocabulary.id_to_word.push(word);
        }
        debug!(size = vocabulary.len(), "vocabulary built");
        vocabulary
    }

    fn reserved_only() -> Self {
        let id_to_word: Vec<String> = RESERVED.iter().map(|t| t.to_string()).collect();
        let word_to_id = Self::index(&id_to_word);
        Self {
            id_to_word,
            word_to_id,
        }
    }

    fn index(id_to_word: &[String]) -> HashMap<String, usize> {
        id_to_word
            .iter()
            .enumerate()
            .map(|(id, word)| (word.clone(), id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.id_to_word.len()
    }

    /// Never true for a built vocabulary; the reserved tokens are always there.
    pub fn is_empty(&self) -> bool {
        self.id_to_word.is_empty()
    }

    /// Case-insensitive lookup of a caption word. Reserved tokens are never
    /// returned, so `<PAD>` or `<END>` inside a caption map to `None`.
    pub fn id_of(&self, word: &str) -> Option<usize> {
        self.word_to_id
            .get(&word.to_lowercase())
            .copied()
            .filter(|&id| id > UNK)
    }

    pub fn word_of(&self, id: usize) -> Option<&str> {
        self.id_to_word.get(id).map(String::as_str)
    }

    pub fn translate<S: AsRef<str>>(&self, words: &[S], mode: Translation) -> Vec<usize> {
        let extra = match mode {
            Translation::Complete => 2,
            Translation::Incomplete => 1,
        };
        let mut ids = Vec::with_capacity(words.len() + extra);
        ids.push(START);
        ids.extend(
            words
                .iter()
                .map(|word| self.id_of(word.as_ref()).unwrap_or(UNK)),
        );
        if mode == Translation::Complete {
            ids.push(END);
        }
        ids
    }

    pub fn reverse_translate(&self, ids: &[usize]) -> Result<Vec<String>> {
        ids.iter()
            .map(|&id| {
                self.word_of(id)
                    .map(str::to_string)
                    .ok_or(CaptionError::TokenOutOfRange {
                        id,
                        len: self.len(),
                    })
            })
            .collect()
    }

    /// Reverse translation that drops the control tokens and joins the words.
    pub fn to_sentence(&self, ids: &[usize]) -> Result<String> {
        let words = ids
            .iter()
            .filter(|&&id| id != PAD && id != START && id != END)
            .map(|&id| {
                self.word_of(id).ok_or(CaptionError::TokenOutOfRange {
                    id,
                    len: self.len(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(words.join(" "))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| CaptionError::io(path, e))?;
        info!(?path, size = self.len(), "vocabulary saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| CaptionError::io(path, e))?;
        let mut vocabulary: Self = serde_json::from_str(&json)?;

        let reserved_ok = vocabulary.id_to_word.len() >= RESERVED.len()
            && RESERVED
                .iter()
                .zip(&vocabulary.id_to_word)
                .all(|(expected, found)| expected == found);
        if !reserved_ok {
            return Err(CaptionError::Config(format!(
                "{} does not start with the reserved tokens",
                path.display()
            )));
        }

        vocabulary.word_to_id = Self::index(&vocabulary.id_to_word);
        if vocabulary.word_to_id.len() != vocabulary.id_to_word.len() {
            return Err(CaptionError::Config(format!(
                "{} contains duplicate words",
                path.display()
            )));
        }
        Ok(vocabulary)
    }
}
