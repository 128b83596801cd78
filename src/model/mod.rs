//! Loaded text-classification models.
//!
//! - **[`format`]**: on-disk container (magic, version, CRC32, MessagePack body).
//! - **[`store`]**: process-wide registry handing out reference-counted handles.
//!
//! A [`Model`] follows the fastText supervised layout: an input matrix with
//! one row per vocabulary word followed by `buckets` hashed n-gram rows, and
//! an output matrix with one row per label. It is never mutated once built.

pub mod format;
pub mod store;

use std::collections::HashSet;
use std::sync::Arc;

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::daemon::protocol::ModelInfo;

pub use store::{ModelHandle, ModelStore};

/// Prefix fastText puts in front of every label.
pub const LABEL_PREFIX: &str = "__label__";

/// End-of-sentence token appended to every input line.
pub const EOS: &str = "</s>";

/// Serialized body of a model file.
///
/// Matrices are stored row-major: `input` has `(words.len() + buckets) * dim`
/// values, `output` has `labels.len() * dim`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParts {
    pub labels: Vec<String>,
    pub dim: u32,
    pub words: Vec<String>,
    /// Hashed rows shared by character and word n-grams (0 = none).
    pub buckets: u32,
    /// Character n-gram lengths; `maxn == 0` disables subwords.
    pub minn: u32,
    pub maxn: u32,
    /// Longest word n-gram; 1 means unigrams only.
    pub word_ngrams: u32,
    pub input: Vec<f32>,
    pub output: Vec<f32>,
}

/// Immutable in-memory classifier.
#[derive(Debug)]
pub struct Model {
    name: String,
    labels: Vec<String>,
    dim: usize,
    words: FxHashMap<String, u32>,
    buckets: u32,
    minn: usize,
    maxn: usize,
    word_ngrams: usize,
    input: Vec<f32>,
    output: Vec<f32>,
}

impl Model {
    /// Validate `parts` and build a model named `name`.
    ///
    /// The error string describes the first inconsistency found.
    pub fn from_parts(name: impl Into<String>, parts: ModelParts) -> Result<Self, String> {
        let ModelParts {
            labels,
            dim,
            words,
            buckets,
            minn,
            maxn,
            word_ngrams,
            input,
            output,
        } = parts;

        if labels.is_empty() {
            return Err("label vocabulary is empty".to_string());
        }
        if dim == 0 {
            return Err("dimension must be positive".to_string());
        }
        if word_ngrams == 0 {
            return Err("word_ngrams must be at least 1".to_string());
        }
        if minn > maxn {
            return Err(format!("minn {minn} exceeds maxn {maxn}"));
        }
        if maxn > 0 && minn == 0 {
            return Err("minn must be positive when subwords are enabled".to_string());
        }
        if (maxn > 0 || word_ngrams > 1) && buckets == 0 {
            return Err("n-gram features require at least one bucket".to_string());
        }

        let labels: Vec<String> = labels
            .into_iter()
            .map(|l| l.strip_prefix(LABEL_PREFIX).unwrap_or(&l).to_string())
            .collect();
        let mut seen = HashSet::with_capacity(labels.len());
        for label in &labels {
            if !seen.insert(label.as_str()) {
                return Err(format!("duplicate label {label:?}"));
            }
        }

        let dim = dim as usize;
        // Rows are addressed as u32, so words plus buckets must fit in one.
        let rows = u32::try_from(words.len())
            .ok()
            .and_then(|w| w.checked_add(buckets))
            .ok_or_else(|| "shape overflows: too many input rows".to_string())?
            as usize;
        let input_len = rows
            .checked_mul(dim)
            .ok_or_else(|| "shape overflows: input matrix".to_string())?;
        let output_len = labels
            .len()
            .checked_mul(dim)
            .ok_or_else(|| "shape overflows: output matrix".to_string())?;
        if input.len() != input_len {
            return Err(format!(
                "input matrix has {} values, expected {} x {}",
                input.len(),
                rows,
                dim
            ));
        }
        if output.len() != output_len {
            return Err(format!(
                "output matrix has {} values, expected {} x {}",
                output.len(),
                labels.len(),
                dim
            ));
        }
        if input.iter().chain(output.iter()).any(|w| !w.is_finite()) {
            return Err("weights contain non-finite values".to_string());
        }

        let mut vocab = FxHashMap::default();
        for (row, word) in words.into_iter().enumerate() {
            if vocab.insert(word.clone(), row as u32).is_some() {
                return Err(format!("duplicate vocabulary word {word:?}"));
            }
        }

        Ok(Self {
            name: name.into(),
            labels,
            dim,
            words: vocab,
            buckets,
            minn: minn as usize,
            maxn: maxn as usize,
            word_ngrams: word_ngrams as usize,
            input,
            output,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Labels in vocabulary order, prefix stripped.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nwords(&self) -> usize {
        self.words.len()
    }

    pub fn buckets(&self) -> u32 {
        self.buckets
    }

    pub fn char_ngram_range(&self) -> Option<(usize, usize)> {
        (self.maxn > 0).then_some((self.minn, self.maxn))
    }

    pub fn word_ngrams(&self) -> usize {
        self.word_ngrams
    }

    /// Input row of an in-vocabulary word.
    pub fn word_id(&self, word: &str) -> Option<u32> {
        self.words.get(word).copied()
    }

    /// Input row for a hashed n-gram.
    #[inline]
    pub fn bucket_row(&self, hash: u64) -> u32 {
        debug_assert!(self.buckets > 0);
        (self.words.len() as u64 + hash % u64::from(self.buckets)) as u32
    }

    #[inline]
    pub(crate) fn input_row(&self, row: u32) -> &[f32] {
        let start = row as usize * self.dim;
        &self.input[start..start + self.dim]
    }

    #[inline]
    pub(crate) fn output_row(&self, label: usize) -> &[f32] {
        let start = label * self.dim;
        &self.output[start..start + self.dim]
    }

    /// Approximate resident size of the weight matrices.
    pub fn memory_bytes(&self) -> u64 {
        ((self.input.len() + self.output.len()) * std::mem::size_of::<f32>()) as u64
    }

    /// Summary for status responses.
    pub fn info(self: &Arc<Self>) -> ModelInfo {
        ModelInfo {
            name: self.name.clone(),
            labels: self.labels.clone(),
            dim: self.dim,
            vocabulary: self.words.len(),
            buckets: self.buckets,
            memory_bytes: self.memory_bytes(),
            // The store's own reference is not an outstanding handle.
            handles: Arc::strong_count(self).saturating_sub(1),
        }
    }
}
