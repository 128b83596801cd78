//! Scoring text against a loaded model.
//!
//! [`predict`] is pure: it only reads the model, so any number of sessions
//! may call it concurrently on the same [`crate::model::ModelHandle`].

pub mod tokenizer;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ServeError;
use crate::model::Model;

pub const DEFAULT_K: i32 = 1;
pub const DEFAULT_THRESHOLD: f32 = 0.0;

/// One unit of work as it arrives from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub text: String,
    pub k: Option<i32>,
    pub threshold: Option<f32>,
}

impl PredictionRequest {
    pub fn new(text: impl Into<String>, k: i32, threshold: f32) -> Self {
        Self {
            text: text.into(),
            k: Some(k),
            threshold: Some(threshold),
        }
    }

    pub fn k(&self) -> i32 {
        self.k.unwrap_or(DEFAULT_K)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold.unwrap_or(DEFAULT_THRESHOLD)
    }
}

/// Ranked labels with their probabilities; `labels[i]` pairs with `probs[i]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub labels: Vec<String>,
    pub probs: Vec<f32>,
}

impl PredictionResult {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn into_pair(self) -> (Vec<String>, Vec<f32>) {
        (self.labels, self.probs)
    }
}

/// Check `k` and `threshold` before any work is done.
pub fn validate(k: i32, threshold: f32) -> Result<(), ServeError> {
    if k <= 0 {
        return Err(ServeError::InvalidArgument(format!(
            "k must be positive, got {k}"
        )));
    }
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
        return Err(ServeError::InvalidArgument(format!(
            "threshold must be within [0, 1], got {threshold}"
        )));
    }
    Ok(())
}

/// Score `text` and return the top `k` labels with probability `>= threshold`.
///
/// Labels are ranked by descending probability; equal probabilities keep the
/// model's label order. Empty or whitespace-only text yields an empty result.
pub fn predict(
    model: &Model,
    text: &str,
    k: i32,
    threshold: f32,
) -> Result<PredictionResult, ServeError> {
    validate(k, threshold)?;
    if tokenizer::is_blank(text) {
        return Ok(PredictionResult::default());
    }

    let features = tokenizer::features(model, text);
    if features.is_empty() {
        return Ok(PredictionResult::default());
    }

    let hidden = average_rows(model, &features);
    let probs = softmax(model, &hidden);
    Ok(rank(model.labels(), &probs, k as usize, threshold))
}

/// [`predict`] over a batch, in input order.
///
/// Batches of more than one text are scored on the rayon pool.
pub fn predict_batch(
    model: &Model,
    texts: &[String],
    k: i32,
    threshold: f32,
) -> Result<Vec<PredictionResult>, ServeError> {
    validate(k, threshold)?;
    match texts.len() {
        0 => Ok(Vec::new()),
        1 => Ok(vec![predict(model, &texts[0], k, threshold)?]),
        _ => texts
            .par_iter()
            .map(|text| predict(model, text, k, threshold))
            .collect(),
    }
}

fn average_rows(model: &Model, rows: &[u32]) -> Vec<f32> {
    let mut hidden = vec![0.0f32; model.dim()];
    for &row in rows {
        for (h, w) in hidden.iter_mut().zip(model.input_row(row)) {
            *h += *w;
        }
    }
    let scale = 1.0 / rows.len() as f32;
    hidden.iter_mut().for_each(|h| *h *= scale);
    hidden
}

fn softmax(model: &Model, hidden: &[f32]) -> Vec<f32> {
    let mut scores: Vec<f32> = (0..model.labels().len())
        .map(|label| {
            model
                .output_row(label)
                .iter()
                .zip(hidden)
                .map(|(w, h)| w * h)
                .sum()
        })
        .collect();

    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut total = 0.0f32;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        total += *s;
    }
    scores.iter_mut().for_each(|s| *s /= total);
    scores
}

fn rank(labels: &[String], probs: &[f32], k: usize, threshold: f32) -> PredictionResult {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));

    let mut result = PredictionResult::default();
    for idx in order
        .into_iter()
        .filter(|&i| probs[i] >= threshold)
        .take(k)
    {
        result.labels.push(labels[idx].clone());
        result.probs.push(probs[idx]);
    }
    result
}
