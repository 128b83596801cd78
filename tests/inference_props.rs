//! Property tests for ranking and batching.

mod util;

use fasttext_serving::inference::{predict, predict_batch};
use proptest::prelude::*;
use util::hashed_model;

fn text() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            (0..120u32).prop_map(|i| format!("w{i}")),
            "[a-z]{1,8}",
            Just("hello".to_string()),
        ],
        0..10,
    )
    .prop_map(|words| words.join(" "))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn results_respect_k_and_threshold(
        seed in 0..4u64,
        text in text(),
        k in 1..8i32,
        threshold in 0.0f32..0.6,
    ) {
        let model = hashed_model(seed);
        let result = predict(&model, &text, k, threshold).unwrap();

        prop_assert!(result.labels.len() <= k as usize);
        prop_assert_eq!(result.labels.len(), result.probs.len());
        for p in &result.probs {
            prop_assert!((0.0..=1.0).contains(p));
            prop_assert!(*p >= threshold);
        }
        for pair in result.probs.windows(2) {
            prop_assert!(pair[0] >= pair[1]);
        }
    }

    #[test]
    fn full_ranking_sums_to_one(seed in 0..4u64, text in text()) {
        prop_assume!(!text.trim().is_empty());
        let model = hashed_model(seed);
        let k = model.labels().len() as i32;
        let result = predict(&model, &text, k, 0.0).unwrap();

        prop_assert_eq!(result.labels.len(), model.labels().len());
        let total: f32 = result.probs.iter().sum();
        prop_assert!((total - 1.0).abs() < 1e-4, "sum was {}", total);
    }

    #[test]
    fn prediction_is_deterministic(text in text(), k in 1..6i32) {
        let model = hashed_model(1);
        let first = predict(&model, &text, k, 0.0).unwrap();
        let second = predict(&model, &text, k, 0.0).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn batch_matches_sequential(texts in prop::collection::vec(text(), 0..20), k in 1..4i32) {
        let model = hashed_model(2);
        let batch = predict_batch(&model, &texts, k, 0.0).unwrap();
        let sequential: Vec<_> = texts
            .iter()
            .map(|t| predict(&model, t, k, 0.0).unwrap())
            .collect();
        prop_assert_eq!(batch, sequential);
    }
}
