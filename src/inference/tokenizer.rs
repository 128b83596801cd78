//! fastText feature extraction.
//!
//! A line is split on fastText's separators (space, `\t`, `\n`, `\r`, `\v`,
//! `\f`, `\0`) and terminated with [`EOS`]. Every
//! token contributes its vocabulary row (if any), the hashed character
//! n-grams of `<token>`, and consecutive tokens contribute hashed word
//! n-grams. The hashing mirrors fastText bit for bit so weights exported
//! from a trained fastText model score identically.

use smallvec::SmallVec;

use crate::model::{EOS, LABEL_PREFIX, Model};

/// Input rows selected for one line.
pub type Features = SmallVec<[u32; 32]>;

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;
const WORD_NGRAM_MULTIPLIER: u64 = 116_049_371;

/// 32-bit FNV-1a over UTF-8 bytes, with fastText's signed-byte quirk.
pub fn fnv1a(s: &str) -> u32 {
    let mut h = FNV_OFFSET;
    for &b in s.as_bytes() {
        h ^= b as i8 as u32;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Characters that end a token.
pub fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0B' | '\x0C' | '\0')
}

/// True when `text` holds no token at all.
pub fn is_blank(text: &str) -> bool {
    text.chars().all(is_separator)
}

/// Tokens of one input line, [`EOS`] included.
pub fn tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(is_separator)
        .filter(|t| !t.is_empty() && !t.starts_with(LABEL_PREFIX))
        .chain(std::iter::once(EOS))
}

/// Collect the input rows `text` activates in `model`.
pub fn features(model: &Model, text: &str) -> Features {
    let mut out = Features::new();
    let mut word_hashes: SmallVec<[u32; 32]> = SmallVec::new();

    for token in tokens(text) {
        let wid = model.word_id(token);
        if let Some(id) = wid {
            out.push(id);
        }
        if token != EOS && model.char_ngram_range().is_some() {
            push_char_ngrams(model, token, &mut out);
        }
        word_hashes.push(fnv1a(token));
    }

    if model.word_ngrams() > 1 {
        push_word_ngrams(model, &word_hashes, &mut out);
    }
    out
}

fn push_char_ngrams(model: &Model, token: &str, out: &mut Features) {
    let Some((minn, maxn)) = model.char_ngram_range() else {
        return;
    };

    let wrapped = format!("<{token}>");
    let bounds: SmallVec<[usize; 32]> = wrapped
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(wrapped.len()))
        .collect();
    let nchars = bounds.len() - 1;

    for start in 0..nchars {
        for n in minn..=maxn {
            let end = start + n;
            if end > nchars {
                break;
            }
            // Lone "<" or ">" carry no signal.
            if n == 1 && (start == 0 || end == nchars) {
                continue;
            }
            let ngram = &wrapped[bounds[start]..bounds[end]];
            out.push(model.bucket_row(u64::from(fnv1a(ngram))));
        }
    }
}

fn push_word_ngrams(model: &Model, hashes: &[u32], out: &mut Features) {
    let n = model.word_ngrams();
    for i in 0..hashes.len() {
        let mut h = widen(hashes[i]);
        for &next in hashes.iter().take(i + n).skip(i + 1) {
            h = h.wrapping_mul(WORD_NGRAM_MULTIPLIER).wrapping_add(widen(next));
            out.push(model.bucket_row(h));
        }
    }
}

/// fastText stores word hashes as `int32_t` and widens them with sign extension.
#[inline]
fn widen(h: u32) -> u64 {
    h as i32 as i64 as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelParts;

    fn model(words: &[&str], buckets: u32, minn: u32, maxn: u32, word_ngrams: u32) -> Model {
        let rows = words.len() + buckets as usize;
        Model::from_parts(
            "t",
            ModelParts {
                labels: vec!["a".into()],
                dim: 1,
                words: words.iter().map(|w| w.to_string()).collect(),
                buckets,
                minn,
                maxn,
                word_ngrams,
                input: vec![0.0; rows],
                output: vec![0.0],
            },
        )
        .unwrap()
    }

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(""), 2_166_136_261);
        assert_eq!(fnv1a("a"), 0xe40c292c);
        assert_eq!(fnv1a("foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_fnv1a_sign_extends_non_ascii() {
        // 'é' is 0xC3 0xA9; both bytes are negative as i8.
        let mut h = FNV_OFFSET;
        for b in [0xC3u8, 0xA9] {
            h ^= 0xFFFF_FF00 | u32::from(b);
            h = h.wrapping_mul(FNV_PRIME);
        }
        assert_eq!(fnv1a("é"), h);
    }

    #[test]
    fn test_tokens_append_eos_and_skip_labels() {
        let toks: Vec<&str> = tokens("  hello\tworld __label__x\n").collect();
        assert_eq!(toks, vec!["hello", "world", EOS]);
    }

    #[test]
    fn test_tokens_split_on_vertical_tab_and_nul() {
        let toks: Vec<&str> = tokens("a\x0Bb\0c\x0Cd").collect();
        assert_eq!(toks, vec!["a", "b", "c", "d", EOS]);

        // Non-ASCII spaces are part of a token, as in fastText.
        let toks: Vec<&str> = tokens("a\u{00A0}b").collect();
        assert_eq!(toks, vec!["a\u{00A0}b", EOS]);

        assert!(is_blank("\x0B\0 \t"));
        assert!(!is_blank("\u{3000}"));
    }

    #[test]
    fn test_vocabulary_features_only() {
        let m = model(&["hello", EOS], 0, 0, 0, 1);
        let f = features(&m, "hello stranger");
        assert_eq!(f.as_slice(), &[0, 1]);
    }

    #[test]
    fn test_char_ngram_count() {
        // "<ab>" has 4 chars; 2-grams: <a ab b> ; 3-grams: <ab ab> => 5 rows.
        let m = model(&[], 16, 2, 3, 1);
        let f = features(&m, "ab");
        assert_eq!(f.len(), 5);
        assert!(f.iter().all(|&row| row < 16));
    }

    #[test]
    fn test_char_ngrams_respect_utf8_boundaries() {
        let m = model(&[], 8, 1, 2, 1);
        // "<é>" = 3 chars: 1-grams only the middle one, 2-grams: "<é", "é>".
        let f = features(&m, "é");
        assert_eq!(f.len(), 3);
    }

    #[test]
    fn test_word_bigrams() {
        let m = model(&[], 32, 0, 0, 2);
        // tokens: x y </s> -> bigrams (x,y) and (y,</s>)
        let f = features(&m, "x y");
        assert_eq!(f.len(), 2);
        let expected = WORD_NGRAM_MULTIPLIER
            .wrapping_mul(widen(fnv1a("x")))
            .wrapping_add(widen(fnv1a("y")));
        assert_eq!(f[0], m.bucket_row(expected));
    }

    #[test]
    fn test_features_are_deterministic() {
        let m = model(&["the"], 64, 2, 4, 3);
        assert_eq!(
            features(&m, "the quick brown fox"),
            features(&m, "the quick brown fox")
        );
    }
}
