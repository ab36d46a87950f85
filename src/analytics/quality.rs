//! Quality-detection helpers (C7): text normalization, string similarity for
//! echo/repeat detection, and anchor-word extraction.
//!
//! No concrete source for the similarity metric survived in the retrieved
//! original (`services/analytics.py` is a stub referencing
//! `difflib.SequenceMatcher` without a body), so this is a fresh
//! Ratcliff/Obershelp-style ratio: twice the longest-common-subsequence
//! length over the sum of both string lengths, which reproduces
//! `SequenceMatcher.ratio()`'s documented behavior on typical inputs.

const STOP_WORDS: &[&str] = &[
    "il", "lo", "la", "i", "gli", "le", "un", "uno", "una", "di", "a", "da", "in", "con", "su",
    "per", "tra", "fra", "e", "o", "ma", "che", "chi", "cui", "non", "si", "mi", "ti", "ci", "vi",
    "del", "della", "dei", "delle", "al", "allo", "alla", "ho", "ha", "sono", "è",
];

pub fn normalize_text(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Longest common subsequence length over two token/char sequences.
fn lcs_len(a: &[char], b: &[char]) -> usize {
    let (n, m) = (a.len(), b.len());
    let mut prev = vec![0usize; m + 1];
    let mut curr = vec![0usize; m + 1];
    for i in 1..=n {
        for j in 1..=m {
            curr[j] = if a[i - 1] == b[j - 1] {
                prev[j - 1] + 1
            } else {
                prev[j].max(curr[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[m]
}

/// SequenceMatcher-ratio-equivalent similarity in [0, 1].
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a_norm = normalize_text(a);
    let b_norm = normalize_text(b);
    let a_chars: Vec<char> = a_norm.chars().collect();
    let b_chars: Vec<char> = b_norm.chars().collect();
    let total = a_chars.len() + b_chars.len();
    if total == 0 {
        return 1.0;
    }
    let matches = lcs_len(&a_chars, &b_chars);
    (2.0 * matches as f64) / total as f64
}

/// Extracts up to 5 non-stop-word tokens of length >= 2 from a transcript.
pub fn anchor_words(text: &str) -> Vec<String> {
    normalize_text(text)
        .split_whitespace()
        .filter(|w| w.chars().count() >= 2 && !STOP_WORDS.contains(w))
        .take(5)
        .map(|w| w.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_have_similarity_one() {
        assert_eq!(similarity_ratio("Buongiorno", "buongiorno"), 1.0);
    }

    #[test]
    fn disjoint_strings_have_low_similarity() {
        assert!(similarity_ratio("xyz123", "qqqqqq") < 0.2);
    }

    #[test]
    fn echo_like_repetition_scores_high() {
        let a = "Salve, come posso aiutarla oggi";
        let b = "Salve, come posso aiutarla oggi?";
        assert!(similarity_ratio(a, b) > 0.9);
    }

    #[test]
    fn anchor_words_drops_stopwords_and_caps_at_five() {
        let words = anchor_words("Il pacco per la consegna di domani è arrivato presto stamattina");
        assert!(words.len() <= 5);
        assert!(!words.contains(&"il".to_string()));
        assert!(!words.contains(&"per".to_string()));
    }
}
