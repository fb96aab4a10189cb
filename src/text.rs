//! Caption and question normalization.

/// Default word cap applied to captions, questions, and sentences.
pub const DEFAULT_MAX_WORDS: usize = 30;

/// Canonicalize free text before tokenization: case-fold, replace
/// punctuation with spaces, collapse whitespace runs, trim, and keep at
/// most `max_words` space-separated tokens.
///
/// Idempotent; an empty input yields an empty output.
pub fn normalize(raw: &str, max_words: usize) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_punctuation() {
            cleaned.push(' ');
        } else {
            for lower in ch.to_lowercase() {
                cleaned.push(lower);
            }
        }
    }
    cleaned
        .split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_case_and_punctuation() {
        assert_eq!(
            normalize("A Dog, chasing its TAIL!", DEFAULT_MAX_WORDS),
            "a dog chasing its tail"
        );
        assert_eq!(normalize("don't stop", DEFAULT_MAX_WORDS), "don t stop");
    }

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(
            normalize("  two \t birds\n\non a   wire ", DEFAULT_MAX_WORDS),
            "two birds on a wire"
        );
    }

    #[test]
    fn test_normalize_caps_word_count() {
        assert_eq!(normalize("one two three four five", 3), "one two three");
        assert_eq!(normalize("one two", 0), "");
    }

    #[test]
    fn test_normalize_idempotent() {
        let inputs = [
            "A photo; of (a) \"cat\"...",
            "MiXeD   CaSe\twith\nbreaks",
            "already clean text",
            "",
        ];
        for raw in inputs {
            let once = normalize(raw, DEFAULT_MAX_WORDS);
            assert_eq!(normalize(&once, DEFAULT_MAX_WORDS), once);
        }
    }

    #[test]
    fn test_normalize_output_is_clean() {
        let out = normalize("Strange -- input!! With?? Everything:: *#~", 10);
        assert!(!out.chars().any(|c| c.is_ascii_punctuation()));
        assert!(!out.contains("  "));
        assert!(out.split(' ').count() <= 10);
    }
}
