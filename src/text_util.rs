//! Small text helpers shared by the scorer, the query enhancer and the
//! reranker.

use unicode_segmentation::UnicodeSegmentation;

/// English function words ignored when matching content terms.
pub const ENGLISH_STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "been", "but", "by",
    "can", "could", "did", "do", "does", "for", "from", "had", "has", "have",
    "how", "i", "if", "in", "into", "is", "it", "its", "me", "my", "of", "on",
    "or", "our", "should", "so", "than", "that", "the", "their", "them",
    "then", "there", "these", "they", "this", "those", "to", "us", "was",
    "we", "were", "what", "when", "where", "which", "who", "whom", "why",
    "will", "with", "would", "you", "your",
];

/// French function words ignored when matching content terms.
pub const FRENCH_STOPWORDS: &[&str] = &[
    "au", "aux", "avec", "ce", "ces", "comment", "dans", "de", "des", "du",
    "elle", "en", "est", "et", "eux", "il", "ils", "je", "la", "le", "les",
    "leur", "lui", "ma", "mais", "me", "mes", "moi", "mon", "ne", "nos",
    "notre", "nous", "on", "ou", "où", "par", "pas", "pour", "quand", "que",
    "quel", "quelle", "qui", "quoi", "sa", "se", "ses", "son", "sont", "sur",
    "ta", "te", "tes", "toi", "ton", "tu", "un", "une", "vos", "votre",
    "vous",
];

/// Words of `text` according to Unicode word boundaries.
pub fn words(text: &str) -> impl Iterator<Item = &str> {
    text.unicode_words()
}

/// `word` must already be lowercase.
pub fn is_stopword(word: &str) -> bool {
    ENGLISH_STOPWORDS.contains(&word) || FRENCH_STOPWORDS.contains(&word)
}

/// Collapse plural forms onto a shared stem so "cars" and "car" compare equal.
///
/// Handles the regular English (`-ies`, `-s`) and French (`-aux`, `-s`, `-x`)
/// endings. Short words are left alone.
pub fn fold_plural(word: &str) -> String {
    let len = word.chars().count();
    if len <= 3 {
        return word.to_string();
    }
    if let Some(stem) = word.strip_suffix("ies")
        && len > 4
    {
        return format!("{stem}y");
    }
    if let Some(stem) = word.strip_suffix("aux")
        && len > 4
    {
        return format!("{stem}al");
    }
    if word.ends_with("ss") || word.ends_with("us") || word.ends_with("is") {
        return word.to_string();
    }
    if let Some(stem) = word.strip_suffix('s').or_else(|| word.strip_suffix('x'))
    {
        return stem.to_string();
    }
    word.to_string()
}

/// Whether `needle` occurs in `haystack` as a whole word, ignoring case.
pub fn contains_word(haystack: &str, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    if needle.is_empty() {
        return false;
    }
    let haystack = haystack.to_lowercase();
    let is_word_char = |c: char| c.is_alphanumeric() || c == '_' || c == '-';

    let mut from = 0;
    while let Some(pos) = haystack[from..].find(&needle) {
        let start = from + pos;
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !is_word_char(c));
        let after_ok =
            haystack[end..].chars().next().is_none_or(|c| !is_word_char(c));
        if before_ok && after_ok {
            return true;
        }
        from = start
            + haystack[start..].chars().next().map_or(1, char::len_utf8);
    }
    false
}

/// Split on whitespace and strip surrounding punctuation, keeping inner
/// `-`, `_` and `.` so identifiers like `gpt-4` or `v1.2` survive.
pub fn raw_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_drop_punctuation() {
        let w: Vec<&str> = words("Hello, world! It's 2015.").collect();
        assert_eq!(w, vec!["Hello", "world", "It's", "2015"]);
    }

    #[test]
    fn stopwords_cover_both_languages() {
        assert!(is_stopword("the"));
        assert!(is_stopword("les"));
        assert!(!is_stopword("techcorp"));
    }

    #[test]
    fn fold_plural_regular_forms() {
        assert_eq!(fold_plural("companies"), "company");
        assert_eq!(fold_plural("journaux"), "journal");
        assert_eq!(fold_plural("documents"), "document");
        assert_eq!(fold_plural("prix"), "pri");
        assert_eq!(fold_plural("process"), "process");
        assert_eq!(fold_plural("bus"), "bus");
    }

    #[test]
    fn contains_word_respects_boundaries() {
        assert!(contains_word("TechCorp was founded in 2015.", "techcorp"));
        assert!(contains_word("TechCorp was founded in 2015.", "2015"));
        assert!(!contains_word("TechCorporation", "techcorp"));
        assert!(!contains_word("gpt-4", "gpt"));
        assert!(contains_word("uses gpt-4 daily", "gpt-4"));
    }

    #[test]
    fn contains_word_handles_multibyte() {
        assert!(contains_word("Le café est fermé", "fermé"));
        assert!(!contains_word("", "x"));
    }

    #[test]
    fn raw_tokens_keep_identifiers() {
        let t: Vec<&str> = raw_tokens("Is gpt-4 (v1.2) ready?").collect();
        assert_eq!(t, vec!["Is", "gpt-4", "v1.2", "ready"]);
    }
}
