//! Query normalization, language detection, spell correction and expansion.
//!
//! The enhancer turns the raw query into a primary query plus a few
//! variations. Every variation is retrieved independently and fused, so a
//! variation only has to help recall; precision is the reranker's job.

use std::collections::HashMap;

use serde::Serialize;

use crate::{
    settings::{QuerySettings, StemLanguage},
    text_util::{self, ENGLISH_STOPWORDS, FRENCH_STOPWORDS},
};

/// Terms that look like typos to a dictionary but are meaningful in queries.
const TECHNICAL_TERMS: &[&str] = &[
    "api", "apis", "pdf", "pdfs", "ceo", "cto", "cfo", "sql", "nosql", "rag",
    "ai", "ml", "llm", "nlp", "ocr", "url", "urls", "pdg", "dg", "drh", "daf",
    "dsi", "pme", "sa", "sarl",
];

/// Abbreviation expansions, French first.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("pdg", "président-directeur général"),
    ("dg", "directeur général"),
    ("drh", "directeur des ressources humaines"),
    ("daf", "directeur administratif et financier"),
    ("dsi", "directeur des systèmes d'information"),
    ("dag", "directeur administratif général"),
    ("ca", "chiffre d'affaires"),
    ("tva", "taxe sur la valeur ajoutée"),
    ("pme", "petite et moyenne entreprise"),
    ("tpe", "très petite entreprise"),
    ("eti", "entreprise de taille intermédiaire"),
    ("sa", "société anonyme"),
    ("sarl", "société à responsabilité limitée"),
    ("sas", "société par actions simplifiée"),
    ("eurl", "entreprise unipersonnelle à responsabilité limitée"),
    ("sce", "société coopérative européenne"),
    ("rh", "ressources humaines"),
    ("etc", "et cetera"),
    ("svp", "s'il vous plaît"),
    ("nb", "nota bene"),
    ("cf", "confer"),
    ("vs", "versus"),
    ("ceo", "chief executive officer"),
    ("cto", "chief technology officer"),
    ("cfo", "chief financial officer"),
    ("vp", "vice president"),
    ("hr", "human resources"),
    ("it", "information technology"),
    ("roi", "return on investment"),
    ("kpi", "key performance indicator"),
    ("ai", "artificial intelligence"),
    ("ml", "machine learning"),
    ("nlp", "natural language processing"),
    ("llm", "large language model"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    English,
    French,
    Unknown,
}

impl From<StemLanguage> for Language {
    fn from(lang: StemLanguage) -> Self {
        match lang {
            StemLanguage::English => Language::English,
            StemLanguage::French => Language::French,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Language::English => "en",
            Language::French => "fr",
            Language::Unknown => "unknown",
        })
    }
}

/// The output of [`QueryEnhancer::enhance`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnhancedQuery {
    pub original: String,
    /// Normalized and possibly spell-corrected query.
    pub primary: String,
    pub variations: Vec<String>,
    pub spelling_suggestion: Option<String>,
    pub language: Language,
}

impl EnhancedQuery {
    /// Primary first, then the variations.
    pub fn all_queries(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str())
            .chain(self.variations.iter().map(String::as_str))
    }
}

/// Collapse whitespace and squash runs of `!`, `?` and `.`.
pub fn normalize_query(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut last: Option<char> = None;
    for word in query.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
            last = Some(' ');
        }
        for c in word.chars() {
            if matches!(c, '!' | '?' | '.') && last == Some(c) {
                continue;
            }
            out.push(c);
            last = Some(c);
        }
    }
    out
}

/// Guess the query language from stopword ratios. French diacritics break
/// ties. Returns `Unknown` when there is no signal either way.
pub fn detect_language(text: &str) -> Language {
    let lower = text.to_lowercase();
    let mut english = 0usize;
    let mut french = 0usize;
    for word in text_util::words(&lower) {
        if ENGLISH_STOPWORDS.contains(&word) {
            english += 1;
        }
        if FRENCH_STOPWORDS.contains(&word) {
            french += 1;
        }
    }

    if english > french {
        return Language::English;
    }
    if french > english {
        return Language::French;
    }
    let has_diacritics = lower.chars().any(|c| "éèêëàâîïôûùüçœ".contains(c));
    if has_diacritics {
        Language::French
    } else {
        Language::Unknown
    }
}

/// Edit distance over chars, keeping two rows of the DP table.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn max_distance(len: usize) -> usize {
    match len {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

/// Re-apply the case pattern of `original` (UPPER, Capitalized or lower).
fn match_case(original: &str, replacement: &str) -> String {
    let letters: Vec<char> = original.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() > 1 && letters.iter().all(|c| c.is_uppercase()) {
        return replacement.to_uppercase();
    }
    if original.chars().next().is_some_and(char::is_uppercase) {
        let mut chars = replacement.chars();
        return match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        };
    }
    replacement.to_string()
}

/// Split a whitespace token into leading punctuation, word core and
/// trailing punctuation.
fn split_token(token: &str) -> (&str, &str, &str) {
    let core_start = token
        .char_indices()
        .find(|(_, c)| c.is_alphanumeric())
        .map_or(token.len(), |(i, _)| i);
    let core_end = token
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_alphanumeric())
        .map_or(core_start, |(i, c)| i + c.len_utf8());
    (
        &token[..core_start],
        &token[core_start..core_end],
        &token[core_end..],
    )
}

/// Rewrite every word core of `query` through `f`, keeping punctuation and
/// spacing. `f` returns `None` to keep a word unchanged.
fn map_words(query: &str, mut f: impl FnMut(&str) -> Option<String>) -> String {
    query
        .split(' ')
        .map(|token| {
            let (lead, core, trail) = split_token(token);
            match f(core) {
                Some(replacement) => format!("{lead}{replacement}{trail}"),
                None => token.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct QueryEnhancer {
    settings: QuerySettings,
    vocabulary: HashMap<String, u64>,
}

impl QueryEnhancer {
    /// `vocabulary` maps lowercase corpus terms to document frequency.
    pub fn new(settings: QuerySettings, vocabulary: HashMap<String, u64>) -> Self {
        Self {
            settings,
            vocabulary,
        }
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    pub fn vocabulary_len(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn enhance(&self, raw: &str) -> EnhancedQuery {
        let normalized = normalize_query(raw);
        let language = match detect_language(&normalized) {
            Language::Unknown => self.settings.default_language.into(),
            lang => lang,
        };

        let corrected = if self.settings.spell_correction {
            self.correct_spelling(&normalized)
        } else {
            None
        };
        let spelling_suggestion = corrected
            .as_ref()
            .filter(|c| c.to_lowercase() != normalized.to_lowercase())
            .cloned();
        let primary = spelling_suggestion.clone().unwrap_or_else(|| normalized.clone());

        let variations = self.variations(&primary, &normalized);

        tracing::debug!(
            %language,
            primary = %primary,
            variations = variations.len(),
            corrected = spelling_suggestion.is_some(),
            "enhanced query"
        );

        EnhancedQuery {
            original: raw.to_string(),
            primary,
            variations,
            spelling_suggestion,
            language,
        }
    }

    /// Correct each word against the corpus vocabulary. Returns `None` when
    /// nothing changed.
    fn correct_spelling(&self, query: &str) -> Option<String> {
        if self.vocabulary.is_empty() {
            return None;
        }
        let mut changed = false;
        let corrected = map_words(query, |word| {
            let fixed = self.correct_word(word)?;
            changed = true;
            Some(match_case(word, &fixed))
        });
        changed.then_some(corrected)
    }

    fn correct_word(&self, word: &str) -> Option<String> {
        let len = word.chars().count();
        if len <= 2 || !word.chars().all(char::is_alphabetic) {
            return None;
        }
        let lower = word.to_lowercase();
        if TECHNICAL_TERMS.contains(&lower.as_str())
            || ABBREVIATIONS.iter().any(|(a, _)| *a == lower)
            || text_util::is_stopword(&lower)
            || self.vocabulary.contains_key(&lower)
        {
            return None;
        }

        let limit = max_distance(len);
        let mut best: Option<(usize, u64, &str)> = None;
        let mut tied = false;
        for (term, &freq) in &self.vocabulary {
            if term.chars().count().abs_diff(len) > limit {
                continue;
            }
            let distance = levenshtein(&lower, term);
            if distance == 0 || distance > limit {
                continue;
            }
            match best {
                None => best = Some((distance, freq, term)),
                Some((d, f, _)) if distance < d || (distance == d && freq > f) => {
                    best = Some((distance, freq, term));
                    tied = false;
                }
                Some((d, f, _)) if distance == d && freq == f => tied = true,
                Some(_) => {}
            }
        }

        match best {
            Some((_, _, term)) if !tied => {
                tracing::debug!(word, correction = term, "spelling correction");
                Some(term.to_string())
            }
            _ => None,
        }
    }

    fn variations(&self, primary: &str, normalized: &str) -> Vec<String> {
        let mut candidates = Vec::new();

        let expanded = map_words(primary, |word| {
            abbreviation_expansion(word).map(str::to_string)
        });
        candidates.push(expanded);

        candidates.push(normalized.to_string());

        let folded = map_words(primary, |word| {
            let lower = word.to_lowercase();
            if text_util::is_stopword(&lower) {
                return None;
            }
            let stem = text_util::fold_plural(&lower);
            (stem != lower).then(|| match_case(word, &stem))
        });
        candidates.push(folded);

        for (term, synonyms) in &self.settings.synonyms {
            let term = term.to_lowercase();
            for synonym in synonyms {
                candidates.push(map_words(primary, |word| {
                    (word.to_lowercase() == term).then(|| synonym.clone())
                }));
            }
        }

        let mut seen = vec![primary.to_lowercase()];
        let mut out = Vec::new();
        for candidate in candidates {
            if out.len() >= self.settings.max_variations {
                break;
            }
            let key = candidate.to_lowercase();
            if candidate.trim().is_empty() || seen.contains(&key) {
                continue;
            }
            seen.push(key);
            out.push(candidate);
        }
        out
    }
}

/// Expansion of `word` when it is a known abbreviation. Abbreviations that
/// double as stopwords ("it", "sa") only expand when written in capitals.
fn abbreviation_expansion(word: &str) -> Option<&'static str> {
    let lower = word.to_lowercase();
    let expansion = ABBREVIATIONS
        .iter()
        .find(|(abbrev, _)| *abbrev == lower)
        .map(|(_, expansion)| *expansion)?;
    let capitals = word.chars().all(|c| !c.is_lowercase());
    if !capitals && text_util::is_stopword(&lower) {
        return None;
    }
    Some(expansion)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(entries: &[(&str, u64)]) -> HashMap<String, u64> {
        entries.iter().map(|(t, f)| (t.to_string(), *f)).collect()
    }

    fn enhancer(entries: &[(&str, u64)]) -> QueryEnhancer {
        QueryEnhancer::new(QuerySettings::default(), vocab(entries))
    }

    #[test]
    fn normalize_collapses_whitespace_and_punctuation() {
        assert_eq!(normalize_query("  what   is\tthis???  "), "what is this?");
        assert_eq!(normalize_query("wow!!! ok..."), "wow! ok.");
        assert_eq!(normalize_query("v1.2 works"), "v1.2 works");
        assert_eq!(normalize_query("   "), "");
    }

    #[test]
    fn detects_language() {
        assert_eq!(detect_language("When was the company founded?"), Language::English);
        assert_eq!(
            detect_language("Quand est-ce que la société a été créée ?"),
            Language::French
        );
        assert_eq!(detect_language("TechCorp"), Language::Unknown);
        assert_eq!(detect_language("société"), Language::French);
    }

    #[test]
    fn levenshtein_distances() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("tekcorp", "techcorp"), 2);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn corrects_misspelled_entity_preserving_case() {
        let e = enhancer(&[("techcorp", 3), ("founded", 2), ("paris", 1)]);
        let q = e.enhance("When was TekCorp founded?");
        assert_eq!(q.spelling_suggestion.as_deref(), Some("When was Techcorp founded?"));
        assert_eq!(q.primary, "When was Techcorp founded?");
        assert!(q.variations.contains(&"When was TekCorp founded?".to_string()));
        assert_eq!(q.language, Language::English);
    }

    #[test]
    fn upper_case_pattern_is_kept() {
        let e = enhancer(&[("report", 1)]);
        let q = e.enhance("REPORTT");
        assert_eq!(q.primary, "REPORT");
    }

    #[test]
    fn known_words_and_technical_terms_are_not_corrected() {
        let e = enhancer(&[("techcorp", 3), ("apis", 1), ("cto", 1)]);
        assert!(e.enhance("techcorp").spelling_suggestion.is_none());
        assert!(e.enhance("api").spelling_suggestion.is_none());
        assert!(e.enhance("gpt4 is").spelling_suggestion.is_none());
    }

    #[test]
    fn ambiguous_correction_is_skipped() {
        let e = enhancer(&[("cart", 2), ("card", 2)]);
        assert!(e.enhance("carx").spelling_suggestion.is_none());

        let e = enhancer(&[("cart", 5), ("card", 2)]);
        assert_eq!(e.enhance("carx").primary, "cart");
    }

    #[test]
    fn short_words_use_tighter_distance() {
        let e = enhancer(&[("data", 1)]);
        assert!(e.enhance("dtaa").spelling_suggestion.is_none());
        assert_eq!(e.enhance("dota").primary, "data");
    }

    #[test]
    fn expands_abbreviations() {
        let e = enhancer(&[]);
        let q = e.enhance("Who is the CEO?");
        assert_eq!(q.variations[0], "Who is the chief executive officer?");

        let q = e.enhance("le PDG de TechCorp");
        assert!(q.variations.contains(&"le président-directeur général de TechCorp".to_string()));
    }

    #[test]
    fn stopword_abbreviations_need_capitals() {
        let e = enhancer(&[]);
        let q = e.enhance("is it ready");
        assert!(q.variations.iter().all(|v| !v.contains("information technology")));

        let q = e.enhance("who runs IT support");
        assert!(q.variations.contains(&"who runs information technology support".to_string()));
    }

    #[test]
    fn plural_variation() {
        let e = enhancer(&[]);
        let q = e.enhance("company policies");
        assert!(q.variations.contains(&"company policy".to_string()));
    }

    #[test]
    fn synonyms_from_settings() {
        let mut settings = QuerySettings::default();
        settings
            .synonyms
            .insert("founded".into(), vec!["established".into(), "created".into()]);
        let e = QueryEnhancer::new(settings, HashMap::new());
        let q = e.enhance("when was it founded");
        assert!(q.variations.contains(&"when was it established".to_string()));
    }

    #[test]
    fn variations_are_bounded_and_distinct() {
        let mut settings = QuerySettings::default();
        settings.synonyms.insert(
            "cars".into(),
            vec!["autos".into(), "vehicles".into(), "CARS".into()],
        );
        let e = QueryEnhancer::new(settings, HashMap::new());
        let q = e.enhance("ML cars");
        assert!(q.variations.len() <= 3);
        let mut lowered: Vec<String> =
            q.all_queries().map(str::to_lowercase).collect();
        let total = lowered.len();
        lowered.sort();
        lowered.dedup();
        assert_eq!(lowered.len(), total);
    }

    #[test]
    fn empty_query() {
        let q = enhancer(&[("a", 1)]).enhance("   ");
        assert_eq!(q.primary, "");
        assert!(q.variations.is_empty());
        assert!(q.spelling_suggestion.is_none());
    }
}
