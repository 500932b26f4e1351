//! Keyword retrieval over run artifacts and knowledge text.

use std::collections::BTreeSet;

use crate::core::types::{INTERNET_QUERY_KEY, InnerState, RAG_QUERY_KEY, RAG_RESULTS_KEY};

/// Paragraphs at or below this many characters are ignored.
pub const MIN_PARAGRAPH_CHARS: usize = 20;
/// Keywords must be longer than this.
pub const MIN_KEYWORD_CHARS: usize = 2;
/// Results returned per query.
pub const MAX_RESULTS: usize = 3;

const EXCLUDED_KEYS: [&str; 3] = [RAG_QUERY_KEY, INTERNET_QUERY_KEY, RAG_RESULTS_KEY];

/// Split the corpus into candidate paragraphs.
///
/// The corpus is every artifact value followed by the knowledge text. Pending
/// queries and earlier retrieval results are left out; `internet_results`
/// stays searchable.
pub fn corpus_paragraphs(inner: &InnerState, knowledge: Option<&str>) -> Vec<String> {
    let mut sources: Vec<&str> = inner
        .artifacts
        .iter()
        .filter(|a| !EXCLUDED_KEYS.contains(&a.key.as_str()))
        .map(|a| a.value.as_str())
        .collect();
    if let Some(text) = knowledge {
        sources.push(text);
    }

    sources
        .into_iter()
        .flat_map(split_paragraphs)
        .filter(|p| p.chars().count() > MIN_PARAGRAPH_CHARS)
        .collect()
}

fn split_paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(current.join("\n").trim().to_string());
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        out.push(current.join("\n").trim().to_string());
    }
    out
}

/// Distinct lower-cased query words longer than [`MIN_KEYWORD_CHARS`].
pub fn keywords(query: &str) -> BTreeSet<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > MIN_KEYWORD_CHARS)
        .map(str::to_lowercase)
        .collect()
}

/// Top paragraphs for `query`, best first. Ties keep corpus order.
pub fn search<'a>(paragraphs: &'a [String], query: &str) -> Vec<&'a str> {
    let keywords = keywords(query);
    if keywords.is_empty() {
        return Vec::new();
    }
    let mut scored: Vec<(usize, &str)> = paragraphs
        .iter()
        .map(|p| {
            let lower = p.to_lowercase();
            let score = keywords.iter().filter(|k| lower.contains(k.as_str())).count();
            (score, p.as_str())
        })
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().take(MAX_RESULTS).map(|(_, p)| p).collect()
}

/// Hit count and results artifact value for a retrieval query.
pub fn retrieve(inner: &InnerState, knowledge: Option<&str>, query: &str) -> (usize, String) {
    let paragraphs = corpus_paragraphs(inner, knowledge);
    let hits = search(&paragraphs, query);
    (hits.len(), format_hits(query, &hits))
}

/// Join hits with `---` rules, or explain that nothing matched.
pub fn format_hits(query: &str, hits: &[&str]) -> String {
    if hits.is_empty() {
        return format!("No relevant information found for: {}", query.trim());
    }
    hits.join("\n\n---\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Artifact;

    fn inner(values: &[(&str, &str)]) -> InnerState {
        InnerState {
            artifacts: values.iter().map(|(k, v)| Artifact::new(*k, *v)).collect(),
            ..InnerState::default()
        }
    }

    #[test]
    fn short_paragraphs_are_skipped() {
        let state = inner(&[("notes.md", "tiny\n\nThis paragraph is long enough to keep.")]);
        let paragraphs = corpus_paragraphs(&state, None);
        assert_eq!(paragraphs, vec!["This paragraph is long enough to keep."]);
    }

    #[test]
    fn keywords_drop_short_words_and_duplicates() {
        let words: Vec<String> = keywords("How do I tune the Tuning of a cache CACHE").into_iter().collect();
        assert_eq!(words, vec!["cache", "how", "the", "tune", "tuning"]);
    }

    #[test]
    fn search_ranks_by_distinct_keyword_hits() {
        let paragraphs = vec![
            "The cache stores rendered pages for reuse.".to_string(),
            "Eviction policy for the cache is least recently used.".to_string(),
            "Unrelated paragraph about gardening tools.".to_string(),
        ];
        let hits = search(&paragraphs, "cache eviction policy");
        assert_eq!(hits.len(), 2);
        assert!(hits[0].starts_with("Eviction"));
    }

    #[test]
    fn search_caps_results_and_keeps_ties_stable() {
        let paragraphs: Vec<String> = (0..5).map(|i| format!("paragraph {i} mentions rust often")).collect();
        let hits = search(&paragraphs, "rust");
        assert_eq!(hits.len(), MAX_RESULTS);
        assert!(hits[0].contains("paragraph 0"));
        assert!(hits[2].contains("paragraph 2"));
    }

    #[test]
    fn retrieve_reports_no_match() {
        let state = inner(&[("a", "Some unrelated text that is long enough.")]);
        assert_eq!(
            retrieve(&state, None, "quantum chromodynamics"),
            (0, "No relevant information found for: quantum chromodynamics".to_string())
        );
    }

    #[test]
    fn retrieve_reads_knowledge_and_skips_previous_results() {
        let state = inner(&[
            ("rag_results", "Previous results about the lighthouse keeper."),
            ("rag_query", "lighthouse keeper built"),
        ]);
        let knowledge = "The lighthouse was built in 1871 on the northern cliff.";
        let (hits, text) = retrieve(&state, Some(knowledge), "when was the lighthouse built");
        assert_eq!(hits, 1);
        assert_eq!(text, knowledge);
    }

    /// Internet results fetched earlier in the run can be retrieved later.
    #[test]
    fn retrieve_searches_internet_results() {
        let state = inner(&[
            ("internet_results", "- [Wikipedia] Eddystone lighthouse was rebuilt four times."),
            ("internet_query", "eddystone lighthouse history"),
        ]);
        let (hits, text) = retrieve(&state, None, "eddystone lighthouse");
        assert_eq!(hits, 1);
        assert!(text.contains("rebuilt four times"));
    }
}
