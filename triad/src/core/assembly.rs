//! Final deliverable assembly: README detection, synthesis and summaries.

use crate::core::types::{Artifact, InnerState, ResultType, is_tool_key};

/// Key used for a synthesized README.
pub const README_KEY: &str = "README.md";
/// Key used for a derived summary artifact.
pub const SUMMARY_KEY: &str = "summary";
/// Maximum characters kept in a derived summary.
pub const SUMMARY_MAX_CHARS: usize = 500;

const EXCLUDED_FRAGMENTS: [&str; 4] = ["plan", "requirement", "summary", "notes"];
const CODE_EXTENSIONS: [&str; 20] = [
    "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "kt", "c", "h", "cpp", "cs", "rb", "php",
    "sh", "sql", "html", "css", "swift",
];
const TABLE_EXTENSIONS: [&str; 3] = ["csv", "tsv", "xlsx"];

/// True for README-like or `result.*` keys.
pub fn is_deliverable_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("readme") || key.starts_with("result.")
}

/// Deliverable artifact, README-like keys first.
pub fn find_deliverable(inner: &InnerState) -> Option<&Artifact> {
    let mut candidates = inner.artifacts.iter().filter(|a| is_deliverable_key(&a.key));
    let first = candidates.next()?;
    if first.key.to_ascii_lowercase().starts_with("readme") {
        return Some(first);
    }
    candidates
        .find(|a| a.key.to_ascii_lowercase().starts_with("readme"))
        .or(Some(first))
}

/// True for process or internal keys that never belong in the deliverable.
pub fn is_process_key(key: &str) -> bool {
    if is_tool_key(key) {
        return true;
    }
    let key = key.to_ascii_lowercase();
    EXCLUDED_FRAGMENTS.iter().any(|frag| key.contains(frag))
}

fn deliverable_rank(key: &str) -> u8 {
    let key = key.to_ascii_lowercase();
    if key.starts_with("result.") || key.starts_with("final") || key == "readme.md" {
        0
    } else {
        1
    }
}

/// Content artifacts in deliverable order (stable within each rank).
pub fn content_artifacts(inner: &InnerState) -> Vec<&Artifact> {
    let mut content: Vec<&Artifact> = inner
        .artifacts
        .iter()
        .filter(|a| !is_process_key(&a.key))
        .collect();
    content.sort_by_key(|a| deliverable_rank(&a.key));
    content
}

/// Best-effort README built from the content artifacts, skipping any earlier
/// synthesized README.
pub fn synthesize_readme(goal: &str, inner: &InnerState) -> String {
    let mut buf = format!("# {}\n", goal.trim());
    let content: Vec<&Artifact> = content_artifacts(inner)
        .into_iter()
        .filter(|a| a.key != README_KEY)
        .collect();
    if content.is_empty() {
        buf.push_str("\nNo deliverable artifacts were produced.\n");
        return buf;
    }
    for artifact in content {
        buf.push_str(&format!("\n## {}\n\n{}\n", artifact.key, artifact.value.trim_end()));
    }
    buf
}

/// Truncate `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}

/// Short summary derived from the deliverable body.
pub fn derive_summary(markdown: &str) -> String {
    let body: Vec<&str> = markdown
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();
    let text = if body.is_empty() {
        markdown.trim().trim_start_matches('#').trim().to_string()
    } else {
        body.join(" ")
    };
    truncate_chars(&text, SUMMARY_MAX_CHARS)
}

/// Infer the result type from artifact keys when the model gave none.
pub fn infer_result_type(inner: &InnerState) -> ResultType {
    let extension_in = |list: &[&str]| {
        inner.artifacts.iter().any(|a| {
            a.key
                .rsplit_once('.')
                .is_some_and(|(_, ext)| list.contains(&ext.to_ascii_lowercase().as_str()))
        })
    };
    if extension_in(&CODE_EXTENSIONS) {
        ResultType::Code
    } else if extension_in(&TABLE_EXTENSIONS) {
        ResultType::Table
    } else {
        ResultType::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner_with(artifacts: &[(&str, &str)]) -> InnerState {
        InnerState {
            artifacts: artifacts
                .iter()
                .map(|(k, v)| Artifact::new(*k, *v))
                .collect(),
            ..InnerState::default()
        }
    }

    #[test]
    fn deliverable_keys_are_detected() {
        assert!(is_deliverable_key("README.md"));
        assert!(is_deliverable_key("result.py"));
        assert!(!is_deliverable_key("final_report.md"));
        assert!(!is_deliverable_key("results.txt"));
    }

    #[test]
    fn deliverable_prefers_readme_over_result() {
        let inner = inner_with(&[
            ("results.txt", "raw"),
            ("result.csv", "a,b"),
            ("Readme.md", "# Guide"),
        ]);
        assert_eq!(find_deliverable(&inner).map(|a| a.key.as_str()), Some("Readme.md"));

        let inner = inner_with(&[("draft.md", "text"), ("result.csv", "a,b")]);
        assert_eq!(find_deliverable(&inner).map(|a| a.key.as_str()), Some("result.csv"));
        assert!(find_deliverable(&inner_with(&[("draft.md", "text")])).is_none());
    }

    #[test]
    fn process_keys_are_excluded() {
        for key in [
            "rag_results",
            "internet_results",
            "project_plan.md",
            "requirements.txt",
            "summary",
            "meeting_notes",
        ] {
            assert!(is_process_key(key), "{key} should be excluded");
        }
        assert!(!is_process_key("chapter1.md"));
    }

    #[test]
    fn synthesized_readme_orders_deliverables_first() {
        let inner = inner_with(&[
            ("outline.md", "outline body"),
            ("plan.md", "the plan"),
            ("final_report.md", "report body"),
            ("rag_results", "snippets"),
            ("result.py", "print(1)"),
        ]);
        let readme = synthesize_readme("Build a thing", &inner);
        assert!(readme.starts_with("# Build a thing\n"));
        let report = readme.find("## final_report.md").expect("report heading");
        let result = readme.find("## result.py").expect("result heading");
        let outline = readme.find("## outline.md").expect("outline heading");
        assert!(report < result && result < outline);
        assert!(!readme.contains("the plan"));
        assert!(!readme.contains("snippets"));
    }

    #[test]
    fn synthesized_readme_handles_no_content() {
        let readme = synthesize_readme("Goal", &inner_with(&[("plan.md", "p")]));
        assert!(readme.contains("No deliverable artifacts"));
    }

    #[test]
    fn summary_skips_headings_and_truncates() {
        let long = format!("# Title\n\n{}", "word ".repeat(200));
        let summary = derive_summary(&long);
        assert!(!summary.contains("Title"));
        assert!(summary.ends_with('…'));
        assert!(summary.chars().count() <= SUMMARY_MAX_CHARS + 1);
    }

    #[test]
    fn result_type_follows_extensions() {
        assert_eq!(infer_result_type(&inner_with(&[("main.rs", "")])), ResultType::Code);
        assert_eq!(infer_result_type(&inner_with(&[("data.csv", "")])), ResultType::Table);
        assert_eq!(infer_result_type(&inner_with(&[("essay.md", "")])), ResultType::Text);
    }
}
