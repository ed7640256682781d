//! Citation extraction and verification for final answers.
//!
//! Answers end with a `## Sources` section whose lines carry
//! ``- `path`:start-end`` citations. Parsing recovers the citations;
//! verification checks each against the filesystem under the repository
//! containment policy. Verification failures become repair diagnostics the
//! agent feeds back to the model.

use regex::Regex;
use repowiki_core::Citation;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path};
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyError {
    /// The citation (or answer fragment) the error refers to.
    pub reference: String,
    pub reason: String,
}

impl VerifyError {
    fn new(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub valid: bool,
    pub citations: Vec<Citation>,
    pub errors: Vec<VerifyError>,
}

fn citation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*[-*]\s*`([^`]+)`:(\d+)-(\d+)\s*$").expect("regex"))
}

fn sources_header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^##\s*sources[ \t]*$").expect("regex"))
}

/// Whether the markdown carries a `## Sources` header at all.
pub fn contains_sources_section(markdown: &str) -> bool {
    sources_header_regex().is_match(markdown)
}

/// Slice out the Sources section: from the line after the header through the
/// next `##` header or end of text.
pub fn extract_sources_section(markdown: &str) -> Option<&str> {
    let header = sources_header_regex().find(markdown)?;
    let body_start = markdown[header.end()..]
        .find('\n')
        .map(|i| header.end() + i + 1)
        .unwrap_or(markdown.len());
    let rest = &markdown[body_start..];

    let next_header = Regex::new(r"(?m)^##[^\n]*$").expect("regex");
    let body_end = next_header
        .find(rest)
        .map(|m| m.start())
        .unwrap_or(rest.len());
    Some(&rest[..body_end])
}

/// Markdown-only parsing: recover structurally valid citations and record a
/// structured error for each malformed entry. Never touches the filesystem.
pub fn parse_citations(markdown: &str) -> (Vec<Citation>, Vec<VerifyError>) {
    let Some(section) = extract_sources_section(markdown) else {
        return (
            Vec::new(),
            vec![VerifyError::new("answer", "Missing Sources section")],
        );
    };

    let mut citations = Vec::new();
    let mut errors = Vec::new();
    for caps in citation_regex().captures_iter(section) {
        let path = caps[1].to_string();
        let reference = format!("`{}`:{}-{}", path, &caps[2], &caps[3]);
        let (Ok(start_line), Ok(end_line)) = (caps[2].parse::<u64>(), caps[3].parse::<u64>())
        else {
            errors.push(VerifyError::new(reference, "line numbers are not valid integers"));
            continue;
        };
        if start_line < 1 {
            errors.push(VerifyError::new(reference, "start line must be >= 1"));
            continue;
        }
        if end_line < start_line {
            errors.push(VerifyError::new(
                reference,
                format!("end line {end_line} is before start line {start_line}"),
            ));
            continue;
        }
        citations.push(Citation {
            path,
            start_line,
            end_line,
        });
    }

    if citations.is_empty() && errors.is_empty() {
        errors.push(VerifyError::new(
            "answer",
            "No citations found in Sources section",
        ));
    }
    (citations, errors)
}

/// Full verification against the repository: parse the Sources section, then
/// check every structurally valid citation for containment, existence, and
/// line bounds. `valid` requires zero errors and at least one citation.
pub fn verify_answer(markdown: &str, repo_root: &Path) -> Verification {
    let (parsed, mut errors) = parse_citations(markdown);

    let mut citations = Vec::new();
    for citation in parsed {
        let reference = format!(
            "`{}`:{}-{}",
            citation.path, citation.start_line, citation.end_line
        );
        match check_on_disk(&citation, repo_root) {
            Ok(()) => citations.push(citation),
            Err(reason) => errors.push(VerifyError::new(reference, reason)),
        }
    }

    Verification {
        valid: errors.is_empty() && !citations.is_empty(),
        citations,
        errors,
    }
}

/// Resolve a repository-relative path, enforcing that the canonical result
/// stays inside the canonical repository root. Rejects absolute paths and
/// `..` components before touching the filesystem, so an escaping citation
/// never causes a stat or read outside the root.
pub fn resolve_in_repo(repo_root: &Path, rel_path: &str) -> Result<std::path::PathBuf, String> {
    let candidate = Path::new(rel_path);
    if candidate.is_absolute() {
        return Err("path outside repository".to_string());
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err("path outside repository".to_string());
    }

    let joined = repo_root.join(candidate);
    let canonical_root = fs::canonicalize(repo_root)
        .map_err(|_| "repository root not accessible".to_string())?;
    let canonical = fs::canonicalize(&joined).map_err(|_| "file not found".to_string())?;
    if !canonical.starts_with(&canonical_root) {
        return Err("path outside repository".to_string());
    }
    Ok(canonical)
}

fn check_on_disk(citation: &Citation, repo_root: &Path) -> Result<(), String> {
    let full = resolve_in_repo(repo_root, &citation.path)?;
    if !full.is_file() {
        return Err("file not found".to_string());
    }
    let content = fs::read_to_string(&full).map_err(|e| format!("unreadable file: {e}"))?;
    let line_count = content.lines().count() as u64;
    if citation.start_line > line_count {
        return Err(format!(
            "start line {} exceeds file length {line_count}",
            citation.start_line
        ));
    }
    if citation.end_line > line_count {
        return Err(format!(
            "end line {} exceeds file length {line_count}",
            citation.end_line
        ));
    }
    Ok(())
}

/// Render citations as a Sources section body (inverse of `parse_citations`).
pub fn render_sources(citations: &[Citation]) -> String {
    let mut out = String::from("## Sources\n");
    for citation in citations {
        out.push_str(&citation.render());
        out.push('\n');
    }
    out
}
