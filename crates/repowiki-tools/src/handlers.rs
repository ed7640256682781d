//! The built-in repository tools.
//!
//! All handlers obey two discipline rules: any computed path must resolve
//! inside the repository root (`resolve_in_repo`), and summaries are shaped
//! to stay within the caller's tool-output budget.

use crate::schema::{ArgField, ArgSchema};
use crate::{ToolContext, ToolDescriptor, ToolOutput, ToolRegistry};
use anyhow::{anyhow, Result};
use ignore::WalkBuilder;
use regex::Regex;
use repowiki_verify::resolve_in_repo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs;
use std::path::{Component, Path};
use std::sync::OnceLock;

/// Build a registry with the five built-in tools registered in their
/// canonical order.
pub fn builtin_registry(context: ToolContext) -> ToolRegistry {
    let mut registry = ToolRegistry::new(context);

    registry.register(ToolDescriptor {
        name: "search_chunks".to_string(),
        description: "Full-text search over the indexed repository; returns ranked snippets with line ranges".to_string(),
        schema: ArgSchema::new()
            .field(ArgField::string("query", "Search terms").required().non_empty())
            .field(
                ArgField::integer("topK", "Maximum number of results")
                    .range(1, 50)
                    .default_value(json!(10)),
            ),
        handler: Box::new(search_chunks),
    });

    registry.register(ToolDescriptor {
        name: "get_excerpt".to_string(),
        description: "Read a line range from a repository file, with line numbers".to_string(),
        schema: ArgSchema::new()
            .field(ArgField::string("path", "Repository-relative file path").required().non_empty())
            .field(ArgField::integer("startLine", "First line (1-based)").required().minimum(1))
            .field(ArgField::integer("endLine", "Last line (inclusive)").required().minimum(1)),
        handler: Box::new(get_excerpt),
    });

    registry.register(ToolDescriptor {
        name: "list_files".to_string(),
        description: "List repository files matching a glob pattern".to_string(),
        schema: ArgSchema::new()
            .field(ArgField::string("glob", "Glob pattern, e.g. src/**/*.ts").required().non_empty())
            .field(
                ArgField::integer("limit", "Maximum number of paths")
                    .range(1, 1000)
                    .default_value(json!(100)),
            ),
        handler: Box::new(list_files),
    });

    registry.register(ToolDescriptor {
        name: "graph_neighbors".to_string(),
        description: "Import-graph neighbors of a file, up to the given depth".to_string(),
        schema: ArgSchema::new()
            .field(ArgField::string("nodeId", "Repository-relative file path").required().non_empty())
            .field(
                ArgField::integer("depth", "Traversal depth")
                    .range(1, 5)
                    .default_value(json!(1)),
            ),
        handler: Box::new(graph_neighbors),
    });

    registry.register(ToolDescriptor {
        name: "get_repo_summary".to_string(),
        description: "Overview of the repository: file counts, languages, top directories".to_string(),
        schema: ArgSchema::new(),
        handler: Box::new(get_repo_summary),
    });

    registry
}

// ── search_chunks ───────────────────────────────────────────────────────

fn search_chunks(args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
    let query = args["query"].as_str().unwrap_or_default();
    let top_k = args["topK"].as_i64().unwrap_or(10) as usize;

    let hits = ctx.index.search(query, top_k)?;
    if hits.is_empty() {
        return Ok(ToolOutput {
            data: json!({ "hits": [] }),
            summary: format!("No results for '{query}'."),
        });
    }

    let mut summary = format!("{} result(s) for '{query}':\n", hits.len());
    for (i, hit) in hits.iter().enumerate() {
        summary.push_str(&format!(
            "[{}] {}:{}-{} (score: {:.3})\n",
            i + 1,
            hit.path,
            hit.start_line,
            hit.end_line,
            hit.score
        ));
    }
    Ok(ToolOutput {
        data: json!({ "hits": hits }),
        summary,
    })
}

// ── get_excerpt ─────────────────────────────────────────────────────────

fn get_excerpt(args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
    let path = args["path"].as_str().unwrap_or_default();
    let start_req = args["startLine"].as_i64().unwrap_or(1).max(1) as u64;
    let end_req = args["endLine"].as_i64().unwrap_or(1).max(1) as u64;

    let full = resolve_in_repo(&ctx.repo_root, path).map_err(|reason| anyhow!("{reason}: {path}"))?;
    if !full.is_file() {
        return Err(anyhow!("file not found: {path}"));
    }
    let content = fs::read_to_string(&full)?;
    let lines: Vec<&str> = content.lines().collect();
    let line_count = lines.len() as u64;

    if line_count == 0 {
        return Ok(ToolOutput {
            data: json!({
                "path": path,
                "startLine": 0,
                "endLine": 0,
                "lineCount": 0,
                "content": "",
            }),
            summary: format!("File: {path} (lines 0-0 of 0)"),
        });
    }

    let start = start_req.min(line_count);
    let mut end = end_req.min(line_count).max(start);
    // Bound the span by the excerpt budget.
    end = end.min(start + ctx.max_excerpt_lines.saturating_sub(1));

    let mut body = String::new();
    for (offset, line) in lines[(start - 1) as usize..end as usize].iter().enumerate() {
        body.push_str(&format!("{}: {line}\n", start + offset as u64));
    }
    let summary = format!("File: {path} (lines {start}-{end} of {line_count})\n{body}");

    Ok(ToolOutput {
        data: json!({
            "path": path,
            "startLine": start,
            "endLine": end,
            "lineCount": line_count,
            "content": body,
        }),
        summary,
    })
}

// ── list_files ──────────────────────────────────────────────────────────

fn list_files(args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
    let pattern = args["glob"].as_str().unwrap_or_default();
    let limit = args["limit"].as_i64().unwrap_or(100) as usize;

    let compiled = glob::Pattern::new(pattern)
        .map_err(|err| anyhow!("invalid glob pattern '{pattern}': {err}"))?;
    let options = glob::MatchOptions {
        require_literal_separator: true,
        ..glob::MatchOptions::new()
    };

    let mut files = Vec::new();
    for rel in walk_visible_files(&ctx.repo_root) {
        if compiled.matches_with(&rel, options) {
            files.push(rel);
            if files.len() >= limit {
                break;
            }
        }
    }

    let total = files.len();
    let mut summary = format!("{total} file(s) matching '{pattern}':\n");
    for path in files.iter().take(20) {
        summary.push_str(&format!("- {path}\n"));
    }
    if total > 20 {
        summary.push_str(&format!("... and {} more\n", total - 20));
    }

    Ok(ToolOutput {
        data: json!({ "files": files }),
        summary,
    })
}

// ── graph_neighbors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Neighbor {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    relation: String,
    depth: u64,
}

fn import_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*import\b[^;]*?\bfrom\s+["']([^"']+)["']"#).expect("regex")
    })
}

/// BFS over relative-import edges up to `depth`. External module imports
/// terminate a branch at the depth they are found.
fn graph_neighbors(args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
    let node_id = args["nodeId"].as_str().unwrap_or_default();
    let depth = args["depth"].as_i64().unwrap_or(1) as u64;

    resolve_in_repo(&ctx.repo_root, node_id).map_err(|reason| anyhow!("{reason}: {node_id}"))?;

    let mut neighbors: Vec<Neighbor> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut reported: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<(String, u64)> = VecDeque::new();
    visited.insert(node_id.to_string());
    queue.push_back((node_id.to_string(), 0));

    while let Some((rel, at_depth)) = queue.pop_front() {
        if at_depth >= depth {
            continue;
        }
        let Ok(content) = fs::read_to_string(ctx.repo_root.join(&rel)) else {
            continue;
        };
        let child_depth = at_depth + 1;
        for line in content.lines() {
            let Some(caps) = import_regex().captures(line) else {
                continue;
            };
            let target = &caps[1];
            if target.starts_with('.') {
                let Some(resolved) = resolve_relative_import(&ctx.repo_root, &rel, target) else {
                    continue;
                };
                if reported.insert(resolved.clone()) {
                    neighbors.push(Neighbor {
                        id: resolved.clone(),
                        kind: "file".to_string(),
                        relation: "imports".to_string(),
                        depth: child_depth,
                    });
                }
                if visited.insert(resolved.clone()) {
                    queue.push_back((resolved, child_depth));
                }
            } else if reported.insert(target.to_string()) {
                neighbors.push(Neighbor {
                    id: target.to_string(),
                    kind: "module".to_string(),
                    relation: "imports".to_string(),
                    depth: child_depth,
                });
            }
        }
    }

    let mut summary = format!("{} neighbor(s) of {node_id}:\n", neighbors.len());
    for n in &neighbors {
        summary.push_str(&format!("- {} ({}, depth {})\n", n.id, n.kind, n.depth));
    }
    if neighbors.is_empty() {
        summary = format!("No import neighbors found for {node_id}.");
    }

    Ok(ToolOutput {
        data: json!({ "nodeId": node_id, "neighbors": neighbors }),
        summary,
    })
}

/// Resolve `./x` / `../y` relative to the importing file, lexically, trying
/// the common source extensions. Returns a repo-relative path or None when
/// the target does not exist or would leave the root.
fn resolve_relative_import(repo_root: &Path, importer_rel: &str, target: &str) -> Option<String> {
    let importer_dir = Path::new(importer_rel).parent().unwrap_or(Path::new(""));
    let mut parts: Vec<String> = Vec::new();
    for component in importer_dir.components().chain(Path::new(target).components()) {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(name) => parts.push(name.to_string_lossy().to_string()),
            _ => return None,
        }
    }
    let base = parts.join("/");

    let candidates = [
        base.clone(),
        format!("{base}.ts"),
        format!("{base}.tsx"),
        format!("{base}.js"),
        format!("{base}.jsx"),
        format!("{base}/index.ts"),
        format!("{base}/index.js"),
    ];
    candidates
        .into_iter()
        .find(|candidate| repo_root.join(candidate).is_file())
}

// ── get_repo_summary ────────────────────────────────────────────────────

const LANGUAGES: &[(&str, &str)] = &[
    ("ts", "TypeScript"),
    ("tsx", "TypeScript"),
    ("js", "JavaScript"),
    ("jsx", "JavaScript"),
    ("py", "Python"),
    ("rs", "Rust"),
    ("go", "Go"),
    ("java", "Java"),
    ("c", "C"),
    ("h", "C"),
    ("cpp", "C++"),
    ("hpp", "C++"),
    ("md", "Markdown"),
    ("json", "JSON"),
    ("yaml", "YAML"),
    ("yml", "YAML"),
    ("toml", "TOML"),
];

fn language_for(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| *lang)
}

fn get_repo_summary(_args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
    let name = ctx
        .repo_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repository".to_string());

    let mut total_files = 0u64;
    let mut total_lines = 0u64;
    let mut languages: BTreeMap<&'static str, u64> = BTreeMap::new();
    for rel in walk_visible_files(&ctx.repo_root) {
        total_files += 1;
        if let Some(lang) = language_for(&rel) {
            *languages.entry(lang).or_insert(0) += 1;
            if let Ok(content) = fs::read_to_string(ctx.repo_root.join(&rel)) {
                total_lines += content.lines().count() as u64;
            }
        }
    }

    let mut top_directories: Vec<String> = fs::read_dir(&ctx.repo_root)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|dir| !dir.starts_with('.') && dir != "node_modules")
        .collect();
    top_directories.sort();
    top_directories.truncate(10);

    let description = repo_description(&ctx.repo_root);

    let language_list = languages
        .iter()
        .map(|(lang, count)| format!("{lang} ({count})"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut summary = format!(
        "Repository {name}: {total_files} files, {total_lines} lines.\nLanguages: {}.\nTop directories: {}.",
        if language_list.is_empty() { "none detected".to_string() } else { language_list },
        if top_directories.is_empty() { "none".to_string() } else { top_directories.join(", ") },
    );
    if let Some(desc) = &description {
        summary.push_str(&format!("\nDescription: {desc}"));
    }

    Ok(ToolOutput {
        data: json!({
            "name": name,
            "totalFiles": total_files,
            "totalLines": total_lines,
            "languages": languages,
            "topDirectories": top_directories,
            "description": description,
        }),
        summary,
    })
}

/// Project description: package.json `description`, else Cargo.toml
/// `[package] description`, else the first non-heading README line.
fn repo_description(repo_root: &Path) -> Option<String> {
    if let Ok(raw) = fs::read_to_string(repo_root.join("package.json")) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) {
            if let Some(desc) = value.get("description").and_then(|v| v.as_str()) {
                if !desc.is_empty() {
                    return Some(desc.to_string());
                }
            }
        }
    }
    if let Ok(raw) = fs::read_to_string(repo_root.join("Cargo.toml")) {
        if let Ok(value) = raw.parse::<toml::Value>() {
            if let Some(desc) = value
                .get("package")
                .and_then(|p| p.get("description"))
                .and_then(|v| v.as_str())
            {
                return Some(desc.to_string());
            }
        }
    }
    if let Ok(raw) = fs::read_to_string(repo_root.join("README.md")) {
        for line in raw.lines() {
            let trimmed = line.trim();
            if !trimmed.is_empty() && !trimmed.starts_with('#') {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

// ── shared walking ──────────────────────────────────────────────────────

/// Repository-relative paths of all visible files: hidden entries and
/// node_modules are skipped. Sorted for deterministic output.
fn walk_visible_files(repo_root: &Path) -> Vec<String> {
    let mut builder = WalkBuilder::new(repo_root);
    builder.standard_filters(false);
    builder.hidden(false);
    builder.follow_links(false);

    let mut out = Vec::new();
    for entry in builder.build() {
        let Ok(entry) = entry else {
            continue;
        };
        if !entry
            .file_type()
            .map(|file_type| file_type.is_file())
            .unwrap_or(false)
        {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(repo_root) else {
            continue;
        };
        if rel.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            name.starts_with('.') || name == "node_modules"
        }) {
            continue;
        }
        out.push(rel.to_string_lossy().replace('\\', "/"));
    }
    out.sort();
    out
}
