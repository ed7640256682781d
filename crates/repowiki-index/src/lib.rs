use anyhow::Result;
use ignore::WalkBuilder;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use repowiki_core::{index_db_path, runtime_dir};

/// Directory names never descended into, in addition to any component
/// beginning with `.`.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "dist",
    ".git",
    ".next",
    ".nuxt",
    "coverage",
    "__pycache__",
    ".venv",
    "venv",
];

/// Closed set of text/code extensions eligible for indexing.
const TEXT_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "py", "rs", "go", "java", "c", "cpp", "h", "hpp", "md", "json",
    "yaml", "yml", "toml",
];

const MIGRATIONS: &str = "
    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY,
        path TEXT NOT NULL UNIQUE,
        content TEXT NOT NULL,
        last_modified_ms INTEGER NOT NULL,
        content_sha256 TEXT NOT NULL
    );
    CREATE VIRTUAL TABLE IF NOT EXISTS files_fts USING fts5(
        content,
        content='files',
        content_rowid='id'
    );
    CREATE TRIGGER IF NOT EXISTS files_ai AFTER INSERT ON files BEGIN
        INSERT INTO files_fts(rowid, content) VALUES (new.id, new.content);
    END;
    CREATE TRIGGER IF NOT EXISTS files_ad AFTER DELETE ON files BEGIN
        INSERT INTO files_fts(files_fts, rowid, content)
        VALUES ('delete', old.id, old.content);
    END;
    CREATE TRIGGER IF NOT EXISTS files_au AFTER UPDATE ON files BEGIN
        INSERT INTO files_fts(files_fts, rowid, content)
        VALUES ('delete', old.id, old.content);
        INSERT INTO files_fts(rowid, content) VALUES (new.id, new.content);
    END;
";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub indexed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: String,
    pub score: f64,
    pub snippet: String,
    pub start_line: u64,
    pub end_line: u64,
}

#[derive(Debug, Clone)]
pub struct FileRow {
    pub id: i64,
    pub path: String,
    pub content: String,
    pub last_modified_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStatus {
    pub files: u64,
    pub db_bytes: u64,
    /// Files on disk newer than their indexed copy.
    pub stale: u64,
}

/// Persistent full-text index of the repository at
/// `<repoRoot>/.repo-wiki/index.db`. The primary `files` table and the
/// `files_fts` virtual table are kept consistent by triggers, so reads from
/// the full-text side always reflect the primary.
pub struct IndexService {
    repo_root: PathBuf,
    conn: Connection,
    extra_skip_dirs: Vec<String>,
}

impl IndexService {
    pub fn open(repo_root: &Path) -> Result<Self> {
        fs::create_dir_all(runtime_dir(repo_root))?;
        let conn = Connection::open(index_db_path(repo_root))?;
        conn.execute_batch(MIGRATIONS)?;
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            conn,
            extra_skip_dirs: Vec::new(),
        })
    }

    /// Skip additional directory names during indexing (from configuration).
    pub fn with_extra_skip_dirs(mut self, dirs: Vec<String>) -> Self {
        self.extra_skip_dirs = dirs;
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Close the backing database handle. Dropping the service closes it too;
    /// this variant surfaces close errors.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| err.into())
    }

    /// Walk the tree and transactionally upsert every eligible file.
    /// Unchanged files (same content hash) are left alone but still counted
    /// as indexed; unreadable files increment `skipped`. Rows whose files
    /// vanished are deleted.
    pub fn index_repository(&mut self) -> Result<IndexStats> {
        let mut stats = IndexStats::default();
        let paths = eligible_files(&self.repo_root, &self.extra_skip_dirs);

        let tx = self.conn.transaction()?;
        let mut seen: HashSet<String> = HashSet::with_capacity(paths.len());
        for path in paths {
            let rel = match path.strip_prefix(&self.repo_root) {
                Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(_) => {
                    stats.skipped += 1;
                    continue;
                }
            };
            seen.insert(rel.clone());

            let hash = format!("{:x}", Sha256::digest(content.as_bytes()));
            let existing: Option<String> = tx
                .query_row(
                    "SELECT content_sha256 FROM files WHERE path = ?1",
                    [&rel],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.as_deref() == Some(hash.as_str()) {
                stats.indexed += 1;
                continue;
            }

            let modified_ms = file_mtime_ms(&path).unwrap_or(0);
            tx.execute(
                "INSERT INTO files (path, content, last_modified_ms, content_sha256)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET
                     content = excluded.content,
                     last_modified_ms = excluded.last_modified_ms,
                     content_sha256 = excluded.content_sha256",
                params![rel, content, modified_ms, hash],
            )?;
            stats.indexed += 1;
        }

        // Remove rows for files no longer on disk.
        let stored: Vec<String> = {
            let mut stmt = tx.prepare("SELECT path FROM files")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for path in stored {
            if !seen.contains(&path) {
                tx.execute("DELETE FROM files WHERE path = ?1", [&path])?;
            }
        }

        tx.commit()?;
        Ok(stats)
    }

    /// Full-text search: whitespace tokens, quotes stripped, tokens OR'd
    /// (each quoted to suppress FTS operator metacharacters), ranked by
    /// bm25 where lower raw rank is better; the reported score is `|rank|`.
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let match_expr = tokens
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut stmt = self.conn.prepare(
            "SELECT f.path, f.content, bm25(files_fts) AS rank
             FROM files_fts
             JOIN files f ON f.id = files_fts.rowid
             WHERE files_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![match_expr, top_k as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (path, content, rank) = row?;
            let (start_line, end_line, snippet) = snippet_around_focus(&content, &tokens);
            hits.push(SearchHit {
                path,
                score: rank.abs(),
                snippet,
                start_line,
                end_line,
            });
        }
        Ok(hits)
    }

    /// Indexed paths beginning with `prefix`; an optional glob is converted
    /// (`*` → `%`, `?` → `_`) and applied as a trailing match.
    pub fn list_files(&self, prefix: &str, glob: Option<&str>) -> Result<Vec<String>> {
        let like_glob = glob.map(|g| format!("%{}", g.replace('*', "%").replace('?', "_")));
        let mut stmt = self.conn.prepare(
            "SELECT path FROM files
             WHERE path LIKE ?1 || '%' AND (?2 IS NULL OR path LIKE ?2)
             ORDER BY path",
        )?;
        let rows = stmt.query_map(params![prefix, like_glob], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn read_file(&self, path: &str) -> Result<Option<FileRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, path, content, last_modified_ms FROM files WHERE path = ?1",
                [path],
                |row| {
                    Ok(FileRow {
                        id: row.get(0)?,
                        path: row.get(1)?,
                        content: row.get(2)?,
                        last_modified_ms: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn file_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Freshness report: row count, database size, and how many files on
    /// disk have a newer mtime than their indexed copy.
    pub fn status(&self) -> Result<IndexStatus> {
        let files = self.file_count()?;
        let db_bytes = fs::metadata(index_db_path(&self.repo_root))
            .map(|m| m.len())
            .unwrap_or(0);

        let mut stale = 0u64;
        let mut stmt = self
            .conn
            .prepare("SELECT path, last_modified_ms FROM files")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (path, indexed_ms) = row?;
            let on_disk = self.repo_root.join(&path);
            match file_mtime_ms(&on_disk) {
                Some(ms) if ms > indexed_ms => stale += 1,
                Some(_) => {}
                None => stale += 1,
            }
        }
        Ok(IndexStatus {
            files,
            db_bytes,
            stale,
        })
    }
}

fn tokenize(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|t| t.replace(['"', '\''], ""))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Pick the focus line by counting case-folded query-term occurrences per
/// line (highest count wins, earliest-first on ties) and return the snippet
/// spanning `[max(1, focus-5), min(lineCount, focus+15)]`.
fn snippet_around_focus(content: &str, tokens: &[String]) -> (u64, u64, String) {
    let lines: Vec<&str> = content.lines().collect();
    let line_count = lines.len().max(1) as u64;
    let folded: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();

    let mut focus: u64 = 1;
    let mut best = 0usize;
    for (idx, line) in lines.iter().enumerate() {
        let lower = line.to_lowercase();
        let count: usize = folded.iter().map(|t| lower.matches(t.as_str()).count()).sum();
        if count > best {
            best = count;
            focus = idx as u64 + 1;
        }
    }

    let start = focus.saturating_sub(5).max(1);
    let end = (focus + 15).min(line_count);
    let snippet = lines[(start - 1) as usize..end as usize].join("\n");
    (start, end, snippet)
}

fn file_mtime_ms(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(since_epoch.as_millis() as i64)
}

fn eligible_files(repo_root: &Path, extra_skip_dirs: &[String]) -> Vec<PathBuf> {
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
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(repo_root) else {
            continue;
        };
        let components: Vec<_> = rel.components().collect();
        let dir_components = &components[..components.len().saturating_sub(1)];
        if dir_components.iter().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            name.starts_with('.')
                || SKIP_DIRS.contains(&name.as_ref())
                || extra_skip_dirs.iter().any(|d| d.as_str() == name.as_ref())
        }) {
            continue;
        }
        if !has_eligible_extension(path) {
            continue;
        }
        out.push(path.to_path_buf());
    }
    out.sort();
    out
}

fn has_eligible_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| TEXT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        fs::write(
            dir.path().join("src/parser.ts"),
            "export function parseQuery(input: string) {\n  return input.trim();\n}\n",
        )
        .expect("seed");
        fs::write(
            dir.path().join("src/render.ts"),
            "export function renderAnswer(answer: string) {\n  return answer;\n}\n",
        )
        .expect("seed");
        fs::write(dir.path().join("README.md"), "# demo\n\nA parser demo.\n").expect("seed");
        dir
    }

    #[test]
    fn index_counts_eligible_files() {
        let dir = seed_repo();
        let mut svc = IndexService::open(dir.path()).expect("open");
        let stats = svc.index_repository().expect("index");
        assert_eq!(stats.indexed, 3);
        assert_eq!(stats.skipped, 0);
        assert_eq!(svc.file_count().expect("count"), 3);
    }

    #[test]
    fn skip_dirs_and_unknown_extensions_excluded() {
        let dir = seed_repo();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).expect("mkdir");
        fs::write(dir.path().join("node_modules/pkg/index.js"), "x\n").expect("seed");
        fs::create_dir_all(dir.path().join(".git")).expect("mkdir");
        fs::write(dir.path().join(".git/config.json"), "{}\n").expect("seed");
        fs::write(dir.path().join("photo.png"), [0u8, 1, 2]).expect("seed");

        let mut svc = IndexService::open(dir.path()).expect("open");
        svc.index_repository().expect("index");
        let paths = svc.list_files("", None).expect("list");
        assert_eq!(paths.len(), 3);
        assert!(paths.iter().all(|p| !p.contains("node_modules")));
        assert!(paths.iter().all(|p| !p.contains(".git")));
    }

    #[test]
    fn extra_skip_dirs_are_honored() {
        let dir = seed_repo();
        fs::create_dir_all(dir.path().join("vendor")).expect("mkdir");
        fs::write(dir.path().join("vendor/big.js"), "x\n").expect("seed");

        let mut svc = IndexService::open(dir.path())
            .expect("open")
            .with_extra_skip_dirs(vec!["vendor".to_string()]);
        svc.index_repository().expect("index");
        assert!(svc.read_file("vendor/big.js").expect("read").is_none());
        assert_eq!(svc.file_count().expect("count"), 3);
    }

    #[test]
    fn search_returns_ranked_hit_with_snippet_range() {
        let dir = seed_repo();
        let mut svc = IndexService::open(dir.path()).expect("open");
        svc.index_repository().expect("index");

        let hits = svc.search("parseQuery", 10).expect("search");
        assert_eq!(hits.len(), 1);
        let hit = &hits[0];
        assert_eq!(hit.path, "src/parser.ts");
        assert!(hit.score >= 0.0);
        assert_eq!(hit.start_line, 1);
        assert!(hit.end_line <= 3);
        assert!(hit.snippet.contains("parseQuery"));
    }

    #[test]
    fn search_with_only_stop_characters_returns_zero_hits() {
        let dir = seed_repo();
        let mut svc = IndexService::open(dir.path()).expect("open");
        svc.index_repository().expect("index");

        assert!(svc.search("\"\"  '' ", 10).expect("search").is_empty());
        assert!(svc.search("   ", 10).expect("search").is_empty());
    }

    #[test]
    fn search_tokens_are_ored() {
        let dir = seed_repo();
        let mut svc = IndexService::open(dir.path()).expect("open");
        svc.index_repository().expect("index");

        let hits = svc.search("parseQuery renderAnswer", 10).expect("search");
        let paths: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
        assert!(paths.contains(&"src/parser.ts"));
        assert!(paths.contains(&"src/render.ts"));
    }

    #[test]
    fn list_files_prefix_and_glob() {
        let dir = seed_repo();
        let mut svc = IndexService::open(dir.path()).expect("open");
        svc.index_repository().expect("index");

        let all = svc.list_files("src/", None).expect("list");
        assert_eq!(all.len(), 2);

        let ts_only = svc.list_files("", Some("*.ts")).expect("list");
        assert_eq!(ts_only.len(), 2);

        let parser = svc.list_files("src/", Some("parser.*")).expect("list");
        assert_eq!(parser, vec!["src/parser.ts".to_string()]);
    }

    #[test]
    fn reindex_picks_up_changes_and_deletions() {
        let dir = seed_repo();
        let mut svc = IndexService::open(dir.path()).expect("open");
        svc.index_repository().expect("index");

        fs::write(
            dir.path().join("src/parser.ts"),
            "export function parseQueryV2() {}\n",
        )
        .expect("rewrite");
        fs::remove_file(dir.path().join("src/render.ts")).expect("remove");
        svc.index_repository().expect("reindex");

        assert_eq!(svc.file_count().expect("count"), 2);
        let row = svc
            .read_file("src/parser.ts")
            .expect("read")
            .expect("row present");
        assert!(row.content.contains("parseQueryV2"));
        assert!(svc.read_file("src/render.ts").expect("read").is_none());
        assert!(svc.search("parseQueryV2", 5).expect("search").len() == 1);
    }

    #[test]
    fn read_file_missing_is_none() {
        let dir = seed_repo();
        let mut svc = IndexService::open(dir.path()).expect("open");
        svc.index_repository().expect("index");
        assert!(svc.read_file("src/absent.ts").expect("read").is_none());
    }
}
