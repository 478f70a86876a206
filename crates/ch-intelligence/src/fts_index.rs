//! SQLite FTS5 index over a project's reference documents.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use crate::knowledge::{DocumentMatch, FullTextIndex, KnowledgeError};

/// File extensions picked up by [`SqliteFtsIndex::index_directory`].
pub const INDEXED_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

impl From<tokio_rusqlite::Error> for KnowledgeError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        KnowledgeError::Index(err.to_string())
    }
}

impl From<std::io::Error> for KnowledgeError {
    fn from(err: std::io::Error) -> Self {
        KnowledgeError::Index(err.to_string())
    }
}

pub struct SqliteFtsIndex {
    conn: Connection,
}

impl SqliteFtsIndex {
    /// Open (or create) an index at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, KnowledgeError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(path.as_ref()).await?;
        let index = Self { conn };
        index.init_schema().await?;
        Ok(index)
    }

    pub async fn open_in_memory() -> Result<Self, KnowledgeError> {
        let conn = Connection::open_in_memory().await?;
        let index = Self { conn };
        index.init_schema().await?;
        Ok(index)
    }

    async fn init_schema(&self) -> Result<(), KnowledgeError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE VIRTUAL TABLE IF NOT EXISTS documents USING fts5(
                        document_id UNINDEXED,
                        title,
                        content,
                        tokenize = 'porter unicode61'
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Insert or replace one document.
    pub async fn index_document(
        &self,
        document_id: &str,
        title: &str,
        content: &str,
    ) -> Result<(), KnowledgeError> {
        let document_id = document_id.to_string();
        let title = title.to_string();
        let content = content.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM documents WHERE document_id = ?1",
                    [&document_id],
                )?;
                tx.execute(
                    "INSERT INTO documents (document_id, title, content) VALUES (?1, ?2, ?3)",
                    [&document_id, &title, &content],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Index every markdown/text file under `dir`, keyed by its relative
    /// path. Returns the number of documents indexed.
    pub async fn index_directory(&self, dir: impl AsRef<Path>) -> Result<usize, KnowledgeError> {
        let root = dir.as_ref().to_path_buf();
        let mut pending: Vec<PathBuf> = vec![root.clone()];
        let mut indexed = 0usize;

        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() || !is_indexable(&path) {
                    continue;
                }

                let content = tokio::fs::read_to_string(&path).await?;
                let document_id = relative_id(&root, &path);
                let title = document_title(&path, &content);
                self.index_document(&document_id, &title, &content).await?;
                debug!(document = %document_id, "indexed document");
                indexed += 1;
            }
        }

        info!(dir = %root.display(), indexed, "reference directory indexed");
        Ok(indexed)
    }

    pub async fn document_count(&self) -> Result<usize, KnowledgeError> {
        let count = self
            .conn
            .call(|conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(count.max(0) as usize)
    }
}

#[async_trait]
impl FullTextIndex for SqliteFtsIndex {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<DocumentMatch>, KnowledgeError> {
        let Some(expr) = match_expression(query) else {
            return Ok(Vec::new());
        };
        let limit = limit as i64;
        let matches = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT document_id,
                            snippet(documents, 2, '', '', '...', 24),
                            bm25(documents)
                     FROM documents
                     WHERE documents MATCH ?1
                     ORDER BY bm25(documents)
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![expr, limit], |row| {
                    let rank: f64 = row.get(2)?;
                    Ok(DocumentMatch {
                        document_id: row.get(0)?,
                        excerpt: row.get(1)?,
                        // bm25 is lower-is-better
                        score: -rank,
                    })
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        Ok(matches)
    }
}

/// OR of quoted query tokens, or `None` when the query has no searchable
/// terms.
pub fn match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn is_indexable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| INDEXED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn relative_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// First markdown heading, else the file stem.
fn document_title(path: &Path, content: &str) -> String {
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix('#'))
        .map(|heading| heading.trim_start_matches('#').trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
}
