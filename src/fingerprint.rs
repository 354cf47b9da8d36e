//! # Fingerprint Store
//! Stable identity for content items and the append-only "seen" set used by
//! producers to suppress duplicates.
//!
//! The fingerprint is a SHA-256 over the canonicalized title and source link.
//! Missing fields are treated as empty strings, never as errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

use crate::error::{QueueError, QueueResult};
use crate::item::payload_str;

pub const TITLE_FIELD: &str = "title";
pub const LINK_FIELD: &str = "link";

/// Canonical form of a title: entities decoded, tags stripped, whitespace
/// collapsed, lowercased.
pub fn canonical_title(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    let stripped = re_tags.replace_all(&decoded, "");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("ws regex"));
    re_ws.replace_all(&stripped, " ").trim().to_lowercase()
}

/// Canonical form of a link: trimmed, trailing slashes dropped, scheme and
/// host lowercased.
pub fn canonical_link(s: &str) -> String {
    let t = s.trim().trim_end_matches('/');
    match t.find("://") {
        Some(i) => {
            let rest = &t[i + 3..];
            let host_end = rest.find('/').unwrap_or(rest.len());
            format!(
                "{}://{}{}",
                t[..i].to_ascii_lowercase(),
                rest[..host_end].to_ascii_lowercase(),
                &rest[host_end..]
            )
        }
        None => t.to_string(),
    }
}

/// Hex SHA-256 of the canonical title and link.
pub fn fingerprint(payload: &Value) -> String {
    let title = canonical_title(payload_str(payload, TITLE_FIELD));
    let link = canonical_link(payload_str(payload, LINK_FIELD));

    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0x1f]);
    hasher.update(link.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Append-only set of fingerprints.
///
/// Entries are never removed, so a dedup decision made once stays stable for
/// the lifetime of the store.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Pure lookup.
    async fn contains(&self, fp: &str) -> QueueResult<bool>;

    /// Record a fingerprint. Returns `true` if it was not present before;
    /// recording an existing fingerprint is a no-op returning `false`.
    async fn insert(&self, fp: &str) -> QueueResult<bool>;

    async fn is_duplicate(&self, payload: &Value) -> QueueResult<bool> {
        self.contains(&fingerprint(payload)).await
    }

    async fn mark_seen(&self, payload: &Value) -> QueueResult<bool> {
        self.insert(&fingerprint(payload)).await
    }
}

#[derive(Debug, Default)]
pub struct MemoryFingerprintStore {
    seen: Mutex<HashSet<String>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("fingerprint mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn contains(&self, fp: &str) -> QueueResult<bool> {
        Ok(self
            .seen
            .lock()
            .expect("fingerprint mutex poisoned")
            .contains(fp))
    }

    async fn insert(&self, fp: &str) -> QueueResult<bool> {
        Ok(self
            .seen
            .lock()
            .expect("fingerprint mutex poisoned")
            .insert(fp.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SeenLine {
    fp: String,
    seen_at: DateTime<Utc>,
}

/// JSON-lines file, one fingerprint per line. New fingerprints are appended;
/// the file is never rewritten.
#[derive(Debug)]
pub struct FileFingerprintStore {
    path: PathBuf,
    seen: tokio::sync::Mutex<SeenSet>,
}

#[derive(Debug, Default)]
struct SeenSet {
    fps: HashSet<String>,
    /// The file may end in a partial line; the next append starts a fresh one.
    torn_tail: bool,
}

impl FileFingerprintStore {
    /// Open (or create on first insert) the store at `path`. Unreadable lines
    /// are skipped with a warning rather than failing the whole load.
    pub async fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut seen = HashSet::new();
        let mut torn_tail = false;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                torn_tail = !content.is_empty() && !content.ends_with('\n');
                for (n, line) in content.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<SeenLine>(line) {
                        Ok(l) => {
                            seen.insert(l.fp);
                        }
                        Err(e) => tracing::warn!(
                            target: "producer",
                            path = %path.display(),
                            line = n + 1,
                            error = %e,
                            "skipping unreadable fingerprint line"
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(QueueError::Unavailable(format!(
                    "reading {}: {e}",
                    path.display()
                )))
            }
        }
        tracing::debug!(
            target: "producer",
            path = %path.display(),
            count = seen.len(),
            "fingerprints loaded"
        );
        Ok(Self {
            path,
            seen: tokio::sync::Mutex::new(SeenSet {
                fps: seen,
                torn_tail,
            }),
        })
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

#[async_trait]
impl FingerprintStore for FileFingerprintStore {
    async fn contains(&self, fp: &str) -> QueueResult<bool> {
        Ok(self.seen.lock().await.fps.contains(fp))
    }

    async fn insert(&self, fp: &str) -> QueueResult<bool> {
        let mut seen = self.seen.lock().await;
        if seen.fps.contains(fp) {
            return Ok(false);
        }

        let mut line = String::new();
        if seen.torn_tail {
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(&SeenLine {
            fp: fp.to_string(),
            seen_at: Utc::now(),
        })?);
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            // part of the line may have landed
            seen.torn_tail = true;
            return Err(QueueError::Unavailable(format!(
                "appending to {}: {e}",
                self.path.display()
            )));
        }

        // Only remember it once it is durable.
        seen.torn_tail = false;
        seen.fps.insert(fp.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_ignores_cosmetic_differences() {
        let a = json!({ "title": "  Hello&nbsp;<b>World</b> ", "link": "HTTPS://Example.com/a/" });
        let b = json!({ "title": "hello world", "link": "https://example.com/a" });
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_uses_only_title_and_link() {
        let a = json!({ "id": "a", "title": "X", "link": "u1", "body": "one" });
        let b = json!({ "id": "b", "title": "X", "link": "u1", "body": "two" });
        assert_eq!(fingerprint(&a), fingerprint(&b));
        let c = json!({ "title": "X", "link": "u2" });
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn missing_fields_are_empty_not_errors() {
        let fp = fingerprint(&json!({}));
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint(&json!({ "title": null, "link": "" })));
    }

    #[test]
    fn title_and_link_do_not_bleed_into_each_other() {
        let a = json!({ "title": "ab", "link": "c" });
        let b = json!({ "title": "a", "link": "bc" });
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[tokio::test]
    async fn memory_store_mark_seen_is_idempotent() {
        let store = MemoryFingerprintStore::new();
        let p = json!({ "title": "X", "link": "u1" });
        assert!(!store.is_duplicate(&p).await.unwrap());
        assert!(store.mark_seen(&p).await.unwrap());
        assert!(!store.mark_seen(&p).await.unwrap());
        assert!(store.is_duplicate(&p).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("fingerprints.jsonl");
        let p = json!({ "title": "X", "link": "u1" });

        {
            let store = FileFingerprintStore::open(&path).await.unwrap();
            assert!(store.mark_seen(&p).await.unwrap());
            assert!(!store.mark_seen(&p).await.unwrap());
        }

        let reopened = FileFingerprintStore::open(&path).await.unwrap();
        assert!(reopened.is_duplicate(&p).await.unwrap());
        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 1);
    }

    #[tokio::test]
    async fn append_after_a_torn_line_starts_a_new_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fingerprints.jsonl");
        let old = json!({ "title": "Old", "link": "u0" });
        let new = json!({ "title": "New", "link": "u1" });

        let intact = serde_json::to_string(&SeenLine {
            fp: fingerprint(&old),
            seen_at: Utc::now(),
        })
        .unwrap();
        std::fs::write(&path, format!("{intact}\n{{\"fp\":\"dead")).unwrap();

        {
            let store = FileFingerprintStore::open(&path).await.unwrap();
            assert!(store.mark_seen(&new).await.unwrap());
        }

        let reopened = FileFingerprintStore::open(&path).await.unwrap();
        assert!(reopened.is_duplicate(&old).await.unwrap());
        assert!(reopened.is_duplicate(&new).await.unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with('\n'));
        assert_eq!(content.lines().count(), 3);
    }
}
