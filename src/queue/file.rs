//! JSON-document stage queue.
//!
//! All five stage lists live in one document which is rewritten through a
//! temp file and a rename, so every stage change reaches disk as a single
//! atomic replace: a crash leaves either the old or the new document. The
//! in-memory copy is only updated after the write succeeded.
//!
//! One process owns a document at a time; concurrency is between tasks of
//! that process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{ItemUpdate, StageCounts, StageLists, StageQueue};
use crate::error::{QueueError, QueueResult};
use crate::item::{Item, Stage};

#[derive(Debug)]
pub struct FileStageQueue {
    path: PathBuf,
    lists: Mutex<StageLists>,
}

impl FileStageQueue {
    /// Load the document at `path`, or start empty if it does not exist yet.
    /// A document that exists but cannot be parsed is an error; it is never
    /// silently replaced.
    pub async fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref().to_path_buf();
        let lists = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StageLists>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StageLists::default(),
            Err(e) => {
                return Err(QueueError::Unavailable(format!(
                    "reading {}: {e}",
                    path.display()
                )))
            }
        };
        let counts = lists.counts();
        tracing::info!(
            target: "queue",
            path = %path.display(),
            pending = counts.pending,
            processing = counts.processing,
            completed = counts.completed,
            error = counts.error,
            failed = counts.failed,
            "stage queue opened"
        );
        Ok(Self {
            path,
            lists: Mutex::new(lists),
        })
    }

    async fn persist(&self, lists: &StageLists) -> QueueResult<()> {
        let unavailable = |e: std::io::Error| {
            QueueError::Unavailable(format!("writing {}: {e}", self.path.display()))
        };
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await.map_err(unavailable)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(lists)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(unavailable)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    /// Apply `f` to a copy of the lists; persist and commit the copy only if
    /// `dirty` says something changed.
    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut StageLists) -> R + Send,
        dirty: impl FnOnce(&R) -> bool + Send,
    ) -> QueueResult<R>
    where
        R: Send,
    {
        let mut guard = self.lists.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next);
        if dirty(&out) {
            self.persist(&next).await?;
            *guard = next;
        }
        Ok(out)
    }
}

#[async_trait]
impl StageQueue for FileStageQueue {
    async fn push(&self, stage: Stage, item: Item) -> QueueResult<()> {
        self.mutate(|l| l.push(stage, item), |r| r.is_ok()).await?
    }

    async fn pop(&self, stage: Stage) -> QueueResult<Option<Item>> {
        self.mutate(|l| l.pop(stage), Option::is_some).await
    }

    async fn pop_into(
        &self,
        from: Stage,
        to: Stage,
        update: ItemUpdate<'_>,
    ) -> QueueResult<Option<Item>> {
        self.mutate(|l| l.pop_into(from, to, update), Option::is_some)
            .await
    }

    async fn list(&self, stage: Stage, limit: usize) -> QueueResult<Vec<Item>> {
        Ok(self.lists.lock().await.snapshot(stage, limit))
    }

    async fn move_item(&self, item: &Item, from: Stage, to: Stage) -> QueueResult<bool> {
        self.mutate(|l| l.move_item(item, from, to), |moved| *moved)
            .await
    }

    async fn get(&self, id: &str) -> QueueResult<Option<Item>> {
        Ok(self.lists.lock().await.find(id).cloned())
    }

    async fn counts(&self) -> QueueResult<StageCounts> {
        Ok(self.lists.lock().await.counts())
    }

    async fn purge(&self, stage: Stage, older_than: DateTime<Utc>) -> QueueResult<Vec<Item>> {
        self.mutate(|l| l.purge(stage, older_than), |gone| !gone.is_empty())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        {
            let q = FileStageQueue::open(&path).await.unwrap();
            q.push(Stage::Pending, Item::new("a", json!({ "title": "X" }), Utc::now()))
                .await
                .unwrap();
            q.push(Stage::Pending, Item::new("b", json!({}), Utc::now()))
                .await
                .unwrap();
            let claimed = q
                .pop_into(Stage::Pending, Stage::Processing, &|it: &mut Item| {
                    it.attempts += 1
                })
                .await
                .unwrap()
                .unwrap();
            assert_eq!(claimed.id, "a");
        }

        let q = FileStageQueue::open(&path).await.unwrap();
        let counts = q.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 1);
        let a = q.get("a").await.unwrap().unwrap();
        assert_eq!(a.stage, Stage::Processing);
        assert_eq!(a.attempts, 1);
        assert_eq!(a.payload["title"], "X");
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error_not_an_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(FileStageQueue::open(&path).await.is_err());
    }

    #[tokio::test]
    async fn failed_write_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let q = FileStageQueue::open(state_dir.join("queue.json")).await.unwrap();
        // A regular file where the state directory should be makes every write fail.
        std::fs::write(&state_dir, b"x").unwrap();

        let err = q
            .push(Stage::Pending, Item::new("a", json!({}), Utc::now()))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(q.counts().await.unwrap().total(), 0);
    }
}
