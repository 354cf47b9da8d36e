//! In-memory stage queue for tests and single-process runs.
//! State is not persisted across restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

use super::{ItemUpdate, StageCounts, StageLists, StageQueue};
use crate::error::QueueResult;
use crate::item::{Item, Stage};

#[derive(Debug, Default)]
pub struct MemoryStageQueue {
    lists: Mutex<StageLists>,
}

impl MemoryStageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_lists<R>(&self, f: impl FnOnce(&mut StageLists) -> R) -> R {
        let mut guard = self.lists.lock().expect("stage queue mutex poisoned");
        f(&mut guard)
    }
}

#[async_trait]
impl StageQueue for MemoryStageQueue {
    async fn push(&self, stage: Stage, item: Item) -> QueueResult<()> {
        self.with_lists(|l| l.push(stage, item))
    }

    async fn pop(&self, stage: Stage) -> QueueResult<Option<Item>> {
        Ok(self.with_lists(|l| l.pop(stage)))
    }

    async fn pop_into(
        &self,
        from: Stage,
        to: Stage,
        update: ItemUpdate<'_>,
    ) -> QueueResult<Option<Item>> {
        Ok(self.with_lists(|l| l.pop_into(from, to, update)))
    }

    async fn list(&self, stage: Stage, limit: usize) -> QueueResult<Vec<Item>> {
        Ok(self.with_lists(|l| l.snapshot(stage, limit)))
    }

    async fn move_item(&self, item: &Item, from: Stage, to: Stage) -> QueueResult<bool> {
        Ok(self.with_lists(|l| l.move_item(item, from, to)))
    }

    async fn get(&self, id: &str) -> QueueResult<Option<Item>> {
        Ok(self.with_lists(|l| l.find(id).cloned()))
    }

    async fn counts(&self) -> QueueResult<StageCounts> {
        Ok(self.with_lists(|l| l.counts()))
    }

    async fn purge(&self, stage: Stage, older_than: DateTime<Utc>) -> QueueResult<Vec<Item>> {
        Ok(self.with_lists(|l| l.purge(stage, older_than)))
    }
}
