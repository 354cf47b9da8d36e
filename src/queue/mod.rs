//! # Stage Queue
//! One ordered list per stage behind a single injected interface.
//!
//! Both backends share [`StageLists`], which implements every operation as a
//! plain synchronous mutation. Each backend runs those mutations under one
//! lock covering all five lists, so a move is never half-applied and no two
//! poppers can receive the same item.

mod file;
mod memory;

pub use file::FileStageQueue;
pub use memory::MemoryStageQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{QueueError, QueueResult};
use crate::item::{Item, Stage};

/// Mutation applied to an item while it changes stage.
pub type ItemUpdate<'a> = &'a (dyn Fn(&mut Item) + Send + Sync);

/// Number of items in every stage, taken from one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
    pub failed: usize,
}

impl StageCounts {
    pub fn get(&self, stage: Stage) -> usize {
        match stage {
            Stage::Pending => self.pending,
            Stage::Processing => self.processing,
            Stage::Completed => self.completed,
            Stage::Error => self.error,
            Stage::Failed => self.failed,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.error + self.failed
    }
}

/// Persistent per-stage lists.
///
/// Ordering is FIFO within a stage on a best-effort basis; consumers must not
/// rely on arrival order across concurrent producers.
#[async_trait]
pub trait StageQueue: Send + Sync {
    /// Append to the tail of `stage`. Fails with `Invalid` if an item with the
    /// same id is already queued in any stage.
    async fn push(&self, stage: Stage, item: Item) -> QueueResult<()>;

    /// Remove and return the head of `stage`.
    async fn pop(&self, stage: Stage) -> QueueResult<Option<Item>>;

    /// Atomically pop the head of `from`, apply `update`, and append it to `to`.
    async fn pop_into(
        &self,
        from: Stage,
        to: Stage,
        update: ItemUpdate<'_>,
    ) -> QueueResult<Option<Item>>;

    /// Snapshot of up to `limit` items from the head of `stage` (0 = all).
    async fn list(&self, stage: Stage, limit: usize) -> QueueResult<Vec<Item>>;

    /// Atomically move `item` from `from` to `to`, storing the caller's copy.
    ///
    /// The stored entry must match `item` by id and claim generation
    /// (`attempts`). If it does not, nothing changes and `false` is returned:
    /// somebody else already moved it.
    async fn move_item(&self, item: &Item, from: Stage, to: Stage) -> QueueResult<bool>;

    /// Look an item up by id across all stages.
    async fn get(&self, id: &str) -> QueueResult<Option<Item>>;

    async fn counts(&self) -> QueueResult<StageCounts>;

    /// Remove items of `stage` whose `updated_at` is older than `older_than`,
    /// returning them for archival.
    async fn purge(&self, stage: Stage, older_than: DateTime<Utc>) -> QueueResult<Vec<Item>>;
}

pub type DynStageQueue = Arc<dyn StageQueue>;

/// The five named collections, as persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageLists {
    #[serde(default)]
    pub pending: VecDeque<Item>,
    #[serde(default)]
    pub processing: VecDeque<Item>,
    #[serde(default)]
    pub completed: VecDeque<Item>,
    #[serde(default)]
    pub error: VecDeque<Item>,
    #[serde(default)]
    pub failed: VecDeque<Item>,
}

impl StageLists {
    fn list(&self, stage: Stage) -> &VecDeque<Item> {
        match stage {
            Stage::Pending => &self.pending,
            Stage::Processing => &self.processing,
            Stage::Completed => &self.completed,
            Stage::Error => &self.error,
            Stage::Failed => &self.failed,
        }
    }

    fn list_mut(&mut self, stage: Stage) -> &mut VecDeque<Item> {
        match stage {
            Stage::Pending => &mut self.pending,
            Stage::Processing => &mut self.processing,
            Stage::Completed => &mut self.completed,
            Stage::Error => &mut self.error,
            Stage::Failed => &mut self.failed,
        }
    }

    pub(crate) fn find(&self, id: &str) -> Option<&Item> {
        Stage::ALL
            .iter()
            .find_map(|s| self.list(*s).iter().find(|it| it.id == id))
    }

    pub(crate) fn push(&mut self, stage: Stage, mut item: Item) -> QueueResult<()> {
        if self.find(&item.id).is_some() {
            return Err(QueueError::Invalid(format!(
                "item {} is already queued",
                item.id
            )));
        }
        item.stage = stage;
        self.list_mut(stage).push_back(item);
        Ok(())
    }

    pub(crate) fn pop(&mut self, stage: Stage) -> Option<Item> {
        self.list_mut(stage).pop_front()
    }

    pub(crate) fn pop_into(
        &mut self,
        from: Stage,
        to: Stage,
        update: ItemUpdate<'_>,
    ) -> Option<Item> {
        let mut item = self.list_mut(from).pop_front()?;
        update(&mut item);
        item.stage = to;
        self.list_mut(to).push_back(item.clone());
        Some(item)
    }

    pub(crate) fn snapshot(&self, stage: Stage, limit: usize) -> Vec<Item> {
        let take = if limit == 0 { usize::MAX } else { limit };
        self.list(stage).iter().take(take).cloned().collect()
    }

    pub(crate) fn move_item(&mut self, item: &Item, from: Stage, to: Stage) -> bool {
        let src = self.list_mut(from);
        let Some(pos) = src
            .iter()
            .position(|it| it.id == item.id && it.attempts == item.attempts)
        else {
            return false;
        };
        src.remove(pos);
        let mut moved = item.clone();
        moved.stage = to;
        self.list_mut(to).push_back(moved);
        true
    }

    pub(crate) fn counts(&self) -> StageCounts {
        StageCounts {
            pending: self.pending.len(),
            processing: self.processing.len(),
            completed: self.completed.len(),
            error: self.error.len(),
            failed: self.failed.len(),
        }
    }

    pub(crate) fn purge(&mut self, stage: Stage, older_than: DateTime<Utc>) -> Vec<Item> {
        let list = self.list_mut(stage);
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(list.len());
        for it in list.drain(..) {
            if it.updated_at < older_than {
                removed.push(it);
            } else {
                kept.push_back(it);
            }
        }
        *list = kept;
        removed
    }
}
