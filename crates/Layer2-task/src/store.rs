//! Task store
//!
//! Lookup table plus an ordered index keyed newest-first, so `list` never
//! sorts at the call site. Each task lives in a slot holding its mutable
//! record, status/cancel signals and the agent driving it.

use crate::agent::Agent;
use crate::state::TaskStatus;
use crate::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;

pub(crate) struct TaskSlot {
    pub task: Mutex<Task>,
    /// Published after every transition; `wait` subscribes here
    pub status: watch::Sender<TaskStatus>,
    pub cancel: watch::Sender<bool>,
    /// Set once a launch has been claimed (by submit, start or approve)
    pub launching: AtomicBool,
    pub agent: Arc<dyn Agent>,
}

impl TaskSlot {
    pub fn new(task: Task, agent: Arc<dyn Agent>) -> Self {
        let (status, _) = watch::channel(task.status);
        let (cancel, _) = watch::channel(false);
        Self {
            task: Mutex::new(task),
            status,
            cancel,
            launching: AtomicBool::new(false),
            agent,
        }
    }

    pub fn snapshot(&self) -> Task {
        self.task.lock().clone()
    }

    pub fn id(&self) -> TaskId {
        self.task.lock().id
    }

    /// Publish the current status to waiters
    pub fn notify(&self) {
        let status = self.task.lock().status;
        self.status.send_replace(status);
    }
}

type OrderKey = (Reverse<DateTime<Utc>>, Reverse<u64>);

#[derive(Default)]
struct Index {
    by_id: HashMap<TaskId, Arc<TaskSlot>>,
    /// Newest first; the sequence number breaks creation-time ties
    newest_first: BTreeMap<OrderKey, TaskId>,
    seq: u64,
}

#[derive(Default)]
pub(crate) struct TaskIndex {
    inner: RwLock<Index>,
}

impl TaskIndex {
    pub fn insert(&self, slot: Arc<TaskSlot>) {
        let (id, created_at) = {
            let task = slot.task.lock();
            (task.id, task.created_at)
        };
        let mut index = self.inner.write();
        index.seq += 1;
        let key = (Reverse(created_at), Reverse(index.seq));
        index.newest_first.insert(key, id);
        index.by_id.insert(id, slot);
    }

    pub fn get(&self, id: &TaskId) -> Option<Arc<TaskSlot>> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn newest_first(&self) -> Vec<Arc<TaskSlot>> {
        let index = self.inner.read();
        index
            .newest_first
            .values()
            .filter_map(|id| index.by_id.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }
}
