//! Per-key pipeline tables: FIFO queues, the bounded built-artifact
//! queue with producer backpressure, emergency lanes, and task latches.

use graphforge_builder::{Callable, Module};
use graphforge_graph::SubgraphKey;
use graphforge_pool::SharedFuture;
use graphforge_space::RealizedSchedule;
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A schedule paired with its pending compilation.
pub struct FutureEntry {
    pub schedule: RealizedSchedule,
    pub module: SharedFuture<Module>,
}

/// A compiled artifact awaiting evaluation.
#[derive(Clone)]
pub struct BuiltArtifact {
    pub schedule: RealizedSchedule,
    pub module: Module,
    pub callable: Callable,
}

/// The best artifact seen for a key. Replaced only on strict GFLOPS
/// improvement.
#[derive(Clone)]
pub struct BestRecord {
    pub schedule: RealizedSchedule,
    pub module: Module,
    pub callable: Callable,
    pub gflops: f64,
    pub elapsed_ms: f64,
}

/// Unbounded per-key FIFO guarded by one mutex for the whole table.
pub struct KeyedQueue<T> {
    inner: Mutex<HashMap<SubgraphKey, VecDeque<T>>>,
}

impl<T> Default for KeyedQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> KeyedQueue<T> {
    pub fn push(&self, key: SubgraphKey, item: T) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entry(key).or_default().push_back(item);
    }

    pub fn pop(&self, key: SubgraphKey) -> Option<T> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get_mut(&key)?.pop_front()
    }

    pub fn len(&self, key: SubgraphKey) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(&key).map_or(0, |q| q.len())
    }

    pub fn is_empty(&self, key: SubgraphKey) -> bool {
        self.len(key) == 0
    }
}

/// Capacity of each per-key built-artifact queue.
pub const BUILT_QUEUE_CAPACITY: usize = 1000;

/// Bounded per-key FIFO: the producer blocks once a key's queue is full
/// and resumes when the consumer drains it. `push_blocking` polls the
/// abort predicate so a cancelled task cannot strand the producer.
pub struct BoundedKeyedQueue {
    inner: Mutex<HashMap<SubgraphKey, VecDeque<BuiltArtifact>>>,
    drained: Condvar,
    capacity: usize,
}

impl Default for BoundedKeyedQueue {
    fn default() -> Self {
        Self::with_capacity(BUILT_QUEUE_CAPACITY)
    }
}

impl BoundedKeyedQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Push, waiting while the key's queue is at capacity. Returns false
    /// if `abort` turned true before space opened up.
    pub fn push_blocking(
        &self,
        key: SubgraphKey,
        artifact: BuiltArtifact,
        abort: &dyn Fn() -> bool,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let queue = inner.entry(key).or_default();
            if queue.len() < self.capacity {
                queue.push_back(artifact);
                return true;
            }
            if abort() {
                return false;
            }
            let (guard, _) = self
                .drained
                .wait_timeout(inner, Duration::from_millis(20))
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
    }

    pub fn pop(&self, key: SubgraphKey) -> Option<BuiltArtifact> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let popped = inner.get_mut(&key)?.pop_front();
        if popped.is_some() {
            self.drained.notify_all();
        }
        popped
    }

    pub fn len(&self, key: SubgraphKey) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(&key).map_or(0, |q| q.len())
    }

    pub fn is_empty(&self, key: SubgraphKey) -> bool {
        self.len(key) == 0
    }
}

/// The singleton best-record slot per key.
#[derive(Default)]
pub struct BestTable {
    inner: Mutex<HashMap<SubgraphKey, BestRecord>>,
}

impl BestTable {
    pub fn get(&self, key: SubgraphKey) -> Option<BestRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(&key).cloned()
    }

    /// Install `record` when the slot is empty or strictly improved.
    /// Returns true when the slot changed.
    pub fn replace_if_better(&self, key: SubgraphKey, record: BestRecord) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get(&key) {
            Some(current) if record.gflops <= current.gflops => false,
            _ => {
                inner.insert(key, record);
                true
            }
        }
    }

    /// Unconditional install, used when preloading reference schedules.
    pub fn force_set(&self, key: SubgraphKey, record: BestRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(key, record);
    }

    pub fn contains(&self, key: SubgraphKey) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.contains_key(&key)
    }
}

/// Multi-producer, single-consumer key lane for urgent rescheduling.
#[derive(Default)]
pub struct EmergencyQueue {
    inner: Mutex<VecDeque<SubgraphKey>>,
}

impl EmergencyQueue {
    pub fn push(&self, key: SubgraphKey) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.push_back(key);
    }

    pub fn pop(&self) -> Option<SubgraphKey> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pop_front()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mutex-guarded boolean latch per task id (finish, cached-all).
#[derive(Default)]
pub struct TaskLatch {
    inner: Mutex<HashMap<usize, bool>>,
}

impl TaskLatch {
    pub fn get(&self, task_id: usize) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(&task_id).copied().unwrap_or(false)
    }

    pub fn set(&self, task_id: usize, value: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(task_id, value);
    }
}
