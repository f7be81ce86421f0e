//! The per-partition processing engine
//!
//! Each partition owns its values outright and is driven by exactly one
//! dedicated thread that consumes a private FIFO queue of operations. Every
//! operation on a key is therefore applied by a single thread, in arrival
//! order, without locking the value store. Different partitions run fully in
//! parallel.

use crate::error::{Error, Result};
use crate::key::EndpointId;
use crate::queue::{self, QueueReceiver, QueueSender};
use crate::server::ReplySender;
use crate::updater::ParameterUpdater;
use ahash::AHashMap;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Partition thread configuration
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Prefix of partition thread names
    pub name_prefix: String,

    /// CPU core to pin the partition thread to (None = no pinning)
    pub cpu_affinity: Option<usize>,

    /// Operation queue capacity; producers block once it is full
    pub queue_capacity: usize,

    /// Stack size for the partition thread (None = default)
    pub stack_size: Option<usize>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            name_prefix: "ps-partition".to_string(),
            cpu_affinity: None,
            queue_capacity: 4096,
            stack_size: None,
        }
    }
}

impl PartitionConfig {
    /// Create a new partition configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name prefix
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set CPU affinity
    pub fn with_cpu_affinity(mut self, cpu: usize) -> Self {
        self.cpu_affinity = Some(cpu);
        self
    }

    /// Set queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set stack size
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "partition queue capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Count of operations enqueued on any partition but not yet completed
#[derive(Debug, Default)]
pub struct PendingOps {
    count: CachePadded<AtomicUsize>,
}

impl PendingOps {
    /// Create a zeroed counter
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn complete(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Current number of outstanding operations
    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// A queued request bound to one partition
pub(crate) enum PartitionOp<K, P> {
    /// Apply a preValue
    Push { key: K, pre_value: P },
    /// Read a value and reply to `source`
    Pull {
        key: K,
        source: EndpointId,
        request_id: u64,
    },
    /// Finish the operations queued so far, then exit
    Stop,
}

/// The values owned by one partition
#[derive(Debug, Clone)]
pub struct PartitionStore<K, V> {
    values: AHashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V: Clone> PartitionStore<K, V> {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            values: AHashMap::new(),
        }
    }

    /// Merge `pre_value` into the value of `key`, initializing it if absent.
    ///
    /// The store is only written once the updater returns, so a panic in
    /// any updater method leaves the previous value (or no value) in place.
    pub fn apply_push<U>(&mut self, updater: &U, key: K, pre_value: U::PreValue)
    where
        U: ParameterUpdater<Key = K, Value = V>,
    {
        let delta = updater.process(&key, pre_value);
        let old_value = match self.values.get(&key) {
            Some(value) => value.clone(),
            None => updater.init_value(&key),
        };
        let new_value = updater.update(old_value, delta);
        self.values.insert(key, new_value);
    }

    /// Current value of `key`, initializing it if absent
    pub fn read<U>(&mut self, updater: &U, key: &K) -> V
    where
        U: ParameterUpdater<Key = K, Value = V>,
    {
        if let Some(value) = self.values.get(key) {
            return value.clone();
        }
        let value = updater.init_value(key);
        self.values.insert(key.clone(), value.clone());
        value
    }

    /// Stored value of `key`, if any
    pub fn get(&self, key: &K) -> Option<&V> {
        self.values.get(key)
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no key is stored
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for PartitionStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running partition thread
pub(crate) struct PartitionHandle<K, P> {
    index: usize,
    sender: QueueSender<PartitionOp<K, P>>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl<K, P> PartitionHandle<K, P> {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Queue an operation, blocking while the queue is full
    pub(crate) fn enqueue(&self, op: PartitionOp<K, P>) -> Result<()> {
        self.sender.send(op).map_err(|_| Error::ServerStopped)
    }

    pub(crate) fn depth(&self) -> u64 {
        self.sender.stats().depth()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Drain the queue and join the thread
    pub(crate) fn stop(&self) -> Result<()> {
        let Some(handle) = self.thread_handle.lock().take() else {
            return Ok(());
        };

        // A dead thread has already dropped its receiver; joining reports it.
        let _ = self.sender.send(PartitionOp::Stop);
        handle
            .join()
            .map_err(|_| Error::PartitionPanicked(self.index))
    }
}

/// Spawn the thread that owns partition `index`
pub(crate) fn spawn<U>(
    index: usize,
    config: &PartitionConfig,
    updater: Arc<U>,
    reply_sender: Arc<dyn ReplySender<U::Key, U::Value>>,
    pending: Arc<PendingOps>,
) -> Result<PartitionHandle<U::Key, U::PreValue>>
where
    U: ParameterUpdater,
{
    config.validate()?;

    let (sender, receiver) = queue::bounded(config.queue_capacity);
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    let cpu_affinity = config.cpu_affinity;

    let mut thread_builder =
        thread::Builder::new().name(format!("{}-{}", config.name_prefix, index));
    if let Some(stack_size) = config.stack_size {
        thread_builder = thread_builder.stack_size(stack_size);
    }

    let thread_handle = thread_builder
        .spawn(move || {
            if let Some(cpu) = cpu_affinity {
                if let Some(core_ids) = core_affinity::get_core_ids() {
                    if cpu < core_ids.len() {
                        core_affinity::set_for_current(core_ids[cpu]);
                    }
                }
            }

            run(index, receiver, &*updater, &*reply_sender, &pending);
            running_clone.store(false, Ordering::Release);
        })
        .map_err(|e| Error::Other(format!("Failed to spawn partition thread: {}", e)))?;

    Ok(PartitionHandle {
        index,
        sender,
        thread_handle: Mutex::new(Some(thread_handle)),
        running,
    })
}

fn run<U: ParameterUpdater>(
    index: usize,
    receiver: QueueReceiver<PartitionOp<U::Key, U::PreValue>>,
    updater: &U,
    reply_sender: &dyn ReplySender<U::Key, U::Value>,
    pending: &PendingOps,
) {
    debug!(partition = index, "partition started");
    let mut store = PartitionStore::new();

    for op in receiver.iter() {
        let result = match op {
            PartitionOp::Stop => break,
            PartitionOp::Push { key, pre_value } => catch_unwind(AssertUnwindSafe(|| {
                store.apply_push(updater, key, pre_value)
            })),
            PartitionOp::Pull {
                key,
                source,
                request_id,
            } => catch_unwind(AssertUnwindSafe(|| {
                let value = store.read(updater, &key);
                if let Err(e) = reply_sender.send_reply(&source, request_id, &key, &value) {
                    warn!(partition = index, dest = %source, error = %e, "failed to send reply");
                }
            })),
        };

        if result.is_err() {
            error!(partition = index, "updater panicked, operation dropped");
        }
        pending.complete();
    }

    debug!(partition = index, keys = store.len(), "partition stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updater::AddUpdater;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CollectingSender {
        replies: Mutex<Vec<(u64, i32, i64)>>,
    }

    impl ReplySender<i32, i64> for CollectingSender {
        fn send_reply(&self, _dest: &EndpointId, request_id: u64, key: &i32, value: &i64) -> Result<()> {
            self.replies.lock().push((request_id, *key, *value));
            Ok(())
        }
    }

    struct PanicOnNegative;

    impl ParameterUpdater for PanicOnNegative {
        type Key = i32;
        type PreValue = i64;
        type Delta = i64;
        type Value = i64;

        fn init_value(&self, _key: &i32) -> i64 {
            0
        }

        fn process(&self, _key: &i32, pre_value: i64) -> i64 {
            assert!(pre_value >= 0, "negative preValue");
            pre_value
        }

        fn update(&self, old_value: i64, delta: i64) -> i64 {
            old_value + delta
        }
    }

    /// Rejects negative deltas while merging, after the old value is known
    struct PanicInUpdate;

    impl ParameterUpdater for PanicInUpdate {
        type Key = i32;
        type PreValue = i64;
        type Delta = i64;
        type Value = i64;

        fn init_value(&self, _key: &i32) -> i64 {
            0
        }

        fn process(&self, _key: &i32, pre_value: i64) -> i64 {
            pre_value
        }

        fn update(&self, old_value: i64, delta: i64) -> i64 {
            assert!(delta >= 0, "negative delta");
            old_value + delta
        }
    }

    fn wait_idle(pending: &PendingOps) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pending.get() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_store_push_then_read() {
        let updater = AddUpdater::<i32, i64>::new();
        let mut store = PartitionStore::new();

        assert_eq!(store.read(&updater, &3), 0);
        store.apply_push(&updater, 3, 4);
        store.apply_push(&updater, 3, 5);
        assert_eq!(store.read(&updater, &3), 9);
        assert_eq!(store.read(&updater, &3), 9);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_read_initializes_only_once() {
        let updater = AddUpdater::<i32, i64>::new();
        let mut store = PartitionStore::new();
        assert!(store.get(&1).is_none());
        store.read(&updater, &1);
        assert_eq!(store.get(&1), Some(&0));
    }

    #[test]
    fn test_store_keeps_value_when_update_panics() {
        let updater = PanicInUpdate;
        let mut store = PartitionStore::new();
        store.apply_push(&updater, 1, 5);

        let result = catch_unwind(AssertUnwindSafe(|| store.apply_push(&updater, 1, -1)));
        assert!(result.is_err());
        assert_eq!(store.read(&updater, &1), 5);

        let result = catch_unwind(AssertUnwindSafe(|| store.apply_push(&updater, 2, -1)));
        assert!(result.is_err());
        assert!(store.get(&2).is_none());
    }

    #[test]
    fn test_partition_keeps_value_when_update_panics() {
        let sender = Arc::new(CollectingSender::default());
        let pending = Arc::new(PendingOps::new());
        let handle = spawn(
            2,
            &PartitionConfig::new(),
            Arc::new(PanicInUpdate),
            sender.clone(),
            pending.clone(),
        )
        .unwrap();

        for pre_value in [4, -1, 6] {
            pending.begin();
            handle.enqueue(PartitionOp::Push { key: 9, pre_value }).unwrap();
        }
        pending.begin();
        handle
            .enqueue(PartitionOp::Pull {
                key: 9,
                source: EndpointId::worker(0),
                request_id: 3,
            })
            .unwrap();

        wait_idle(&pending);
        assert_eq!(*sender.replies.lock(), vec![(3, 9, 10)]);
        handle.stop().unwrap();
    }

    #[test]
    fn test_partition_applies_in_order_and_replies() {
        let sender = Arc::new(CollectingSender::default());
        let pending = Arc::new(PendingOps::new());
        let handle = spawn(
            0,
            &PartitionConfig::new().with_name_prefix("test-partition"),
            Arc::new(AddUpdater::<i32, i64>::new()),
            sender.clone(),
            pending.clone(),
        )
        .unwrap();
        assert!(handle.is_running());

        for _ in 0..10 {
            pending.begin();
            handle.enqueue(PartitionOp::Push { key: 1, pre_value: 1 }).unwrap();
        }
        pending.begin();
        handle
            .enqueue(PartitionOp::Pull {
                key: 1,
                source: EndpointId::worker(0),
                request_id: 7,
            })
            .unwrap();

        wait_idle(&pending);
        assert_eq!(pending.get(), 0);
        assert_eq!(*sender.replies.lock(), vec![(7, 1, 10)]);

        handle.stop().unwrap();
        assert!(!handle.is_running());
        assert!(matches!(
            handle.enqueue(PartitionOp::Push { key: 1, pre_value: 1 }),
            Err(Error::ServerStopped)
        ));
    }

    #[test]
    fn test_updater_panic_does_not_kill_partition() {
        let sender = Arc::new(CollectingSender::default());
        let pending = Arc::new(PendingOps::new());
        let handle = spawn(
            1,
            &PartitionConfig::new(),
            Arc::new(PanicOnNegative),
            sender.clone(),
            pending.clone(),
        )
        .unwrap();

        for pre_value in [2, -1, 3] {
            pending.begin();
            handle.enqueue(PartitionOp::Push { key: 5, pre_value }).unwrap();
        }
        pending.begin();
        handle
            .enqueue(PartitionOp::Pull {
                key: 5,
                source: EndpointId::worker(0),
                request_id: 1,
            })
            .unwrap();

        wait_idle(&pending);
        assert_eq!(pending.get(), 0);
        assert_eq!(*sender.replies.lock(), vec![(1, 5, 5)]);
        assert!(handle.is_running());
        handle.stop().unwrap();
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let result = spawn(
            0,
            &PartitionConfig::new().with_queue_capacity(0),
            Arc::new(AddUpdater::<i32, i64>::new()),
            Arc::new(CollectingSender::default()),
            Arc::new(PendingOps::new()),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
