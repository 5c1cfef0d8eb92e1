use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::util::lock_unpoisoned;

const COMPLETED_SUBJECT_MEMORY: usize = 4096;
const ACTIVE_SUBJECT_MEMORY: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgressPhase {
    Started,
    HeadersReceived,
    Transferring,
    Completed,
    /// Terminal for this run of the subject. The subject may start again.
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub subject_id: String,
    pub loaded: u64,
    pub total: u64,
    pub phase: ProgressPhase,
}

impl ProgressEvent {
    pub fn new(subject_id: impl Into<String>, loaded: u64, total: u64, phase: ProgressPhase) -> Self {
        Self {
            subject_id: subject_id.into(),
            loaded,
            total,
            phase,
        }
    }
}

type Callback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Per-subject high-water marks. Subjects that never reach a terminal phase
/// are forgotten oldest first once more than `ACTIVE_SUBJECT_MEMORY` are
/// tracked.
#[derive(Default)]
struct SubjectLedger {
    loaded: HashMap<String, (u64, u64)>,
    loaded_order: VecDeque<(String, u64)>,
    next_generation: u64,
    completed: HashSet<String>,
    completed_order: VecDeque<String>,
}

impl SubjectLedger {
    /// Clamps `event` so that per-subject guarantees hold. Returns `false`
    /// when the subject already completed and the event must be dropped.
    fn normalize(&mut self, event: &mut ProgressEvent) -> bool {
        if self.completed.contains(&event.subject_id) {
            return false;
        }
        let previous = self
            .loaded
            .get(&event.subject_id)
            .map_or(0, |(loaded, _)| *loaded);
        event.loaded = event.loaded.min(event.total).max(previous);
        event.total = event.total.max(event.loaded);

        match event.phase {
            ProgressPhase::Completed => {
                event.loaded = event.total;
                self.loaded.remove(&event.subject_id);
                self.remember_completed(event.subject_id.clone());
            }
            ProgressPhase::Failed => {
                self.loaded.remove(&event.subject_id);
            }
            _ => self.track(&event.subject_id, event.loaded),
        }
        true
    }

    fn track(&mut self, subject_id: &str, loaded: u64) {
        if let Some((entry, _)) = self.loaded.get_mut(subject_id) {
            *entry = loaded;
            return;
        }
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        self.loaded.insert(subject_id.to_owned(), (loaded, generation));
        self.loaded_order.push_back((subject_id.to_owned(), generation));

        while self.loaded.len() > ACTIVE_SUBJECT_MEMORY {
            let Some((evicted, generation)) = self.loaded_order.pop_front() else {
                break;
            };
            if self
                .loaded
                .get(&evicted)
                .is_some_and(|(_, current)| *current == generation)
            {
                self.loaded.remove(&evicted);
            }
        }
        // Entries for subjects that already finished are stale.
        if self.loaded_order.len() > ACTIVE_SUBJECT_MEMORY * 2 {
            let loaded = &self.loaded;
            self.loaded_order.retain(|(subject_id, generation)| {
                loaded
                    .get(subject_id)
                    .is_some_and(|(_, current)| current == generation)
            });
        }
    }

    fn remember_completed(&mut self, subject_id: String) {
        self.completed.insert(subject_id.clone());
        self.completed_order.push_back(subject_id);
        while self.completed_order.len() > COMPLETED_SUBJECT_MEMORY {
            if let Some(evicted) = self.completed_order.pop_front() {
                self.completed.remove(&evicted);
            }
        }
    }
}

#[derive(Default)]
struct ReporterInner {
    next_subscription: AtomicU64,
    subscribers: Mutex<BTreeMap<u64, Callback>>,
    ledger: Mutex<SubjectLedger>,
}

/// Fans progress events out to subscribers.
///
/// For every subject the delivered `loaded` values never decrease and never
/// exceed `total`. The `Completed` event carries `loaded == total` and is the
/// last one delivered. After `Failed` the subject may be reported again from
/// zero. Callbacks run on the emitting task and must not call
/// [`ProgressReporter::emit`] themselves.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    inner: Arc<ReporterInner>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ProgressReporter")
            .field(
                "subscribers",
                &lock_unpoisoned(&self.inner.subscribers).len(),
            )
            .finish()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        lock_unpoisoned(&self.inner.subscribers).insert(id, Arc::new(callback));
        Subscription {
            id,
            reporter: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event| {
            let _ = sender.send(event.clone());
        });
        (subscription, receiver)
    }

    /// Returns `false` when the event was dropped because its subject
    /// already completed.
    pub fn emit(&self, mut event: ProgressEvent) -> bool {
        let mut ledger = lock_unpoisoned(&self.inner.ledger);
        if !ledger.normalize(&mut event) {
            return false;
        }
        let callbacks: Vec<Callback> = lock_unpoisoned(&self.inner.subscribers)
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(&event);
        }
        drop(ledger);
        true
    }

    #[cfg(test)]
    fn tracked_subjects(&self) -> usize {
        lock_unpoisoned(&self.inner.ledger).loaded.len()
    }
}

/// Keeps a callback registered; dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    reporter: Weak<ReporterInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(reporter) = self.reporter.upgrade() {
            lock_unpoisoned(&reporter.subscribers).remove(&self.id);
        }
    }
}
