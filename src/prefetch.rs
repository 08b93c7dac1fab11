//! Background refresh of entries that are close to expiry.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::addr::QueryKey;
use crate::error::ResolveError;

#[derive(Debug, Clone)]
pub struct PrefetchJob {
    pub key: QueryKey,
    pub hash: u64,
}

struct JobSlot {
    key: QueryKey,
    in_flight: bool,
}

#[derive(Default)]
struct JobListState {
    jobs: FxHashMap<u64, JobSlot>,
    queue: VecDeque<u64>,
    /// Jobs queued and not yet picked up.
    used: usize,
}

/// Deduplicated prefetch job list behind one lock.
///
/// A key stays in the list from `enqueue` until its refresh completes, so a
/// second refresh for the same key cannot be queued while one is in flight.
#[derive(Default)]
pub struct PrefetchList {
    state: Mutex<JobListState>,
    notify: Notify,
}

impl PrefetchList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the key (or a colliding hash) is already pending.
    pub fn enqueue(&self, key: &QueryKey) -> bool {
        let hash = key.stable_hash();
        {
            let mut state = self.state.lock();
            if let Some(slot) = state.jobs.get(&hash) {
                if slot.key != *key {
                    debug!(target = "prefetch", qname = %key, other = %slot.key, "prefetch hash collision, skipping");
                }
                return false;
            }
            state.jobs.insert(
                hash,
                JobSlot {
                    key: key.clone(),
                    in_flight: false,
                },
            );
            state.queue.push_back(hash);
            state.used += 1;
        }
        self.notify.notify_one();
        true
    }

    /// Hands out every queued job and marks it in flight.
    pub fn take_batch(&self) -> Vec<PrefetchJob> {
        let mut state = self.state.lock();
        let JobListState { jobs, queue, used } = &mut *state;
        let mut batch = Vec::with_capacity(queue.len());
        while let Some(hash) = queue.pop_front() {
            if let Some(slot) = jobs.get_mut(&hash) {
                slot.in_flight = true;
                batch.push(PrefetchJob {
                    key: slot.key.clone(),
                    hash,
                });
            }
        }
        *used = 0;
        batch
    }

    pub fn complete(&self, job: &PrefetchJob) {
        let mut state = self.state.lock();
        if state.jobs.get(&job.hash).is_some_and(|slot| slot.in_flight) {
            state.jobs.remove(&job.hash);
        }
    }

    /// Drops a queued job; in-flight refreshes are left to finish.
    pub fn cancel(&self, key: &QueryKey) -> bool {
        let hash = key.stable_hash();
        let mut state = self.state.lock();
        let queued = state
            .jobs
            .get(&hash)
            .is_some_and(|slot| !slot.in_flight && slot.key == *key);
        if queued {
            state.jobs.remove(&hash);
            state.queue.retain(|h| *h != hash);
            state.used = state.used.saturating_sub(1);
        }
        queued
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.state
            .lock()
            .jobs
            .get(&key.stable_hash())
            .is_some_and(|slot| slot.key == *key)
    }

    /// Queued plus in-flight jobs.
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queued(&self) -> usize {
        self.state.lock().used
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.jobs.clear();
        state.queue.clear();
        state.used = 0;
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Whatever performs the refresh (backend call plus cache write-through).
///
/// Takes an owned handle so the implementation can hand work to its own tasks.
#[async_trait]
pub trait Refresh: Send + Sync + 'static {
    async fn refresh(self: Arc<Self>, key: &QueryKey) -> Result<(), ResolveError>;
}

// Removes the job even if the refresh task is cancelled.
struct CompleteGuard {
    list: Arc<PrefetchList>,
    job: PrefetchJob,
}

impl Drop for CompleteGuard {
    fn drop(&mut self) {
        self.list.complete(&self.job);
    }
}

/// Drains the queue once; jobs run concurrently. Returns how many ran.
pub async fn process_pending<R: Refresh>(list: &Arc<PrefetchList>, refresher: Arc<R>) -> usize {
    let jobs = list.take_batch();
    let count = jobs.len();
    let handles = jobs
        .into_iter()
        .map(|job| {
            let guard = CompleteGuard {
                list: Arc::clone(list),
                job,
            };
            let refresher = Arc::clone(&refresher);
            tokio::spawn(async move {
                let key = &guard.job.key;
                match refresher.refresh(key).await {
                    Ok(()) => trace!(target = "prefetch", qname = %key, "prefetch refreshed entry"),
                    // stale entry stays in place until its ttl
                    Err(err) => debug!(target = "prefetch", qname = %key, error = %err, "prefetch failed, job dropped"),
                }
                drop(guard);
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        if let Err(err) = handle.await {
            warn!(target = "prefetch", error = %err, "prefetch task did not finish");
        }
    }
    count
}

/// Scheduler loop. Holds only a weak reference so dropping the environment
/// ends the loop.
pub async fn run_worker<R: Refresh>(refresher: Weak<R>, list: Arc<PrefetchList>) {
    debug!(target = "prefetch", "prefetch worker started");
    loop {
        list.notified().await;
        let Some(strong) = refresher.upgrade() else {
            break;
        };
        let processed = process_pending(&list, strong).await;
        trace!(target = "prefetch", processed, "prefetch batch done");
    }
    debug!(target = "prefetch", "prefetch worker stopped");
}
