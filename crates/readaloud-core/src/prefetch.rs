//! Background look-ahead synthesis.
//!
//! A fixed pool of worker threads drains two queues: the chapter being read
//! and, at lower priority, the chapter after it. Workers never touch the
//! session; each finished unit is reported to the control thread as an event.

use crate::cache::{AudioStore, ChapterScope};
use crate::error::FetchError;
use crate::events::{EngineEvent, PrefetchOutcome};
use crate::resolver::{AudioResolver, FallbackReason, Resolution};
use crate::segmenter::{ChapterUnits, SpeakableUnit};
use crossbeam_channel::Sender;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchConfig {
    pub workers: usize,
    pub next_chapter_workers: usize,
    pub retry_budget: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Current,
    Next,
}

type JobKey = (u64, usize, usize);

#[derive(Debug, Clone)]
struct Job {
    scope: ChapterScope,
    unit: SpeakableUnit,
    lane: Lane,
}

impl Job {
    fn key(&self) -> JobKey {
        (self.scope.epoch, self.scope.chapter_index, self.unit.index)
    }
}

#[derive(Default)]
struct QueueState {
    current: VecDeque<Job>,
    next: VecDeque<Job>,
    queued: HashSet<JobKey>,
    in_flight: HashSet<JobKey>,
    /// In-flight jobs whose latest attempt failed and that are waiting to retry.
    failed_attempts: HashMap<JobKey, FetchError>,
    next_lane_busy: usize,
    /// Bumped by `cancel_all` so sleeping retries give up early.
    cancellations: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wakeup: Condvar,
    config: PrefetchConfig,
    resolver: Arc<AudioResolver>,
    store: AudioStore,
    events: Sender<EngineEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a job is available. `None` means shut down.
    fn next_job(&self) -> Option<(Job, u64)> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return None;
            }
            let job = if let Some(job) = state.current.pop_front() {
                Some(job)
            } else if state.next_lane_busy < self.config.next_chapter_workers.max(1) {
                state.next.pop_front()
            } else {
                None
            };
            if let Some(job) = job {
                let key = job.key();
                state.queued.remove(&key);
                state.in_flight.insert(key);
                if job.lane == Lane::Next {
                    state.next_lane_busy += 1;
                }
                return Some((job, state.cancellations));
            }
            state = self
                .wakeup
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish(&self, job: &Job) {
        let mut state = self.lock();
        state.in_flight.remove(&job.key());
        state.failed_attempts.remove(&job.key());
        if job.lane == Lane::Next {
            state.next_lane_busy = state.next_lane_busy.saturating_sub(1);
        }
        drop(state);
        // A next-lane slot may have opened up.
        self.wakeup.notify_all();
    }

    /// Remember the failure before reporting it so a session that checks
    /// `failed_attempt` afterwards cannot miss it.
    fn attempt_failed(&self, job: &Job, error: &FetchError) {
        self.lock().failed_attempts.insert(job.key(), error.clone());
        let _ = self.events.send(EngineEvent::PrefetchAttemptFailed {
            scope: job.scope.clone(),
            unit_index: job.unit.index,
            error: error.clone(),
        });
    }

    fn cancelled_since(&self, seen: u64) -> bool {
        let state = self.lock();
        state.shutdown || state.cancellations != seen
    }

    /// Sleep between retries, waking early on cancellation or shutdown.
    fn backoff(&self, seen: u64) {
        let state = self.lock();
        let _ = self
            .wakeup
            .wait_timeout_while(state, self.config.retry_delay, |s| {
                !s.shutdown && s.cancellations == seen
            })
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn process(&self, job: &Job, seen: u64) -> PrefetchOutcome {
        let unit_index = job.unit.index;
        if job.unit.is_trivial() {
            return PrefetchOutcome::Trivial;
        }
        let budget = self.config.retry_budget.max(1);
        for attempt in 1..=budget {
            if self.cancelled_since(seen) || !self.store.is_live(&job.scope) {
                return PrefetchOutcome::Discarded;
            }
            match self.resolver.resolve(&job.scope, &job.unit, 0) {
                Ok(Resolution::Audio(handle)) => {
                    if handle.from_cache
                        || self
                            .store
                            .insert(&job.scope, unit_index, 0, handle.audio)
                    {
                        return PrefetchOutcome::Cached;
                    }
                    return PrefetchOutcome::Discarded;
                }
                Ok(Resolution::Fallback(reason)) => return PrefetchOutcome::Fallback(reason),
                Err(err) => {
                    warn!(
                        chapter_index = job.scope.chapter_index,
                        unit_index,
                        attempt,
                        budget,
                        "Prefetch attempt failed: {err}"
                    );
                    self.attempt_failed(job, &err);
                    if attempt < budget {
                        self.backoff(seen);
                    }
                }
            }
        }
        if self.store.mark_fallback(&job.scope, unit_index) {
            info!(
                chapter_index = job.scope.chapter_index,
                unit_index, "Remote retries exhausted; unit will use the local voice"
            );
            PrefetchOutcome::Fallback(FallbackReason::Exhausted)
        } else {
            PrefetchOutcome::Discarded
        }
    }
}

/// Handle to the worker pool. Dropping it stops and joins the workers.
pub struct PrefetchPipeline {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl PrefetchPipeline {
    pub(crate) fn spawn(
        config: PrefetchConfig,
        resolver: Arc<AudioResolver>,
        store: AudioStore,
        events: Sender<EngineEvent>,
    ) -> Self {
        let worker_count = config.workers.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
            config,
            resolver,
            store,
            events,
        });
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("prefetch-{worker_id}"))
                .spawn(move || worker_loop(shared, worker_id));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => warn!(worker_id, "Failed to spawn prefetch worker: {err}"),
            }
        }
        info!(workers = workers.len(), "Prefetch pipeline started");
        Self { shared, workers }
    }

    /// Queue up to `count` units after `from_unit` of the chapter being read.
    ///
    /// Returns how many units were newly queued. Current-lane jobs from any
    /// other scope are dropped first.
    pub fn schedule(
        &self,
        scope: &ChapterScope,
        chapter: &ChapterUnits,
        from_unit: usize,
        count: usize,
    ) -> usize {
        let first = from_unit.saturating_add(1);
        let last = first.saturating_add(count).min(chapter.len());
        let mut state = self.shared.lock();
        let stale: Vec<JobKey> = state
            .current
            .iter()
            .filter(|job| job.scope != *scope)
            .map(Job::key)
            .collect();
        state.current.retain(|job| job.scope == *scope);
        for key in stale {
            state.queued.remove(&key);
        }
        let added = self.enqueue(&mut state, scope, chapter, first..last, Lane::Current);
        drop(state);
        if added > 0 {
            debug!(
                chapter_index = scope.chapter_index,
                from_unit, added, "Scheduled look-ahead synthesis"
            );
            self.shared.wakeup.notify_all();
        }
        added
    }

    /// Queue the first `count` units of the next chapter at low priority.
    pub fn schedule_next_chapter(
        &self,
        scope: &ChapterScope,
        chapter: &ChapterUnits,
        count: usize,
    ) -> usize {
        let mut state = self.shared.lock();
        let last = count.min(chapter.len());
        let added = self.enqueue(&mut state, scope, chapter, 0..last, Lane::Next);
        drop(state);
        if added > 0 {
            debug!(
                chapter_index = scope.chapter_index,
                added, "Scheduled next-chapter preload"
            );
            self.shared.wakeup.notify_all();
        }
        added
    }

    fn enqueue(
        &self,
        state: &mut QueueState,
        scope: &ChapterScope,
        chapter: &ChapterUnits,
        range: std::ops::Range<usize>,
        lane: Lane,
    ) -> usize {
        let store = &self.shared.store;
        let mut added = 0;
        for unit_index in range {
            let Some(unit) = chapter.get(unit_index) else {
                break;
            };
            let key = (scope.epoch, scope.chapter_index, unit_index);
            if state.queued.contains(&key)
                || state.in_flight.contains(&key)
                || store.contains(scope, unit_index, 0)
                || store.is_fallback(scope, unit_index)
            {
                continue;
            }
            let job = Job {
                scope: scope.clone(),
                unit: unit.clone(),
                lane,
            };
            state.queued.insert(key);
            match lane {
                Lane::Current => state.current.push_back(job),
                Lane::Next => state.next.push_back(job),
            }
            added += 1;
        }
        added
    }

    /// Move queued next-chapter work into the current lane once reading enters that chapter.
    pub fn promote(&self, scope: &ChapterScope) {
        let mut state = self.shared.lock();
        let mut moved = Vec::new();
        state.next.retain(|job| {
            if job.scope == *scope {
                moved.push(job.clone());
                false
            } else {
                true
            }
        });
        for mut job in moved.into_iter().rev() {
            job.lane = Lane::Current;
            state.current.push_front(job);
        }
    }

    pub fn is_in_flight(&self, scope: &ChapterScope, unit_index: usize) -> bool {
        self.shared
            .lock()
            .in_flight
            .contains(&(scope.epoch, scope.chapter_index, unit_index))
    }

    /// The last failure of an in-flight job that is now backing off, if any.
    pub fn failed_attempt(&self, scope: &ChapterScope, unit_index: usize) -> Option<FetchError> {
        self.shared
            .lock()
            .failed_attempts
            .get(&(scope.epoch, scope.chapter_index, unit_index))
            .cloned()
    }

    /// Remove a queued (not yet started) job so the caller can resolve it directly.
    pub fn take_queued(&self, scope: &ChapterScope, unit_index: usize) -> bool {
        let key = (scope.epoch, scope.chapter_index, unit_index);
        let mut state = self.shared.lock();
        if !state.queued.remove(&key) {
            return false;
        }
        state.current.retain(|job| job.key() != key);
        state.next.retain(|job| job.key() != key);
        true
    }

    /// Drop all queued work. In-flight attempts finish and are discarded by scope.
    pub fn cancel_all(&self) {
        let mut state = self.shared.lock();
        let dropped = state.current.len() + state.next.len();
        state.current.clear();
        state.next.clear();
        state.queued.clear();
        state.cancellations += 1;
        drop(state);
        self.shared.wakeup.notify_all();
        if dropped > 0 {
            debug!(dropped, "Cancelled queued prefetch work");
        }
    }

    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.current.clear();
            state.next.clear();
            state.queued.clear();
        }
        self.shared.wakeup.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for PrefetchPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    debug!(worker_id, "Prefetch worker started");
    while let Some((job, seen)) = shared.next_job() {
        let outcome = shared.process(&job, seen);
        shared.finish(&job);
        debug!(
            worker_id,
            chapter_index = job.scope.chapter_index,
            unit_index = job.unit.index,
            ?outcome,
            "Prefetch finished"
        );
        let _ = shared.events.send(EngineEvent::Prefetched {
            scope: job.scope,
            unit_index: job.unit.index,
            outcome,
        });
    }
    debug!(worker_id, "Prefetch worker stopped");
}
