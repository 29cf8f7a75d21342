use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::errors::{EngineError, Result};

/// Minimum interval between non-important progress emissions.
const EMIT_THROTTLE: Duration = Duration::from_millis(250);
/// Speed is smoothed over this many one-second buckets.
const SPEED_WINDOW_SECS: u64 = 5;

/// Step count meaning "not using step counting".
pub const STEPS_UNKNOWN: i64 = -1;

/// Install stages, in execution order. Mirrors the installer's state machine
/// exactly so progress reporting and execution stay in lockstep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallStage {
    Prepare,
    ModLoader,
    Files,
    Finished,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub stage: InstallStage,
    pub steps_complete: i64,
    pub steps_total: i64,
    pub bytes_current: u64,
    pub bytes_overall: u64,
    pub speed_bps: u64,
    pub percent: f64,
}

/// One-way sink for progress/result events. Implementations must not block
/// the engine; delivery failures are theirs to log and swallow.
pub trait EventSink: Send + Sync {
    fn publish(&self, update: ProgressUpdate);
}

/// Sink used when the caller does not care about progress.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _update: ProgressUpdate) {}
}

struct TrackerState {
    stage: InstallStage,
    steps_complete: i64,
    steps_total: i64,
    bytes_current: u64,
    bytes_overall: u64,
    buckets: VecDeque<(u64, u64)>,
    last_emit: Option<Instant>,
}

/// Stage-based progress state machine. Byte updates are throttled; stage
/// transitions and completion bypass the throttle. Stage transitions must
/// come from the orchestrating task only; workers report bytes.
pub struct ProgressTracker {
    sink: Arc<dyn EventSink>,
    started: Instant,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            started: Instant::now(),
            state: Mutex::new(TrackerState {
                stage: InstallStage::Prepare,
                steps_complete: 0,
                steps_total: STEPS_UNKNOWN,
                bytes_current: 0,
                bytes_overall: 0,
                buckets: VecDeque::new(),
                last_emit: None,
            }),
        }
    }

    /// Enters a new stage, resetting step and byte counters. Transitions
    /// out of the terminal stage are illegal.
    pub fn next_stage(&self, stage: InstallStage, steps_total: i64) -> Result<()> {
        {
            let mut state = self.lock();
            if state.stage == InstallStage::Finished {
                return Err(EngineError::illegal_state(
                    "progress tracker already finished".to_string(),
                ));
            }
            state.stage = stage;
            state.steps_complete = 0;
            state.steps_total = steps_total;
            state.bytes_current = 0;
            state.bytes_overall = 0;
            state.buckets.clear();
        }
        self.emit(true);
        Ok(())
    }

    pub fn finish(&self) {
        {
            let mut state = self.lock();
            state.stage = InstallStage::Finished;
        }
        self.emit(true);
    }

    pub fn set_overall_bytes(&self, overall: u64) {
        self.lock().bytes_overall = overall;
        self.emit(true);
    }

    pub fn step_done(&self) {
        {
            let mut state = self.lock();
            state.steps_complete += 1;
        }
        self.emit(false);
    }

    /// Adds processed bytes. Called concurrently by worker tasks through
    /// the aggregator.
    pub fn add_bytes(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        let second = self.started.elapsed().as_secs();
        {
            let mut state = self.lock();
            state.bytes_current = state.bytes_current.saturating_add(delta);
            match state.buckets.back_mut() {
                Some((bucket, bytes)) if *bucket == second => {
                    *bytes = bytes.saturating_add(delta);
                }
                _ => state.buckets.push_back((second, delta)),
            }
            while let Some((bucket, _)) = state.buckets.front() {
                if second.saturating_sub(*bucket) >= SPEED_WINDOW_SECS {
                    state.buckets.pop_front();
                } else {
                    break;
                }
            }
        }
        self.emit(false);
    }

    pub fn snapshot(&self) -> ProgressUpdate {
        let state = self.lock();
        Self::build_update(&state)
    }

    fn emit(&self, important: bool) {
        let update = {
            let mut state = self.lock();
            let now = Instant::now();
            if !important {
                if let Some(last) = state.last_emit {
                    if now.duration_since(last) < EMIT_THROTTLE {
                        return;
                    }
                }
            }
            state.last_emit = Some(now);
            Self::build_update(&state)
        };
        self.sink.publish(update);
    }

    fn build_update(state: &TrackerState) -> ProgressUpdate {
        let window_bytes: u64 = state.buckets.iter().map(|(_, bytes)| *bytes).sum();
        let window_secs = state.buckets.len().max(1) as u64;
        let percent = if state.bytes_overall == 0 {
            0.0
        } else {
            (state.bytes_current as f64 / state.bytes_overall as f64) * 100.0
        };
        ProgressUpdate {
            stage: state.stage,
            steps_complete: state.steps_complete,
            steps_total: state.steps_total,
            bytes_current: state.bytes_current,
            bytes_overall: state.bytes_overall,
            speed_bps: window_bytes / window_secs,
            percent,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Merges many concurrent tasks' byte streams into one monotonically
/// increasing total. Each task owns a handle carrying its own last-seen
/// counter, so a task restarting its internal counter at zero can never
/// drive the shared total backwards or double-count old bytes.
pub struct TaskProgressAggregator {
    tracker: Arc<ProgressTracker>,
}

impl TaskProgressAggregator {
    pub fn new(tracker: Arc<ProgressTracker>) -> Self {
        Self { tracker }
    }

    pub fn task_handle(&self) -> TaskProgress {
        TaskProgress {
            tracker: Arc::clone(&self.tracker),
            last: 0,
        }
    }
}

/// Per-task progress handle. Not clonable on purpose: one per task.
pub struct TaskProgress {
    tracker: Arc<ProgressTracker>,
    last: u64,
}

impl TaskProgress {
    /// Reports the task's cumulative processed byte count. A value below
    /// the previous one means the task restarted its own counter.
    pub fn report(&mut self, processed: u64) {
        if processed < self.last {
            self.last = processed;
            return;
        }
        let delta = processed - self.last;
        self.last = processed;
        self.tracker.add_bytes(delta);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Records every published update for assertions.
    pub struct RecordingSink {
        pub updates: Mutex<Vec<ProgressUpdate>>,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                updates: Mutex::new(Vec::new()),
            })
        }
    }

    impl EventSink for RecordingSink {
        fn publish(&self, update: ProgressUpdate) {
            self.updates.lock().expect("sink lock").push(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;

    #[test]
    fn stage_transitions_stop_at_finished() {
        let sink = RecordingSink::new();
        let tracker = ProgressTracker::new(sink);
        tracker
            .next_stage(InstallStage::Files, 3)
            .expect("enter files");
        tracker.finish();
        assert!(tracker.next_stage(InstallStage::Prepare, 1).is_err());
    }

    #[test]
    fn stage_change_resets_counters_and_emits_immediately() {
        let sink = RecordingSink::new();
        let tracker = ProgressTracker::new(Arc::clone(&sink) as Arc<dyn EventSink>);
        tracker.set_overall_bytes(100);
        tracker.add_bytes(40);
        tracker
            .next_stage(InstallStage::Files, 7)
            .expect("enter files");

        let updates = sink.updates.lock().expect("updates");
        let last = updates.last().expect("at least one update");
        assert_eq!(last.stage, InstallStage::Files);
        assert_eq!(last.steps_total, 7);
        assert_eq!(last.bytes_current, 0);
    }

    #[test]
    fn aggregated_total_is_exact_across_threads() {
        let sink = RecordingSink::new();
        let tracker = Arc::new(ProgressTracker::new(sink as Arc<dyn EventSink>));
        let aggregator = TaskProgressAggregator::new(Arc::clone(&tracker));

        let sizes: Vec<u64> = vec![1000, 50, 777, 123_456, 1];
        let mut workers = Vec::new();
        for size in &sizes {
            let size = *size;
            let mut handle = aggregator.task_handle();
            workers.push(std::thread::spawn(move || {
                let step = (size / 7).max(1);
                let mut processed = 0;
                while processed < size {
                    processed = (processed + step).min(size);
                    handle.report(processed);
                }
            }));
        }
        for worker in workers {
            worker.join().expect("join worker");
        }

        let total: u64 = sizes.iter().sum();
        assert_eq!(tracker.snapshot().bytes_current, total);
    }

    #[test]
    fn counter_restart_does_not_go_negative_or_double_count() {
        let sink = RecordingSink::new();
        let tracker = Arc::new(ProgressTracker::new(sink as Arc<dyn EventSink>));
        let aggregator = TaskProgressAggregator::new(Arc::clone(&tracker));

        let mut handle = aggregator.task_handle();
        handle.report(100);
        // Task retries and starts its own counter over.
        handle.report(0);
        handle.report(60);

        // 100 bytes were transferred, then 60 more after the restart.
        assert_eq!(tracker.snapshot().bytes_current, 160);
    }
}
