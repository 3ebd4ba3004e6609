//! Task bookkeeping for the reactor: schedule requests, pending tasks, the
//! due-time heap and the per-key run history.
//!
//! The invariant maintained here is *at most one pending task per key*. The
//! heap is allowed to hold stale entries for a key (scheduling an earlier
//! due time pushes a second entry rather than rebuilding the heap); an entry
//! is authoritative only while its sequence number matches the task held in
//! the map, and stale entries are pruned lazily on pop.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// A unit of deferred work. `FnMut` because looping tasks run repeatedly.
pub type Job = Box<dyn FnMut() + Send + 'static>;

/// Callback fired when a periodic task skips an occurrence under overload.
pub type SkipCallback = Box<dyn FnMut() + Send + 'static>;

/// Loop settings for a periodic task.
pub(crate) struct LoopSpec {
    pub period: f64,
    pub skip_fraction: f64,
    pub skip_callback: Option<SkipCallback>,
}

/// A schedule request for [`Reactor::schedule`](crate::reactor::Reactor::schedule).
///
/// A request with no due time at all (no `at`, no `after`, no period) is a
/// cancellation: any pending task for the key is dropped. There is no
/// separate cancel verb.
#[derive(Default)]
pub struct Schedule {
    pub(crate) at: Option<f64>,
    pub(crate) after: Option<f64>,
    pub(crate) min_spacing: Option<f64>,
    pub(crate) period: Option<f64>,
    pub(crate) skip_fraction: f64,
    pub(crate) skip_callback: Option<SkipCallback>,
}

impl Schedule {
    /// Run at an absolute wall-clock time (seconds since the epoch).
    pub fn at(when: f64) -> Self {
        Self {
            at: Some(when),
            ..Self::default()
        }
    }

    /// Run `secs` from now.
    pub fn after(secs: f64) -> Self {
        Self {
            after: Some(secs),
            ..Self::default()
        }
    }

    /// Run periodically on the wall-clock grid of `period` seconds. The
    /// first run lands on the next grid point; each run reschedules to
    /// `last_due + period - (last_due mod period)`.
    pub fn every(period: f64) -> Self {
        Self {
            period: Some(period),
            ..Self::default()
        }
    }

    /// An empty request: cancels any pending task for the key.
    pub fn cancel() -> Self {
        Self::default()
    }

    /// Minimum spacing from the key's last run due-time. Pushes the computed
    /// due time forward when it would violate the spacing.
    pub fn min_spacing(mut self, secs: f64) -> Self {
        self.min_spacing = Some(secs);
        self
    }

    /// For a periodic request: when a run starts within
    /// `fraction * period` of its next slot, skip one extra period and fire
    /// `callback` once for the skipped occurrence.
    pub fn skip<F>(mut self, fraction: f64, callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.skip_fraction = fraction;
        self.skip_callback = Some(Box::new(callback));
        self
    }

    pub(crate) fn has_due(&self) -> bool {
        self.at.is_some() || self.after.is_some() || self.period.is_some()
    }
}

/// One keyed, pending unit of deferred work.
pub(crate) struct Task {
    pub key: String,
    pub job: Job,
    pub due: f64,
    pub seq: u64,
    pub has_run: bool,
    pub looping: Option<LoopSpec>,
}

/// Last-run metadata kept per key after a task executes.
pub(crate) struct TaskRecord {
    pub last_due: f64,
}

/// Heap entry; authoritative only while `seq` matches the task in the map.
pub(crate) struct HeapEntry {
    pub due: f64,
    pub seq: u64,
    pub key: String,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Inverted so BinaryHeap pops the earliest due time first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .total_cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The timer side of the reactor: heap + task map + run history.
#[derive(Default)]
pub(crate) struct TimerState {
    pub heap: BinaryHeap<HeapEntry>,
    pub tasks: HashMap<String, Task>,
    pub history: HashMap<String, TaskRecord>,
    next_seq: u64,
}

impl TimerState {
    pub fn fresh_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Earliest authoritative due time, pruning stale heap entries.
    pub fn next_due(&mut self) -> Option<f64> {
        while let Some(top) = self.heap.peek() {
            let live = self
                .tasks
                .get(&top.key)
                .is_some_and(|task| task.seq == top.seq);
            if live {
                return Some(top.due);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop the earliest task if it is due at `now`. Moves the task out of
    /// the map and records its due time in the history.
    pub fn pop_due(&mut self, now: f64) -> Option<Task> {
        loop {
            let top = self.heap.peek()?;
            let live = self
                .tasks
                .get(&top.key)
                .is_some_and(|task| task.seq == top.seq);
            if !live {
                self.heap.pop();
                continue;
            }
            if top.due > now {
                return None;
            }
            let entry = self.heap.pop()?;
            let mut task = self.tasks.remove(&entry.key)?;
            task.has_run = true;
            self.history.insert(
                task.key.clone(),
                TaskRecord {
                    last_due: task.due,
                },
            );
            return Some(task);
        }
    }

    /// Insert `task` as the pending task for its key and index it in the heap.
    pub fn insert(&mut self, task: Task) {
        self.heap.push(HeapEntry {
            due: task.due,
            seq: task.seq,
            key: task.key.clone(),
        });
        self.tasks.insert(task.key.clone(), task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(key: &str, due: f64, seq: u64) -> Task {
        Task {
            key: key.into(),
            job: Box::new(|| {}),
            due,
            seq,
            has_run: false,
            looping: None,
        }
    }

    #[test]
    fn pop_order_is_non_decreasing_due_time() {
        let mut state = TimerState::default();
        for (key, due) in [("c", 3.0), ("a", 1.0), ("b", 2.0)] {
            let seq = state.fresh_seq();
            state.insert(task(key, due, seq));
        }
        let mut popped = Vec::new();
        while let Some(t) = state.pop_due(10.0) {
            popped.push(t.key);
        }
        assert_eq!(popped, ["a", "b", "c"]);
    }

    #[test]
    fn stale_heap_entries_are_pruned() {
        let mut state = TimerState::default();
        let seq = state.fresh_seq();
        state.insert(task("k", 5.0, seq));
        // Advance: new entry at 2.0 supersedes the one at 5.0.
        let seq = state.fresh_seq();
        state.insert(task("k", 2.0, seq));

        assert_eq!(state.next_due(), Some(2.0));
        let popped = state.pop_due(10.0).map(|t| t.due);
        assert_eq!(popped, Some(2.0));
        // The stale 5.0 entry must not resurrect the key.
        assert!(state.pop_due(10.0).is_none());
        assert!(state.next_due().is_none());
    }

    #[test]
    fn not_due_yet_stays_pending() {
        let mut state = TimerState::default();
        let seq = state.fresh_seq();
        state.insert(task("k", 5.0, seq));
        assert!(state.pop_due(4.9).is_none());
        assert!(state.tasks.contains_key("k"));
    }

    #[test]
    fn execution_moves_task_to_history() {
        let mut state = TimerState::default();
        let seq = state.fresh_seq();
        state.insert(task("k", 5.0, seq));
        let popped = state.pop_due(6.0).map(|t| t.has_run);
        assert_eq!(popped, Some(true));
        assert!(!state.tasks.contains_key("k"));
        assert_eq!(state.history.get("k").map(|r| r.last_due), Some(5.0));
    }
}
