//! Cancellable one-shot and repeating timers driven by the service tick.
//!
//! A [`Timer`] is owned by whoever created it. The [`TimerScheduler`] only
//! keeps weak references plus a min-heap of `(due, id, generation)` entries;
//! re-scheduling or cancelling bumps the timer's generation so older heap
//! entries are skipped when they surface. Once stale entries outnumber live
//! timers the heap is compacted, so re-arming a long-delay timer in a loop
//! does not grow it. Dropping a timer cancels it.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

type Callback = Box<dyn FnMut() + Send>;

/// Heap size below which stale entries are left for `fire_due` to discard.
const COMPACT_THRESHOLD: usize = 64;

/// Identifier of a timer within its scheduler. Lower ids were created first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Lifecycle of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Created but never scheduled.
    Idle,
    /// Waiting for its due time.
    Scheduled,
    /// Its timeout callback is running.
    Firing,
    /// A one-shot timer that has fired.
    Fired,
    /// Cancelled before it could fire again.
    Cancelled,
}

struct TimerInner {
    state: TimerState,
    due: Option<Instant>,
    interval: Duration,
    generation: u64,
    fire_count: u64,
}

struct TimerCell {
    id: TimerId,
    inner: Mutex<TimerInner>,
    // Callbacks live in their own slots and are taken out while running, so a
    // callback may freely call back into its own timer.
    on_timeout: Mutex<Option<Callback>>,
    on_cancel: Mutex<Option<Callback>>,
}

impl TimerCell {
    fn invoke(slot: &Mutex<Option<Callback>>) {
        let taken = slot.lock().take();
        if let Some(mut callback) = taken {
            callback();
            let mut slot = slot.lock();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Heap entry; the ordering is reversed so `BinaryHeap` pops the earliest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    due: Instant,
    id: TimerId,
    generation: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.id.cmp(&self.id))
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Registered {
    cell: Weak<TimerCell>,
    /// Generation of the newest heap entry pushed for this timer.
    queued: u64,
}

#[derive(Default)]
struct SchedulerInner {
    timers: HashMap<TimerId, Registered>,
    queue: BinaryHeap<QueueEntry>,
    next_id: u64,
}

impl SchedulerInner {
    /// Drop entries superseded by a newer push or left by forgotten timers
    /// once they make up most of the heap.
    fn compact_if_stale(&mut self) {
        let len = self.queue.len();
        if len <= COMPACT_THRESHOLD || len <= 2 * self.timers.len() {
            return;
        }
        let timers = &self.timers;
        self.queue.retain(|entry| {
            timers
                .get(&entry.id)
                .is_some_and(|registered| registered.queued == entry.generation)
        });
        tracing::trace!("Timer heap compacted from {len} to {} entries", self.queue.len());
    }
}

/// Per-service timer queue. Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct TimerScheduler {
    inner: Arc<Mutex<SchedulerInner>>,
}

impl TimerScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire every timer due at or before `now`, earliest first, ties in
    /// creation order. Returns the number of timeout callbacks run.
    ///
    /// No lock is held while a callback runs.
    pub fn fire_due(&self, now: Instant) -> usize {
        let mut fired = 0;

        loop {
            let (entry, cell) = {
                let mut inner = self.inner.lock();
                match inner.queue.peek() {
                    Some(entry) if entry.due <= now => {}
                    _ => break,
                }
                let Some(entry) = inner.queue.pop() else { break };
                let cell = inner
                    .timers
                    .get(&entry.id)
                    .and_then(|registered| registered.cell.upgrade());
                (entry, cell)
            };
            let Some(cell) = cell else { continue };

            {
                let mut state = cell.inner.lock();
                if state.generation != entry.generation || state.state != TimerState::Scheduled {
                    continue;
                }
                state.state = TimerState::Firing;
                state.fire_count += 1;
            }

            TimerCell::invoke(&cell.on_timeout);
            fired += 1;

            let next_due = {
                let mut state = cell.inner.lock();
                if state.generation != entry.generation || state.state != TimerState::Firing {
                    // Re-scheduled or cancelled from inside the callback.
                    None
                } else if state.interval.is_zero() {
                    state.state = TimerState::Fired;
                    state.due = None;
                    None
                } else {
                    let next = entry.due + state.interval;
                    state.state = TimerState::Scheduled;
                    state.due = Some(next);
                    Some(next)
                }
            };
            if let Some(due) = next_due {
                self.push(QueueEntry {
                    due,
                    id: entry.id,
                    generation: entry.generation,
                });
            }
        }

        fired
    }

    /// Earliest due time in the queue, if any.
    ///
    /// May report a stale entry of a cancelled timer; waking for it is
    /// harmless because [`fire_due`](Self::fire_due) discards it.
    pub fn next_due(&self) -> Option<Instant> {
        self.inner.lock().queue.peek().map(|entry| entry.due)
    }

    /// Entries in the heap, including stale ones not yet discarded.
    pub fn queued_entries(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of live timers created on this scheduler.
    pub fn timer_count(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Number of live timers currently waiting to fire.
    pub fn scheduled_count(&self) -> usize {
        let cells: Vec<Arc<TimerCell>> = self
            .inner
            .lock()
            .timers
            .values()
            .filter_map(|registered| registered.cell.upgrade())
            .collect();
        cells
            .iter()
            .filter(|cell| cell.inner.lock().state == TimerState::Scheduled)
            .count()
    }

    fn register(&self, make: impl FnOnce(TimerId) -> Arc<TimerCell>) -> Arc<TimerCell> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = TimerId(inner.next_id);
        let cell = make(id);
        inner.timers.insert(
            id,
            Registered {
                cell: Arc::downgrade(&cell),
                queued: 0,
            },
        );
        cell
    }

    fn push(&self, entry: QueueEntry) {
        let mut inner = self.inner.lock();
        if let Some(registered) = inner.timers.get_mut(&entry.id) {
            registered.queued = registered.queued.max(entry.generation);
        }
        inner.queue.push(entry);
        inner.compact_if_stale();
    }

    fn forget(&self, id: TimerId) {
        let mut inner = self.inner.lock();
        inner.timers.remove(&id);
        inner.compact_if_stale();
    }
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// A schedulable unit of work with a timeout and a cancel callback.
pub struct Timer {
    cell: Arc<TimerCell>,
    scheduler: TimerScheduler,
}

impl Timer {
    /// Create an idle timer on `scheduler`.
    pub fn new<T, C>(scheduler: &TimerScheduler, on_timeout: T, on_cancel: C) -> Self
    where
        T: FnMut() + Send + 'static,
        C: FnMut() + Send + 'static,
    {
        let cell = scheduler.register(|id| {
            Arc::new(TimerCell {
                id,
                inner: Mutex::new(TimerInner {
                    state: TimerState::Idle,
                    due: None,
                    interval: Duration::ZERO,
                    generation: 0,
                    fire_count: 0,
                }),
                on_timeout: Mutex::new(Some(Box::new(on_timeout))),
                on_cancel: Mutex::new(Some(Box::new(on_cancel))),
            })
        });
        Self {
            cell,
            scheduler: scheduler.clone(),
        }
    }

    /// Arm the timer to fire after `delay`, then every `interval` unless
    /// `interval` is zero.
    ///
    /// Re-scheduling an armed timer moves it without running the cancel
    /// callback.
    pub fn schedule(&self, delay: Duration, interval: Duration) {
        self.schedule_at(Instant::now() + delay, interval);
    }

    /// Arm the timer to fire at `due`, then every `interval` unless
    /// `interval` is zero.
    pub fn schedule_at(&self, due: Instant, interval: Duration) {
        let generation = {
            let mut inner = self.cell.inner.lock();
            inner.generation += 1;
            inner.state = TimerState::Scheduled;
            inner.due = Some(due);
            inner.interval = interval;
            inner.generation
        };
        self.scheduler.push(QueueEntry {
            due,
            id: self.cell.id,
            generation,
        });
    }

    /// Cancel the timer. Runs the cancel callback and returns `true` if the
    /// timer was scheduled or firing; otherwise does nothing.
    pub fn cancel(&self) -> bool {
        let was_armed = {
            let mut inner = self.cell.inner.lock();
            match inner.state {
                TimerState::Scheduled | TimerState::Firing => {
                    inner.state = TimerState::Cancelled;
                    inner.generation += 1;
                    inner.due = None;
                    true
                }
                TimerState::Idle | TimerState::Fired | TimerState::Cancelled => false,
            }
        };
        if was_armed {
            TimerCell::invoke(&self.cell.on_cancel);
        }
        was_armed
    }

    /// Timer id; also its tie-break rank.
    pub fn id(&self) -> TimerId {
        self.cell.id
    }

    /// Current state.
    pub fn state(&self) -> TimerState {
        self.cell.inner.lock().state
    }

    /// Whether the timer will fire again without being re-scheduled.
    pub fn is_scheduled(&self) -> bool {
        self.state() == TimerState::Scheduled
    }

    /// Next due time while scheduled.
    pub fn due_time(&self) -> Option<Instant> {
        self.cell.inner.lock().due
    }

    /// Repeat interval; zero for one-shot timers.
    pub fn interval(&self) -> Duration {
        self.cell.inner.lock().interval
    }

    /// How many times the timeout callback has run.
    pub fn fire_count(&self) -> u64 {
        self.cell.inner.lock().fire_count
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.cell.inner.lock();
        f.debug_struct("Timer")
            .field("id", &self.cell.id)
            .field("state", &inner.state)
            .field("due", &inner.due)
            .field("interval", &inner.interval)
            .field("fire_count", &inner.fire_count)
            .finish()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
        self.scheduler.forget(self.cell.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, AtomicOrdering::SeqCst);
        })
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_one_shot_fires_once() {
        let scheduler = TimerScheduler::new();
        let (fires, on_timeout) = counter();
        let (cancels, on_cancel) = counter();
        let timer = Timer::new(&scheduler, on_timeout, on_cancel);

        timer.schedule(ms(10), Duration::ZERO);
        let due = timer.due_time().unwrap();
        assert_eq!(scheduler.fire_due(due - ms(1)), 0);
        assert_eq!(scheduler.fire_due(due), 1);
        assert_eq!(scheduler.fire_due(due + ms(100)), 0);

        assert_eq!(fires.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(timer.state(), TimerState::Fired);
        assert!(!timer.cancel());
        assert_eq!(cancels.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_repeating_timer_keeps_cadence() {
        let scheduler = TimerScheduler::new();
        let (fires, on_timeout) = counter();
        let timer = Timer::new(&scheduler, on_timeout, || {});
        timer.schedule(ms(10), ms(10));
        let first = timer.due_time().unwrap();

        assert_eq!(scheduler.fire_due(first), 1);
        assert_eq!(timer.due_time(), Some(first + ms(10)));

        // A late tick catches up on every missed period and keeps the grid.
        assert_eq!(scheduler.fire_due(first + ms(25)), 2);
        assert_eq!(timer.due_time(), Some(first + ms(30)));
        assert_eq!(fires.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(timer.fire_count(), 3);
    }

    #[test]
    fn test_cancel_stops_firing_and_calls_back_once() {
        let scheduler = TimerScheduler::new();
        let (fires, on_timeout) = counter();
        let (cancels, on_cancel) = counter();
        let timer = Timer::new(&scheduler, on_timeout, on_cancel);
        timer.schedule(ms(5), ms(5));
        let due = timer.due_time().unwrap();
        scheduler.fire_due(due);

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert_eq!(scheduler.fire_due(due + ms(1000)), 0);
        assert_eq!(fires.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(cancels.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(timer.state(), TimerState::Cancelled);
    }

    #[test]
    fn test_ties_fire_in_creation_order() {
        let scheduler = TimerScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let timers: Vec<Timer> = (0..4)
            .map(|i| {
                let order = Arc::clone(&order);
                Timer::new(&scheduler, move || order.lock().push(i), || {})
            })
            .collect();

        let due = Instant::now() + ms(50);
        for index in [3, 1, 0, 2] {
            timers[index].schedule_at(due, Duration::ZERO);
        }
        assert_eq!(scheduler.fire_due(due), 4);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_earlier_due_fires_first() {
        let scheduler = TimerScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let make = |tag: &'static str| {
            let order = Arc::clone(&order);
            Timer::new(&scheduler, move || order.lock().push(tag), || {})
        };
        let late = make("late");
        let early = make("early");
        let base = Instant::now();
        late.schedule_at(base + ms(20), Duration::ZERO);
        early.schedule_at(base + ms(10), Duration::ZERO);

        scheduler.fire_due(base + ms(30));
        assert_eq!(*order.lock(), vec!["early", "late"]);
    }

    #[test]
    fn test_reschedule_replaces_pending_entry() {
        let scheduler = TimerScheduler::new();
        let (fires, on_timeout) = counter();
        let (cancels, on_cancel) = counter();
        let timer = Timer::new(&scheduler, on_timeout, on_cancel);
        let base = Instant::now();

        timer.schedule_at(base + ms(10), Duration::ZERO);
        timer.schedule_at(base + ms(40), Duration::ZERO);
        assert_eq!(scheduler.fire_due(base + ms(20)), 0);
        assert_eq!(scheduler.fire_due(base + ms(40)), 1);
        assert_eq!(fires.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(cancels.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_callback_can_cancel_its_own_timer() {
        let scheduler = TimerScheduler::new();
        let (cancels, on_cancel) = counter();
        let slot: Arc<Mutex<Option<Arc<Timer>>>> = Arc::new(Mutex::new(None));
        let inner_slot = Arc::clone(&slot);
        let timer = Arc::new(Timer::new(
            &scheduler,
            move || {
                if let Some(timer) = inner_slot.lock().as_ref() {
                    timer.cancel();
                }
            },
            on_cancel,
        ));
        *slot.lock() = Some(Arc::clone(&timer));

        timer.schedule(Duration::ZERO, ms(1));
        let due = timer.due_time().unwrap();
        assert_eq!(scheduler.fire_due(due + ms(10)), 1);
        assert_eq!(timer.state(), TimerState::Cancelled);
        assert_eq!(cancels.load(AtomicOrdering::SeqCst), 1);

        slot.lock().take();
    }

    #[test]
    fn test_drop_cancels_and_forgets() {
        let scheduler = TimerScheduler::new();
        let (fires, on_timeout) = counter();
        let (cancels, on_cancel) = counter();
        let timer = Timer::new(&scheduler, on_timeout, on_cancel);
        timer.schedule(ms(1), Duration::ZERO);
        let due = timer.due_time().unwrap();
        assert_eq!(scheduler.timer_count(), 1);
        assert_eq!(scheduler.scheduled_count(), 1);

        drop(timer);
        assert_eq!(cancels.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(scheduler.timer_count(), 0);
        assert_eq!(scheduler.fire_due(due), 0);
        assert_eq!(fires.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_dropping_idle_timer_skips_cancel_callback() {
        let scheduler = TimerScheduler::new();
        let (cancels, on_cancel) = counter();
        drop(Timer::new(&scheduler, || {}, on_cancel));
        assert_eq!(cancels.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_rearming_does_not_grow_heap() {
        let scheduler = TimerScheduler::new();
        let (fires, on_timeout) = counter();
        let timer = Timer::new(&scheduler, on_timeout, || {});
        let base = Instant::now();

        for i in 0..1000 {
            timer.schedule_at(base + Duration::from_secs(3600 + i), Duration::ZERO);
        }
        assert!(
            scheduler.queued_entries() <= COMPACT_THRESHOLD + 1,
            "heap holds {} entries",
            scheduler.queued_entries()
        );

        // Only the newest arming fires.
        timer.schedule_at(base + ms(5), Duration::ZERO);
        assert_eq!(scheduler.fire_due(base + Duration::from_secs(7200)), 1);
        assert_eq!(fires.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_forgotten_timers_leave_no_entries_behind() {
        let scheduler = TimerScheduler::new();
        let keeper = Timer::new(&scheduler, || {}, || {});
        keeper.schedule(Duration::from_secs(60), Duration::ZERO);

        for _ in 0..500 {
            let timer = Timer::new(&scheduler, || {}, || {});
            timer.schedule(Duration::from_secs(3600), Duration::ZERO);
        }
        assert_eq!(scheduler.timer_count(), 1);
        assert!(scheduler.queued_entries() <= COMPACT_THRESHOLD + 1);
        assert_eq!(scheduler.next_due(), keeper.due_time());
    }

    #[test]
    fn test_next_due_tracks_earliest() {
        let scheduler = TimerScheduler::new();
        assert!(scheduler.next_due().is_none());
        let a = Timer::new(&scheduler, || {}, || {});
        let b = Timer::new(&scheduler, || {}, || {});
        let base = Instant::now();
        a.schedule_at(base + ms(30), Duration::ZERO);
        b.schedule_at(base + ms(10), Duration::ZERO);
        assert_eq!(scheduler.next_due(), Some(base + ms(10)));
    }
}
