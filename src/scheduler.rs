//! A single virtual scheduler for every timer of the gateway.
//!
//! Register polls, topic publishes, reports, rules, reconnect backoffs and
//! input sampling all register here under a [`TimerKey`]. The gateway loop
//! sleeps until [`Scheduler::next_deadline`] and dispatches whatever
//! [`Scheduler::pop_due`] returns. Cancelling a timer is just removing its key;
//! stale heap entries are skipped lazily.
use crate::config::BrokerId;
use crate::readings::Source;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Owner of a timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Register read of one node of one field device.
    Poll { device: u8, node: String },
    /// Publish of a serial line's latest value to a topic.
    Publish {
        broker: BrokerId,
        line: String,
        topic: String,
    },
    /// Template report publish.
    Report { broker: BrokerId, name: String },
    /// Evaluation of an automation rule.
    Rule(String),
    /// Reopen attempt of a serial line.
    Reopen(String),
    /// Sampling of local inputs.
    Sample(Source),
}

#[derive(Debug)]
struct Armed {
    generation: u64,
    period: Option<Duration>,
}

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    seq: u64,
    generation: u64,
    key: TimerKey,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub struct Scheduler {
    heap: BinaryHeap<Entry>,
    armed: HashMap<TimerKey, Armed>,
    seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a periodic timer, replacing any timer with the same key.
    /// The first tick happens one period from now.
    pub fn arm(&mut self, key: TimerKey, every: Duration) {
        self.insert(key, Instant::now() + every, Some(every.max(Duration::from_millis(1))));
    }

    /// Arms a one-shot timer, replacing any timer with the same key.
    pub fn arm_once(&mut self, key: TimerKey, after: Duration) {
        self.insert(key, Instant::now() + after, None);
    }

    fn insert(&mut self, key: TimerKey, deadline: Instant, period: Option<Duration>) {
        self.seq += 1;
        let generation = self.seq;
        self.armed.insert(key.clone(), Armed { generation, period });
        self.heap.push(Entry {
            deadline,
            seq: self.seq,
            generation,
            key,
        });
    }

    /// Returns `true` when a timer was armed under `key`.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.armed.remove(key).is_some()
    }

    /// Cancels every timer whose key matches, returning how many were armed.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&TimerKey) -> bool) -> usize {
        let before = self.armed.len();
        self.armed.retain(|key, _| !predicate(key));
        before - self.armed.len()
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.armed.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TimerKey> {
        self.armed.keys()
    }

    /// Earliest deadline of a live timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if self.is_live(entry) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    fn is_live(&self, entry: &Entry) -> bool {
        self.armed
            .get(&entry.key)
            .is_some_and(|armed| armed.generation == entry.generation)
    }

    /// Removes and returns every timer due at `now`, in deadline order.
    /// Periodic timers are re-armed; each key is returned at most once.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|entry| entry.deadline <= now) {
            let Some(entry) = self.heap.pop() else {
                break;
            };
            if !self.is_live(&entry) {
                continue;
            }
            match self.armed.get(&entry.key).and_then(|armed| armed.period) {
                Some(period) => {
                    let mut next = entry.deadline + period;
                    if next <= now {
                        next = now + period;
                    }
                    self.seq += 1;
                    self.heap.push(Entry {
                        deadline: next,
                        seq: self.seq,
                        generation: entry.generation,
                        key: entry.key.clone(),
                    });
                }
                None => {
                    self.armed.remove(&entry.key);
                }
            }
            due.push(entry.key);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str) -> TimerKey {
        TimerKey::Rule(name.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_fires_once_per_period() {
        let mut scheduler = Scheduler::new();
        scheduler.arm(rule("a"), Duration::from_secs(1));
        assert!(scheduler.pop_due(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(scheduler.pop_due(Instant::now()), vec![rule("a")]);
        assert!(scheduler.pop_due(Instant::now()).is_empty());

        // The loop fell behind by several periods: still only one tick.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(scheduler.pop_due(Instant::now()), vec![rule("a")]);
        assert_eq!(
            scheduler.next_deadline(),
            Some(Instant::now() + Duration::from_secs(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_order() {
        let mut scheduler = Scheduler::new();
        scheduler.arm(rule("slow"), Duration::from_secs(3));
        scheduler.arm(rule("fast"), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(
            scheduler.pop_due(Instant::now()),
            vec![rule("fast"), rule("slow")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces() {
        let mut scheduler = Scheduler::new();
        scheduler.arm(rule("a"), Duration::from_secs(1));
        scheduler.arm(rule("a"), Duration::from_secs(10));
        assert_eq!(scheduler.len(), 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(scheduler.pop_due(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(scheduler.pop_due(Instant::now()), vec![rule("a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_ticks() {
        let mut scheduler = Scheduler::new();
        scheduler.arm(rule("a"), Duration::from_secs(1));
        scheduler.arm(TimerKey::Reopen("/dev/ttyS0".into()), Duration::from_secs(1));
        assert!(scheduler.cancel(&rule("a")));
        assert!(!scheduler.cancel(&rule("a")));
        assert_eq!(
            scheduler.cancel_where(|key| matches!(key, TimerKey::Reopen(..))),
            1
        );
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.next_deadline(), None);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(scheduler.pop_due(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once() {
        let mut scheduler = Scheduler::new();
        let key = TimerKey::Reopen("/dev/ttyS0".into());
        scheduler.arm_once(key.clone(), Duration::from_secs(3));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(scheduler.pop_due(Instant::now()), vec![key.clone()]);
        assert!(!scheduler.is_armed(&key));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(scheduler.pop_due(Instant::now()).is_empty());
    }
}
