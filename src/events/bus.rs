// src/events/bus.rs

//! In-process event bus: sequencing, replay buffers and fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::errors::{OrchestratorError, Result};
use crate::events::{Event, EventDraft, Subject, SubjectFilter};
use crate::sync::lock;
use crate::types::{ContextId, SubscriptionId};

/// Sequencing state and replay ring for a single subject.
#[derive(Debug, Default)]
struct SubjectLog {
    /// Sequence number of the latest event (0 before the first one).
    head: u64,
    context_id: Option<ContextId>,
    ring: VecDeque<Event>,
}

/// Delivery counters shared between the bus, a subscription's worker and
/// its handle.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    degraded: AtomicBool,
    dropped: AtomicU64,
    delivered: AtomicU64,
    gaps: AtomicU64,
    /// Highest dropped sequence per subject, not yet reported as a gap.
    unreported: Mutex<HashMap<Subject, u64>>,
    drop_signal: Notify,
}

impl DeliveryStats {
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Events the bus could not enqueue because the intake was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Gap markers sent to the consumer.
    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_gap(&self) {
        self.gaps.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `true` the first time the subscription becomes degraded.
    fn record_dropped(&self, event: &Event) -> bool {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        {
            let mut unreported = lock(&self.unreported);
            let last = unreported.entry(event.subject).or_insert(0);
            *last = (*last).max(event.seq);
        }
        self.drop_signal.notify_one();
        !self.degraded.swap(true, Ordering::AcqRel)
    }

    /// Resolves once the bus has dropped an event for this subscription.
    pub(crate) async fn wait_for_drop(&self) {
        self.drop_signal.notified().await;
    }

    /// Drain the per-subject record of dropped sequences.
    pub(crate) fn take_unreported(&self) -> HashMap<Subject, u64> {
        std::mem::take(&mut *lock(&self.unreported))
    }
}

/// The bus side of a subscription: where fan-out puts matching events.
#[derive(Debug)]
pub struct Intake {
    pub(crate) filter: SubjectFilter,
    pub(crate) tx: mpsc::Sender<Event>,
    pub(crate) stats: Arc<DeliveryStats>,
}

/// Events to replay plus, for every subject they cover, the sequence number
/// the live stream must continue after.
#[derive(Debug, Default)]
pub struct ReplaySnapshot {
    pub events: Vec<Event>,
    pub cursors: HashMap<Subject, u64>,
}

/// Sequences events per subject, keeps a bounded history for replay and
/// fans every event out to matching intakes.
///
/// Publishing never waits on consumers: fan-out uses `try_send`, and an
/// intake that is full loses the event and is marked degraded. Subjects are
/// sharded, so publishers on different subjects do not contend.
#[derive(Debug)]
pub struct EventBus {
    logs: DashMap<Subject, Arc<Mutex<SubjectLog>>>,
    intakes: DashMap<SubscriptionId, Intake>,
    replay_capacity: usize,
}

impl EventBus {
    /// `replay_capacity` is the number of events retained per subject; it is
    /// clamped to at least 1.
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            logs: DashMap::new(),
            intakes: DashMap::new(),
            replay_capacity: replay_capacity.max(1),
        }
    }

    pub fn replay_capacity(&self) -> usize {
        self.replay_capacity
    }

    /// Sequence number of the latest event for `subject` (0 if none yet).
    pub fn head(&self, subject: Subject) -> u64 {
        self.logs
            .get(&subject)
            .map(|log| lock(log.value()).head)
            .unwrap_or(0)
    }

    /// Assign the next sequence number, retain the event for replay and fan it
    /// out. Returns the sequenced event.
    pub fn publish(&self, draft: EventDraft) -> Event {
        let log = self.log_for(draft.subject);
        let mut log = lock(&log);

        log.head += 1;
        if log.context_id.is_none() {
            log.context_id = draft.context_id.clone();
        }

        let event = Event {
            seq: log.head,
            subject: draft.subject,
            context_id: draft.context_id,
            timestamp: Utc::now(),
            change: draft.change,
            reason: draft.reason,
            payload: draft.payload,
        };

        log.ring.push_back(event.clone());
        while log.ring.len() > self.replay_capacity {
            log.ring.pop_front();
        }

        // Fan out while the subject is still locked so every intake sees this
        // subject's events in sequence order.
        self.fan_out(&event);

        trace!(
            subject = %event.subject,
            seq = event.seq,
            old = event.change.old_state(),
            new = event.change.new_state(),
            "event published"
        );
        event
    }

    pub(crate) fn attach(&self, id: SubscriptionId, intake: Intake) {
        debug!(subscription = %id, filter = %intake.filter, "intake attached");
        self.intakes.insert(id, intake);
    }

    pub(crate) fn detach(&self, id: SubscriptionId) -> bool {
        let removed = self.intakes.remove(&id).is_some();
        if removed {
            debug!(subscription = %id, "intake detached");
        }
        removed
    }

    pub fn intake_count(&self) -> usize {
        self.intakes.len()
    }

    /// Collect retained events matching `filter` from `from` onwards, plus the
    /// cursor for each covered subject.
    ///
    /// With `from = None` nothing is replayed and cursors sit at each subject's
    /// head. A `from` older than a subject's oldest retained event fails with
    /// `ReplayWindowExceeded`. Sequence 0 is treated as 1.
    pub fn snapshot(&self, filter: &SubjectFilter, from: Option<u64>) -> Result<ReplaySnapshot> {
        let logs: Vec<(Subject, Arc<Mutex<SubjectLog>>)> = match filter.single_subject() {
            Some(subject) => match self.logs.get(&subject) {
                Some(log) => vec![(subject, Arc::clone(log.value()))],
                None => {
                    let mut snapshot = ReplaySnapshot::default();
                    if let Some(from) = from {
                        snapshot.cursors.insert(subject, from.max(1) - 1);
                    }
                    return Ok(snapshot);
                }
            },
            None => self
                .logs
                .iter()
                .map(|entry| (*entry.key(), Arc::clone(entry.value())))
                .collect(),
        };

        let mut snapshot = ReplaySnapshot::default();
        for (subject, log) in logs {
            let log = lock(&log);
            if let SubjectFilter::Context(ctx) = filter {
                if log.context_id.as_ref() != Some(ctx) {
                    continue;
                }
            }

            match from {
                None => {
                    snapshot.cursors.insert(subject, log.head);
                }
                Some(from) => {
                    let from = from.max(1);
                    let oldest = log.ring.front().map(|e| e.seq).unwrap_or(log.head + 1);
                    if from < oldest {
                        return Err(OrchestratorError::ReplayWindowExceeded {
                            subject,
                            requested: from,
                            oldest,
                        });
                    }
                    snapshot
                        .events
                        .extend(log.ring.iter().filter(|e| e.seq >= from).cloned());
                    snapshot.cursors.insert(subject, log.head.max(from - 1));
                }
            }
        }

        Ok(snapshot)
    }

    fn log_for(&self, subject: Subject) -> Arc<Mutex<SubjectLog>> {
        let entry = self.logs.entry(subject).or_default();
        Arc::clone(entry.value())
    }

    fn fan_out(&self, event: &Event) {
        let mut closed = Vec::new();

        for intake in self.intakes.iter() {
            if !intake.filter.matches(event) {
                continue;
            }
            match intake.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    if intake.stats.record_dropped(event) {
                        warn!(
                            subscription = %intake.key(),
                            subject = %event.subject,
                            seq = event.seq,
                            "subscriber queue full; subscription degraded"
                        );
                    }
                }
                Err(TrySendError::Closed(_)) => closed.push(*intake.key()),
            }
        }

        for id in closed {
            if self.intakes.remove(&id).is_some() {
                debug!(subscription = %id, "dropping intake of closed subscription");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Change;
    use crate::task::TaskState;
    use crate::types::TaskId;

    fn draft(task: TaskId, from: TaskState, to: TaskState) -> EventDraft {
        EventDraft {
            subject: Subject::Task(task),
            context_id: Some(ContextId::from("ctx")),
            change: Change::Task { from, to },
            reason: None,
            payload: None,
        }
    }

    #[test]
    fn sequences_are_per_subject_and_start_at_one() {
        let bus = EventBus::new(8);
        let a = TaskId::new();
        let b = TaskId::new();

        assert_eq!(bus.publish(draft(a, TaskState::Submitted, TaskState::Working)).seq, 1);
        assert_eq!(bus.publish(draft(b, TaskState::Submitted, TaskState::Working)).seq, 1);
        assert_eq!(bus.publish(draft(a, TaskState::Working, TaskState::Completed)).seq, 2);
        assert_eq!(bus.head(Subject::Task(a)), 2);
        assert_eq!(bus.head(Subject::Task(TaskId::new())), 0);
    }

    #[test]
    fn ring_is_bounded_and_old_replays_are_refused() {
        let bus = EventBus::new(3);
        let task = TaskId::new();
        for _ in 0..5 {
            bus.publish(draft(task, TaskState::Working, TaskState::InputRequired));
        }

        let snap = bus.snapshot(&SubjectFilter::Task(task), Some(3)).unwrap();
        let seqs: Vec<u64> = snap.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(snap.cursors[&Subject::Task(task)], 5);

        let err = bus.snapshot(&SubjectFilter::Task(task), Some(2)).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::ReplayWindowExceeded {
                requested: 2,
                oldest: 3,
                ..
            }
        ));
    }

    #[test]
    fn replay_from_the_future_moves_cursor_forward() {
        let bus = EventBus::new(4);
        let task = TaskId::new();
        bus.publish(draft(task, TaskState::Submitted, TaskState::Working));

        let snap = bus.snapshot(&SubjectFilter::Task(task), Some(10)).unwrap();
        assert!(snap.events.is_empty());
        assert_eq!(snap.cursors[&Subject::Task(task)], 9);

        let unseen = TaskId::new();
        let snap = bus.snapshot(&SubjectFilter::Task(unseen), Some(0)).unwrap();
        assert_eq!(snap.cursors[&Subject::Task(unseen)], 0);
    }

    #[test]
    fn context_snapshot_only_covers_matching_subjects() {
        let bus = EventBus::new(4);
        let a = TaskId::new();
        bus.publish(draft(a, TaskState::Submitted, TaskState::Working));
        bus.publish(EventDraft {
            context_id: Some(ContextId::from("other")),
            ..draft(TaskId::new(), TaskState::Submitted, TaskState::Working)
        });

        let snap = bus
            .snapshot(&SubjectFilter::Context(ContextId::from("ctx")), Some(1))
            .unwrap();
        assert_eq!(snap.events.len(), 1);
        assert_eq!(snap.events[0].subject, Subject::Task(a));
    }

    #[test]
    fn full_intake_marks_degraded_without_blocking() {
        let bus = EventBus::new(8);
        let (tx, _rx) = mpsc::channel(1);
        let stats = Arc::new(DeliveryStats::default());
        bus.attach(
            SubscriptionId::new(),
            Intake {
                filter: SubjectFilter::All,
                tx,
                stats: Arc::clone(&stats),
            },
        );

        let task = TaskId::new();
        for _ in 0..3 {
            bus.publish(draft(task, TaskState::Working, TaskState::InputRequired));
        }

        assert!(stats.is_degraded());
        assert_eq!(stats.dropped(), 2);
    }

    #[test]
    fn closed_intakes_are_pruned_on_publish() {
        let bus = EventBus::new(8);
        let (tx, rx) = mpsc::channel(4);
        bus.attach(
            SubscriptionId::new(),
            Intake {
                filter: SubjectFilter::All,
                tx,
                stats: Arc::default(),
            },
        );
        drop(rx);

        bus.publish(draft(TaskId::new(), TaskState::Submitted, TaskState::Working));
        assert_eq!(bus.intake_count(), 0);
    }
}
