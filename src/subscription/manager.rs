// src/subscription/manager.rs

use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::errors::{OrchestratorError, Result};
use crate::events::{DeliveryStats, EventBus, Intake, SubjectFilter};
use crate::subscription::SubscriptionFilter;
use crate::subscription::worker::{Delivery, Worker};
use crate::types::SubscriptionId;

#[derive(Debug)]
struct Registration {
    filter: SubjectFilter,
    created_at: DateTime<Utc>,
    stats: Arc<DeliveryStats>,
    abort: Option<AbortHandle>,
}

/// Point-in-time view of one live subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub filter: SubjectFilter,
    pub created_at: DateTime<Utc>,
    pub degraded: bool,
    pub delivered: u64,
    pub dropped: u64,
    pub gaps: u64,
}

/// Owns the live subscriptions and their worker tasks.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    bus: Arc<EventBus>,
    registry: Arc<DashMap<SubscriptionId, Registration>>,
    queue_capacity: usize,
}

impl SubscriptionManager {
    /// `queue_capacity` bounds both the bus intake and the consumer queue of
    /// every subscription; it is clamped to at least 1.
    pub fn new(bus: Arc<EventBus>, queue_capacity: usize) -> Self {
        Self {
            bus,
            registry: Arc::new(DashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Open a subscription.
    ///
    /// The intake is registered on the bus before the replay snapshot is
    /// taken, so no event can fall between replay and live delivery. With
    /// `from_sequence` set, retained events from that sequence on are
    /// delivered first. Must be called from within a Tokio runtime.
    pub fn subscribe(
        &self,
        filter: impl Into<SubscriptionFilter>,
        from_sequence: Option<u64>,
    ) -> Result<SubscriptionHandle> {
        let runtime = Handle::try_current().map_err(|e| {
            OrchestratorError::Other(anyhow!("subscribe requires a tokio runtime: {e}"))
        })?;

        let filter = filter.into();
        let id = SubscriptionId::new();
        let stats = Arc::new(DeliveryStats::default());

        let (intake_tx, intake_rx) = mpsc::channel(self.queue_capacity);
        self.bus.attach(
            id,
            Intake {
                filter: filter.subject().clone(),
                tx: intake_tx,
                stats: Arc::clone(&stats),
            },
        );

        let snapshot = match self.bus.snapshot(filter.subject(), from_sequence) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.bus.detach(id);
                return Err(err);
            }
        };

        self.registry.insert(
            id,
            Registration {
                filter: filter.subject().clone(),
                created_at: Utc::now(),
                stats: Arc::clone(&stats),
                abort: None,
            },
        );

        let (out_tx, out_rx) = mpsc::channel(self.queue_capacity);
        let worker = Worker::new(
            id,
            filter.clone(),
            intake_rx,
            out_tx,
            snapshot.cursors,
            Arc::clone(&stats),
        );

        let bus = Arc::clone(&self.bus);
        let registry = Arc::clone(&self.registry);
        let join = runtime.spawn(async move {
            worker.run(snapshot.events).await;
            bus.detach(id);
            registry.remove(&id);
        });
        if let Some(mut registration) = self.registry.get_mut(&id) {
            registration.abort = Some(join.abort_handle());
        }

        info!(subscription = %id, filter = %filter.subject(), from = ?from_sequence, "subscription opened");

        Ok(SubscriptionHandle {
            id,
            rx: out_rx,
            stats,
            manager: self.clone(),
        })
    }

    /// Close a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.detach(id);
        match self.registry.remove(&id) {
            Some((_, registration)) => {
                if let Some(abort) = registration.abort {
                    abort.abort();
                }
                info!(subscription = %id, "subscription closed");
                true
            }
            None => {
                debug!(subscription = %id, "unsubscribe for unknown subscription");
                false
            }
        }
    }

    pub fn list(&self) -> Vec<SubscriptionInfo> {
        self.registry
            .iter()
            .map(|entry| {
                let r = entry.value();
                SubscriptionInfo {
                    id: *entry.key(),
                    filter: r.filter.clone(),
                    created_at: r.created_at,
                    degraded: r.stats.is_degraded(),
                    delivered: r.stats.delivered(),
                    dropped: r.stats.dropped(),
                    gaps: r.stats.gaps(),
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

/// Consumer end of a subscription. Dropping it closes the subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    rx: mpsc::Receiver<Delivery>,
    stats: Arc<DeliveryStats>,
    manager: SubscriptionManager,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next delivery, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Whether the bus has had to drop events for this subscription.
    pub fn is_degraded(&self) -> bool {
        self.stats.is_degraded()
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    pub fn unsubscribe(self) -> bool {
        self.manager.unsubscribe(self.id)
    }

    pub fn into_stream(self) -> impl Stream<Item = Delivery> + Send + Unpin {
        Box::pin(futures::stream::unfold(self, |mut handle| async move {
            handle.recv().await.map(|delivery| (delivery, handle))
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::time::timeout;

    use super::*;
    use crate::events::{Change, EventDraft, Subject};
    use crate::subscription::GapMarker;
    use crate::task::TaskState;
    use crate::types::{ContextId, TaskId};

    const STEPS: [(TaskState, TaskState); 5] = [
        (TaskState::Submitted, TaskState::Working),
        (TaskState::Working, TaskState::InputRequired),
        (TaskState::InputRequired, TaskState::Working),
        (TaskState::Working, TaskState::AuthRequired),
        (TaskState::AuthRequired, TaskState::Working),
    ];

    fn publish(bus: &EventBus, task: TaskId, (from, to): (TaskState, TaskState)) -> u64 {
        bus.publish(EventDraft {
            subject: Subject::Task(task),
            context_id: Some(ContextId::from("ctx")),
            change: Change::Task { from, to },
            reason: None,
            payload: None,
        })
        .seq
    }

    async fn next_event(handle: &mut SubscriptionHandle) -> crate::events::Event {
        let delivery = timeout(Duration::from_secs(2), handle.recv())
            .await
            .expect("delivery within timeout")
            .expect("subscription open");
        delivery.into_event().expect("event, not gap")
    }

    #[tokio::test]
    async fn replay_then_live_is_contiguous() {
        let bus = Arc::new(EventBus::new(16));
        let manager = SubscriptionManager::new(Arc::clone(&bus), 8);
        let task = TaskId::new();
        for step in STEPS {
            publish(&bus, task, step);
        }

        let mut handle = manager.subscribe(SubscriptionFilter::task(task), Some(3)).unwrap();
        for expected in 3..=5 {
            assert_eq!(next_event(&mut handle).await.seq, expected);
        }

        publish(&bus, task, (TaskState::Working, TaskState::Completed));
        let live = next_event(&mut handle).await;
        assert_eq!(live.seq, 6);
        assert_eq!(
            live.change,
            Change::Task {
                from: TaskState::Working,
                to: TaskState::Completed
            }
        );
    }

    #[tokio::test]
    async fn replay_older_than_ring_is_refused_and_nothing_leaks() {
        let bus = Arc::new(EventBus::new(2));
        let manager = SubscriptionManager::new(Arc::clone(&bus), 8);
        let task = TaskId::new();
        for step in STEPS {
            publish(&bus, task, step);
        }

        let err = manager
            .subscribe(SubscriptionFilter::task(task), Some(1))
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::ReplayWindowExceeded {
                requested: 1,
                oldest: 4,
                ..
            }
        ));
        assert_eq!(bus.intake_count(), 0);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn slow_consumer_gets_one_gap_marker() {
        let bus = Arc::new(EventBus::new(64));
        let manager = SubscriptionManager::new(Arc::clone(&bus), 2);
        let task = TaskId::new();
        let mut handle = manager.subscribe(SubscriptionFilter::task(task), None).unwrap();

        // Publishing never yields, so the worker cannot drain in between and
        // only the first two events fit in the intake.
        for _ in 0..20 {
            publish(&bus, task, (TaskState::Working, TaskState::InputRequired));
        }
        assert!(handle.is_degraded());
        assert_eq!(next_event(&mut handle).await.seq, 1);
        assert_eq!(next_event(&mut handle).await.seq, 2);

        publish(&bus, task, (TaskState::InputRequired, TaskState::Working));

        let gap = timeout(Duration::from_secs(2), handle.recv())
            .await
            .expect("delivery within timeout")
            .expect("subscription open");
        assert_eq!(
            gap,
            Delivery::Gap(GapMarker {
                subject: Subject::Task(task),
                missed_from: 3,
                missed_to: 20,
            })
        );
        assert_eq!(next_event(&mut handle).await.seq, 21);
        assert_eq!(handle.stats().gaps(), 1);
        assert_eq!(handle.stats().dropped(), 18);
    }

    #[tokio::test]
    async fn trailing_drops_are_reported_without_a_later_event() {
        let bus = Arc::new(EventBus::new(64));
        let manager = SubscriptionManager::new(Arc::clone(&bus), 1);
        let task = TaskId::new();
        let mut handle = manager.subscribe(SubscriptionFilter::task(task), None).unwrap();

        publish(&bus, task, (TaskState::Submitted, TaskState::Working));
        publish(&bus, task, (TaskState::Working, TaskState::InputRequired));
        publish(&bus, task, (TaskState::InputRequired, TaskState::Working));
        publish(&bus, task, (TaskState::Working, TaskState::Completed));
        assert_eq!(handle.stats().dropped(), 3);

        assert_eq!(next_event(&mut handle).await.seq, 1);
        let gap = timeout(Duration::from_secs(2), handle.recv())
            .await
            .expect("gap without further publishing")
            .expect("subscription open");
        assert_eq!(
            gap,
            Delivery::Gap(GapMarker {
                subject: Subject::Task(task),
                missed_from: 2,
                missed_to: 4,
            })
        );
        assert_eq!(handle.stats().gaps(), 1);

        // The lost tail is still in the replay ring.
        let mut replay = manager.subscribe(SubscriptionFilter::task(task), Some(2)).unwrap();
        for expected in 2..=4 {
            assert_eq!(next_event(&mut replay).await.seq, expected);
        }
    }

    #[tokio::test]
    async fn unsubscribe_ends_the_stream() {
        let bus = Arc::new(EventBus::new(8));
        let manager = SubscriptionManager::new(Arc::clone(&bus), 4);
        let handle = manager.subscribe(SubscriptionFilter::all(), None).unwrap();
        let id = handle.id();
        assert_eq!(manager.list().len(), 1);

        let mut stream = handle.into_stream();
        assert!(manager.unsubscribe(id));
        let end = timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("stream ends");
        assert!(end.is_none());
        assert!(!manager.unsubscribe(id));
        assert_eq!(bus.intake_count(), 0);
    }

    #[tokio::test]
    async fn dropping_the_handle_releases_the_subscription() {
        let bus = Arc::new(EventBus::new(8));
        let manager = SubscriptionManager::new(Arc::clone(&bus), 4);
        drop(manager.subscribe(SubscriptionFilter::all(), None).unwrap());

        timeout(Duration::from_secs(2), async {
            while !manager.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker cleans up after consumer drop");
        assert_eq!(bus.intake_count(), 0);
    }

    #[tokio::test]
    async fn predicate_filters_without_breaking_sequencing() {
        let bus = Arc::new(EventBus::new(8));
        let manager = SubscriptionManager::new(Arc::clone(&bus), 8);
        let task = TaskId::new();
        let mut handle = manager
            .subscribe(SubscriptionFilter::task(task).terminal_only(), None)
            .unwrap();

        for step in STEPS {
            publish(&bus, task, step);
        }
        publish(&bus, task, (TaskState::Working, TaskState::Completed));

        let event = next_event(&mut handle).await;
        assert_eq!(event.seq, 6);
        assert_eq!(handle.stats().gaps(), 0);
    }

    #[test]
    fn subscribe_outside_a_runtime_is_an_error() {
        let manager = SubscriptionManager::new(Arc::new(EventBus::new(4)), 4);
        let err = manager.subscribe(SubscriptionFilter::all(), None).unwrap_err();
        assert!(matches!(err, OrchestratorError::Other(_)));
        assert_eq!(manager.bus().intake_count(), 0);
    }
}
