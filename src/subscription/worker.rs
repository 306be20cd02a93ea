// src/subscription/worker.rs

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::{DeliveryStats, Event, Subject};
use crate::subscription::SubscriptionFilter;
use crate::types::SubscriptionId;

/// Events lost for one subject, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GapMarker {
    pub subject: Subject,
    pub missed_from: u64,
    pub missed_to: u64,
}

impl GapMarker {
    pub fn missed(&self) -> u64 {
        self.missed_to - self.missed_from + 1
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "data")]
pub enum Delivery {
    Event(Event),
    Gap(GapMarker),
}

impl Delivery {
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Delivery::Event(event) => Some(event),
            Delivery::Gap(_) => None,
        }
    }

    pub fn into_event(self) -> Option<Event> {
        match self {
            Delivery::Event(event) => Some(event),
            Delivery::Gap(_) => None,
        }
    }
}

/// Per-subscription pump from the bus intake to the consumer.
///
/// Keeps the last delivered sequence per subject. Anything at or below the
/// cursor is a duplicate of the replay snapshot and is dropped; anything past
/// `cursor + 1` means the intake overflowed and yields one gap marker. Drops
/// with no later event behind them are reported once the intake runs dry.
enum Wake {
    Event(Event),
    Dropped,
}

pub(crate) struct Worker {
    id: SubscriptionId,
    filter: SubscriptionFilter,
    intake: mpsc::Receiver<Event>,
    out: mpsc::Sender<Delivery>,
    cursors: HashMap<Subject, u64>,
    stats: Arc<DeliveryStats>,
}

impl Worker {
    pub(crate) fn new(
        id: SubscriptionId,
        filter: SubscriptionFilter,
        intake: mpsc::Receiver<Event>,
        out: mpsc::Sender<Delivery>,
        cursors: HashMap<Subject, u64>,
        stats: Arc<DeliveryStats>,
    ) -> Self {
        Self {
            id,
            filter,
            intake,
            out,
            cursors,
            stats,
        }
    }

    /// Deliver `replay`, then live events, until the intake is detached or the
    /// consumer goes away.
    pub(crate) async fn run(mut self, replay: Vec<Event>) {
        debug!(subscription = %self.id, replayed = replay.len(), "subscription worker started");

        for event in replay {
            if !self.deliver(event).await {
                debug!(subscription = %self.id, "consumer gone during replay");
                return;
            }
        }

        loop {
            let wake = tokio::select! {
                biased;
                next = self.intake.recv() => match next {
                    Some(event) => Wake::Event(event),
                    None => break,
                },
                _ = self.stats.wait_for_drop() => Wake::Dropped,
                _ = self.out.closed() => break,
            };
            let open = match wake {
                // Cursors start at the snapshot head, so live copies of
                // replayed events are dropped in `offer`.
                Wake::Event(event) => self.offer(event).await,
                Wake::Dropped => self.report_drops().await,
            };
            if !open {
                break;
            }
        }

        debug!(subscription = %self.id, "subscription worker stopped");
    }

    /// Replay path: events are already contiguous from the requested start.
    async fn deliver(&mut self, event: Event) -> bool {
        if !self.filter.accepts(&event) {
            return true;
        }
        self.send(Delivery::Event(event)).await
    }

    async fn offer(&mut self, event: Event) -> bool {
        let last = self.cursor(event.subject);
        if event.seq <= last {
            return true;
        }

        if event.seq > last + 1 && !self.send_gap(event.subject, last + 1, event.seq - 1).await {
            return false;
        }

        self.cursors.insert(event.subject, event.seq);
        if !self.filter.accepts(&event) {
            return true;
        }
        self.send(Delivery::Event(event)).await
    }

    /// Emit a gap for every subject whose dropped events were not followed by
    /// a delivered one. Only runs once the intake is drained; anything the bus
    /// queues afterwards is sequenced past the reported range.
    async fn report_drops(&mut self) -> bool {
        let mut unreported: Vec<(Subject, u64)> = self.stats.take_unreported().into_iter().collect();
        unreported.sort_by_key(|(_, seq)| *seq);

        for (subject, dropped_to) in unreported {
            let last = self.cursor(subject);
            if dropped_to <= last {
                continue;
            }
            if !self.send_gap(subject, last + 1, dropped_to).await {
                return false;
            }
            self.cursors.insert(subject, dropped_to);
        }
        true
    }

    fn cursor(&self, subject: Subject) -> u64 {
        self.cursors.get(&subject).copied().unwrap_or(0)
    }

    async fn send_gap(&mut self, subject: Subject, missed_from: u64, missed_to: u64) -> bool {
        let gap = GapMarker {
            subject,
            missed_from,
            missed_to,
        };
        warn!(
            subscription = %self.id,
            subject = %gap.subject,
            from = gap.missed_from,
            to = gap.missed_to,
            "events lost to a full subscriber queue"
        );
        self.stats.record_gap();
        self.send(Delivery::Gap(gap)).await
    }

    async fn send(&mut self, delivery: Delivery) -> bool {
        let is_event = matches!(delivery, Delivery::Event(_));
        if self.out.send(delivery).await.is_err() {
            return false;
        }
        if is_event {
            self.stats.record_delivered();
        }
        true
    }
}
