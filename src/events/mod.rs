// src/events/mod.rs

pub mod bus;
pub mod event;

pub use bus::{DeliveryStats, EventBus, Intake, ReplaySnapshot};
pub use event::{Change, Event, EventDraft, Subject, SubjectFilter};
