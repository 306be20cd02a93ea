// src/subscription/mod.rs

//! Long-lived observers of the event bus.

pub mod filter;
pub mod manager;
pub mod worker;

pub use filter::SubscriptionFilter;
pub use manager::{SubscriptionHandle, SubscriptionInfo, SubscriptionManager};
pub use worker::{Delivery, GapMarker};
