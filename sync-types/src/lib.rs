//! # sync-types
//!
//! Shared types for the tidal-sync data synchronization core.
//!
//! This crate provides the foundational types used across all tidal-sync crates:
//! - [`TopicId`], [`SessionId`], [`SubscriptionId`], [`RecordId`] - Identity types
//! - [`Timestamp`] - Millisecond wall-clock instants
//! - [`GeoPoint`] - Coordinates with great-circle distance
//! - [`InterestSet`] - What a live subscription filters on
//! - [`Record`], [`LiveMessage`] - The uniform update shape delivered to listeners

#![warn(missing_docs)]
#![warn(clippy::all)]

mod geo;
mod ids;
mod interest;
mod record;

pub use geo::{GeoPoint, EARTH_RADIUS_METERS};
pub use ids::{RecordId, SessionId, SubscriptionId, Timestamp, TopicId};
pub use interest::InterestSet;
pub use record::{ChangeKind, LiveMessage, Record};
