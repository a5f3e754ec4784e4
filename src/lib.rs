//! Pacer - Rate-Limited Campaign Delivery
//!
//! This crate drains broadcast campaigns through a single delivery channel
//! while respecting hourly and daily send caps, minimum spacing between
//! sends and randomized jitter. Campaign progress and limiter state are
//! persisted so an interrupted run can be resumed after a restart.

pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod model;
pub mod queue;
pub mod ratelimit;
pub mod render;
pub mod retry;
pub mod store;

#[cfg(test)]
mod testutil;
