//! Buy-Box Repricing Engine
//!
//! Keeps a seller's marketplace listings priced against competing offers
//! while staying inside the marketplace API's per-endpoint quotas.
//!
//! Offer-change notifications are deduplicated into a bounded per-listing
//! offer history, the Buy-Box algorithm decides price moves from that
//! history, and the resulting changes are batched into bulk feeds. Every
//! remote call is gated by the sliding-window quota controller.

pub mod clock;
pub mod config;
pub mod errors;
pub mod feeds;
pub mod history;
pub mod inbound;
pub mod locks;
pub mod notification;
pub mod pricing;
pub mod processor;
pub mod quota;
pub mod remote;
pub mod scheduler;
pub mod storage;
pub mod tasks;
pub mod types;
