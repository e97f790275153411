//! # restfeed consumer
//!
//! Follows the change feeds of remote restfeed collections.
//!
//! This crate provides:
//! - `FollowRegistry`, which runs at most one listener per collection URL
//! - Background listeners with reconnects and exponential backoff
//! - One-shot fetches of everything after the checkpoint
//! - Creating objects in remote collections (`FollowRegistry::post_object`)
//! - Durable checkpoints (`FileFollowStore`)
//! - An HTTP client abstraction with an in-process loopback client
//!
//! ## Delivery
//!
//! Changes of one collection are applied strictly in feed order on the
//! listener's own thread. The checkpoint is persisted after every applied
//! change, so delivery is at-least-once and appliers must be idempotent.
//! Any failure drops the connection; the listener reconnects from the last
//! persisted checkpoint after a backoff delay.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod checkpoint;
mod config;
mod error;
mod http;
mod listener;
mod processor;
mod registry;

pub use crate::http::{
    AbortHandle, HttpClient, HttpRequest, HttpResponse, LoopbackClient, LoopbackServer,
};
pub use applier::{ChangeApplier, MemoryApplier};
pub use checkpoint::{FileFollowStore, FollowState, FollowStateStore, MemoryFollowStore};
pub use config::{Backoff, BackoffConfig, ListenerConfig};
pub use error::{ConsumeError, ConsumeResult};
pub use listener::ListenerState;
pub use registry::FollowRegistry;
