//! # restfeed protocol
//!
//! Wire types shared by the publishing server and the feed consumer.
//!
//! This crate provides:
//! - `ChangeRecord` for change feed entries
//! - `ServiceDefinition` describing a published collection
//! - Version tag and key helpers
//! - A streaming decoder for long-poll feed bodies
//! - `ResponseSink` for handlers that stream their responses
//!
//! This is a pure protocol crate with no I/O of its own beyond reading
//! from a caller-supplied `Read`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod error;
mod params;
mod service;
mod sink;
mod tag;

pub use change::{encode_change_list, write_feed_entry, ChangeRecord, ChangeStream, Revision};
pub use error::{ProtocolError, ProtocolResult};
pub use params::{
    changes_url, parse_bool_param, CURRENT_USER_TOKEN, DEFAULT_FEED_TIMEOUT_MS, FEED_HEARTBEAT,
    PARAM_ABOUT, PARAM_DATA, PARAM_SINCE, PARAM_TIMEOUT,
};
pub use service::{ServiceDefinition, ServiceFlags, WORLD_READABLE};
pub use sink::{BufferedResponse, ResponseSink};
pub use tag::{compute_etag, is_valid_key, key_from_value};

/// Protocol version reported by service overviews.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
