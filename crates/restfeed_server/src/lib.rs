//! # restfeed server
//!
//! Publishes record collections as REST resources and keeps a revisioned
//! change log per collection, so that remote consumers can follow it.
//!
//! This crate provides:
//! - `ObjectStateStore`: the materialized per-key index (optionally journaled)
//! - `ChangeManager`: revision assignment and long-poll waiting
//! - `PublishedService`: list/get/create/update/delete with version tags
//! - `RestServer`: service registry and HTTP routing over `http` types
//!
//! # Architecture
//!
//! Every mutation of a tracked collection goes through the change manager,
//! which assigns the next revision and upserts the object's index row in a
//! single critical section. Reads in tracking mode are served from that
//! index; the change endpoints serve the index ordered by revision.
//!
//! Socket handling is left to the embedding application: it turns
//! incoming requests into `http::Request<Vec<u8>>`, attaches the
//! authenticated [`Principal`] as an extension, and passes a
//! [`ResponseSink`](restfeed_protocol::ResponseSink) that streams to the
//! client.
//!
//! ```rust,ignore
//! let server = RestServer::new(ServerConfig::new("http://localhost:8080/"))?;
//! server.register(definition, source, &callbacks)?;
//!
//! // per connection
//! server.handle_into(&request, &mut connection_sink);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod access;
mod callbacks;
mod change_manager;
mod config;
mod describe;
mod error;
mod handler;
mod server;
mod service;
mod source;
mod state_store;

pub use access::Principal;
pub use callbacks::{CallbackRegistry, DeleteFn, PublishFn, UpdateFn};
pub use change_manager::ChangeManager;
pub use config::{ServerConfig, REST_PATH};
pub use describe::{describe, Endpoint, ServiceDescription};
pub use error::{ServerError, ServerResult};
pub use server::RestServer;
pub use service::{Fetched, PublishedService, PutOutcome};
pub use source::{Constraint, MemoryCollection, Record, SourceCollection, SourceTransaction};
pub use state_store::{ObjectState, ObjectStateStore};
