#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! homelink library: the cloud device connector and its controller client.
//!
//! - `protocol`: tunnel message model, frame codec, HTTP envelopes
//! - `connector`: channel sessions, the session registry, statistics
//! - `auth` / `repository`: access-token authorization and identity storage
//! - `routes`: `/Connector` upgrade, cloud API, fallback reverse proxy
//! - `client`: controller side, dials the cloud and serves local requests
//! - `config`: configuration loading

pub mod auth;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod protocol;
pub mod repository;
pub mod routes;
pub mod state;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use connector::{DeviceConnector, SessionIdentifier};
pub use error::ConnectorError;
pub use protocol::{Message, MessageType};
pub use state::AppState;
