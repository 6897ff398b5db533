#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self
)]

//! Orchestration and messaging layer for a fleet of per-user containerized
//! worker agents: a lifecycle state machine over a durable pub/sub bus,
//! with an envelope protocol, load-balanced instance addressing, a
//! persistent state store, and request/response correlation.

pub mod bus;
pub mod config;
pub mod gateway;
pub mod lifecycle;
pub mod protocol;
pub mod runtime;
pub mod service;
pub mod store;
pub mod worker;

pub use bus::{BusClient, BusError};
pub use config::Config;
pub use gateway::{Gateway, GatewayError};
pub use lifecycle::{LifecycleError, LifecycleManager, TerminationReport};
pub use protocol::{Envelope, EnvelopeBody, Priority};
pub use store::{AgentState, AgentStatus};
