//! wurm: watch many hosts through persistent shell sessions.
//!
//! The gateway side runs small diagnostic commands ("probes") on per-host
//! sessions and tells clients which dependent probes the output calls for.
//! The client side keeps track of result freshness and re-issues stale probes.
//!
//! # Main Types
//!
//! - [`ProbeRegistry`] - the probe catalog and its dependency index
//! - [`Dispatcher`] - runs probes and ad-hoc commands on host sessions
//! - [`Discovery`] - host, history, and cluster discovery
//! - [`Scheduler`] - per host/probe staleness state machine
//! - [`ProbeClient`] - WebSocket client driving a [`Scheduler`]

mod client;
mod discovery;
mod dispatcher;
mod error;
mod filter;
mod registry;
mod scheduler;
mod severity;

pub use client::{ClientConfig, ClientEvent, DEFAULT_RECONNECT_DELAY, ProbeClient, RunOutput};
pub use discovery::{Discovery, DiscoveryConfig, KubeContexts, is_valid_target, parse_history, parse_ssh_processes};
pub use dispatcher::{Dispatcher, ProbeReport, RunReport};
pub use error::{Error, Result};
pub use filter::{DEFAULT_SCRATCH_PATH, FILTER_RUN_FAILED, LocalFilter, SCRATCH_WRITE_FAILED};
pub use registry::{DEFAULT_CATALOG, ProbeRegistry};
pub use scheduler::{
	DEFAULT_MAX_CHAIN_DEPTH, DEFAULT_REFRESH_INTERVAL, FollowUp, Outcome, ProbeResult, Scheduler, SchedulerConfig,
};
pub use severity::classify;

pub use wurm_protocol as protocol;
pub use wurm_runtime as runtime;
