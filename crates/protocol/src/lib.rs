//! Wire types for the wurm probe gateway.
//!
//! The gateway speaks a line-oriented text protocol from client to server and
//! answers with JSON frames:
//!
//! 1. Server sends a [`Frame`] with `cmd: "version"` as soon as a client connects
//! 2. Client authenticates with `auth <token>` (see [`Command::Auth`])
//! 3. Client issues commands such as `probe <host>:::<probe>`
//! 4. Server answers every command with a [`Frame`] whose `cmd` names the
//!    originating command, so asynchronous replies can be correlated
//!
//! # Main Types
//!
//! - [`Command`] - parsed client request line
//! - [`Frame`] - server reply, always carrying `cmd`
//! - [`ProbeDefinition`] - one entry of the probe catalog
//! - [`Severity`] - client-side classification of a probe result

mod command;
mod frame;
mod probe;

pub use command::{Command, CommandKind, ParseError};
pub use frame::{Frame, UNSUPPORTED_COMMAND};
pub use probe::{ProbeDefinition, ProbeMeta, RenderHint, Severity, SeverityRules};

/// Protocol compatibility marker sent in the `version` frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// Host key of the machine running the gateway.
pub const LOCAL_HOST: &str = "localhost";

/// Delimiter between host-scoped parameters, chosen to avoid clashing with `host:port`.
pub const PARAM_DELIMITER: &str = ":::";

/// Default gateway port.
pub const DEFAULT_PORT: u16 = 2048;

/// Default gateway bind address.
pub const DEFAULT_HOST: &str = "127.0.0.1";
