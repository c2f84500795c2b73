//! Per-host persistent shell sessions.
//!
//! A [`SessionPool`] keeps at most one long-lived shell per host key: a local
//! `bash` for `localhost` and the filter session, `ssh <host>` for everything
//! else. Commands for one host are serialized on its session; different hosts
//! run concurrently. Broken sessions are replaced transparently and idle ones
//! are reaped in the background.

mod error;
mod pool;
mod session;
mod shell;

pub use error::{Error, Result};
pub use pool::{CommandRunner, PoolConfig, SessionPool, SessionProfile};
pub use session::{SessionState, SessionStatus};
pub use shell::{CommandOutput, FILTER_SESSION_KEY, ShellLauncher, is_local_key};
