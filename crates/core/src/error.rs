//! Error types for probe dispatch, discovery, and the probe client.

use thiserror::Error;

/// Result type alias for wurm operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	/// The requested probe is not in the registry.
	#[error("No such probe")]
	UnknownProbe { probe: String },

	/// The probe catalog could not be loaded.
	#[error("Invalid probe catalog: {0}")]
	Catalog(String),

	/// A collaborator printed something that is not the expected JSON document.
	#[error("Failed to parse output of {source_name}: {reason}")]
	Parse { source_name: String, reason: String },

	/// A discovery collaborator could not be run or exited unsuccessfully.
	#[error("Discovery command '{command}' failed: {reason}")]
	Discovery { command: String, reason: String },

	/// Session pool failure (spawn, execution, timeout).
	#[error(transparent)]
	Runtime(#[from] wurm_runtime::Error),

	/// WebSocket transport failure on the client side.
	#[error("Transport error: {0}")]
	Transport(#[from] tokio_tungstenite::tungstenite::Error),

	/// The client has no open connection to send on.
	#[error("Not connected")]
	NotConnected,

	/// The server answered an ad-hoc run with an error frame.
	#[error("Remote error: {0}")]
	Remote(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl Error {
	pub(crate) fn parse(source_name: impl Into<String>, reason: impl ToString) -> Self {
		Error::Parse {
			source_name: source_name.into(),
			reason: reason.to_string(),
		}
	}

	pub(crate) fn discovery(command: impl Into<String>, reason: impl ToString) -> Self {
		Error::Discovery {
			command: command.into(),
			reason: reason.to_string(),
		}
	}
}
