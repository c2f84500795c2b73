use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::probe::RenderHint;
use crate::PROTOCOL_VERSION;

/// Error text for commands the gateway refuses, including everything but
/// `auth` on a connection that has not authenticated yet.
pub const UNSUPPORTED_COMMAND: &str = "Unsupported command";

/// Server-to-client message.
///
/// Every frame names the command it answers in `cmd`. Replies carry no
/// request id, so clients correlate on `(cmd, host, probe)` for probes and
/// `(cmd, host, id)` for ad-hoc runs. Optional fields are omitted when unset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
	pub cmd: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub protocol: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub host: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub probe: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stdout: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stderr: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub next: Option<Vec<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub render: Option<RenderHint>,
	#[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
}

impl Frame {
	fn new(cmd: impl Into<String>) -> Self {
		Self {
			cmd: cmd.into(),
			..Default::default()
		}
	}

	/// Greeting sent as soon as a connection is accepted.
	pub fn version(version: impl Into<String>) -> Self {
		Self {
			version: Some(version.into()),
			protocol: Some(PROTOCOL_VERSION),
			..Self::new("version")
		}
	}

	/// `{cmd: "auth", result: 0}` on success, `result: 1` on failure.
	pub fn auth(accepted: bool) -> Self {
		Self {
			result: Some(Value::from(if accepted { 0 } else { 1 })),
			..Self::new("auth")
		}
	}

	pub fn result(cmd: impl Into<String>, result: Value) -> Self {
		Self {
			result: Some(result),
			..Self::new(cmd)
		}
	}

	pub fn error(cmd: impl Into<String>, error: impl Into<String>) -> Self {
		Self {
			error: Some(error.into()),
			..Self::new(cmd)
		}
	}

	pub fn unsupported(cmd: impl Into<String>) -> Self {
		Self::error(cmd, UNSUPPORTED_COMMAND)
	}

	/// Error scoped to one host/probe pair so clients can attach it to the right entry.
	pub fn probe_error(host: impl Into<String>, probe: impl Into<String>, error: impl Into<String>) -> Self {
		Self {
			host: Some(host.into()),
			probe: Some(probe.into()),
			..Self::error("probe", error)
		}
	}

	/// Error scoped to one ad-hoc run.
	pub fn run_error(host: impl Into<String>, id: impl Into<String>, error: impl Into<String>) -> Self {
		Self {
			host: Some(host.into()),
			id: Some(id.into()),
			..Self::error("run", error)
		}
	}

	pub fn is_error(&self) -> bool {
		self.error.is_some()
	}

	/// `true` when this is an `auth` reply with `result: 0`.
	pub fn auth_accepted(&self) -> bool {
		self.cmd == "auth" && self.result.as_ref().and_then(Value::as_u64) == Some(0)
	}

	pub fn to_json(&self) -> String {
		serde_json::to_string(self).unwrap_or_else(|err| {
			format!(r#"{{"cmd":{:?},"error":"frame serialization failed: {err}"}}"#, self.cmd)
		})
	}
}
