use std::fmt;

use thiserror::Error;

use crate::PARAM_DELIMITER;

/// A client request line, parsed.
///
/// Lines have the shape `<command>( <parameters>)?`. The command is the text
/// before the first space; everything after it belongs to the parameters, so
/// ad-hoc `run` commands may contain spaces of their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	/// `auth <token>`
	Auth { token: String },
	/// `hosts`
	Hosts,
	/// `probes`
	Probes,
	/// `history`
	History,
	/// `kubectxt`
	KubeContexts,
	/// `localnet`
	LocalNet,
	/// `status`
	Status,
	/// `probe <host>:::<name>`
	Probe { host: String, probe: String },
	/// `run <host>:::<id>:::<command>`
	Run {
		host: String,
		id: String,
		command: String,
	},
	/// `probe_kubectxt <context>/<namespace>`
	ProbeKubeContext { context: String, namespace: String },
	/// Anything the gateway does not know.
	Unsupported { cmd: String },
}

/// Command names without their parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
	Auth,
	Hosts,
	Probes,
	History,
	KubeContexts,
	LocalNet,
	Status,
	Probe,
	Run,
	ProbeKubeContext,
}

impl CommandKind {
	pub const ALL: [CommandKind; 10] = [
		CommandKind::Auth,
		CommandKind::Hosts,
		CommandKind::Probes,
		CommandKind::History,
		CommandKind::KubeContexts,
		CommandKind::LocalNet,
		CommandKind::Status,
		CommandKind::Probe,
		CommandKind::Run,
		CommandKind::ProbeKubeContext,
	];

	/// Wire name of the command.
	pub fn as_str(self) -> &'static str {
		match self {
			CommandKind::Auth => "auth",
			CommandKind::Hosts => "hosts",
			CommandKind::Probes => "probes",
			CommandKind::History => "history",
			CommandKind::KubeContexts => "kubectxt",
			CommandKind::LocalNet => "localnet",
			CommandKind::Status => "status",
			CommandKind::Probe => "probe",
			CommandKind::Run => "run",
			CommandKind::ProbeKubeContext => "probe_kubectxt",
		}
	}

	pub fn from_name(name: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|kind| kind.as_str() == name)
	}
}

impl fmt::Display for CommandKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A known command arrived with parameters that do not fit its sub-format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed parameters for '{cmd}': expected {expected}")]
pub struct ParseError {
	pub cmd: &'static str,
	pub expected: &'static str,
}

impl Command {
	/// Parses one inbound line.
	///
	/// Unknown commands are not an error: they become [`Command::Unsupported`]
	/// so the gateway can answer them with the standard rejection frame.
	pub fn parse(line: &str) -> Result<Self, ParseError> {
		let line = line.trim_end_matches(['\r', '\n']);
		let (cmd, params) = match line.split_once(' ') {
			Some((cmd, params)) => (cmd, Some(params)),
			None => (line, None),
		};

		let Some(kind) = CommandKind::from_name(cmd) else {
			return Ok(Command::Unsupported { cmd: cmd.to_string() });
		};

		let params = params.unwrap_or_default();
		match kind {
			CommandKind::Auth => Ok(Command::Auth {
				token: params.trim().to_string(),
			}),
			CommandKind::Hosts => Ok(Command::Hosts),
			CommandKind::Probes => Ok(Command::Probes),
			CommandKind::History => Ok(Command::History),
			CommandKind::KubeContexts => Ok(Command::KubeContexts),
			CommandKind::LocalNet => Ok(Command::LocalNet),
			CommandKind::Status => Ok(Command::Status),
			CommandKind::Probe => {
				let malformed = ParseError {
					cmd: kind.as_str(),
					expected: "<host>:::<probe>",
				};
				let (host, probe) = params.trim().split_once(PARAM_DELIMITER).ok_or(malformed.clone())?;
				if host.is_empty() || probe.is_empty() {
					return Err(malformed);
				}
				Ok(Command::Probe {
					host: host.to_string(),
					probe: probe.to_string(),
				})
			}
			CommandKind::Run => {
				let malformed = ParseError {
					cmd: kind.as_str(),
					expected: "<host>:::<id>:::<command>",
				};
				let mut parts = params.splitn(3, PARAM_DELIMITER);
				let (Some(host), Some(id), Some(command)) = (parts.next(), parts.next(), parts.next()) else {
					return Err(malformed);
				};
				if host.is_empty() || id.is_empty() {
					return Err(malformed);
				}
				Ok(Command::Run {
					host: host.trim().to_string(),
					id: id.to_string(),
					command: command.to_string(),
				})
			}
			CommandKind::ProbeKubeContext => {
				let malformed = ParseError {
					cmd: kind.as_str(),
					expected: "<context>/<namespace>",
				};
				let (context, namespace) = params.trim().split_once('/').ok_or(malformed.clone())?;
				if context.is_empty() || namespace.is_empty() {
					return Err(malformed);
				}
				Ok(Command::ProbeKubeContext {
					context: context.to_string(),
					namespace: namespace.to_string(),
				})
			}
		}
	}

	/// Name echoed back in the `cmd` field of every reply.
	pub fn name(&self) -> &str {
		match self {
			Command::Unsupported { cmd } => cmd,
			other => other.kind().map(CommandKind::as_str).unwrap_or_default(),
		}
	}

	/// Host a command executes on, for the commands that touch a host session.
	pub fn host(&self) -> Option<&str> {
		match self {
			Command::Probe { host, .. } | Command::Run { host, .. } => Some(host),
			_ => None,
		}
	}

	pub fn kind(&self) -> Option<CommandKind> {
		Some(match self {
			Command::Auth { .. } => CommandKind::Auth,
			Command::Hosts => CommandKind::Hosts,
			Command::Probes => CommandKind::Probes,
			Command::History => CommandKind::History,
			Command::KubeContexts => CommandKind::KubeContexts,
			Command::LocalNet => CommandKind::LocalNet,
			Command::Status => CommandKind::Status,
			Command::Probe { .. } => CommandKind::Probe,
			Command::Run { .. } => CommandKind::Run,
			Command::ProbeKubeContext { .. } => CommandKind::ProbeKubeContext,
			Command::Unsupported { .. } => return None,
		})
	}
}

impl fmt::Display for Command {
	/// Renders the command in its wire form, the inverse of [`Command::parse`].
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Command::Auth { token } => write!(f, "auth {token}"),
			Command::Probe { host, probe } => write!(f, "probe {host}{PARAM_DELIMITER}{probe}"),
			Command::Run { host, id, command } => {
				write!(f, "run {host}{PARAM_DELIMITER}{id}{PARAM_DELIMITER}{command}")
			}
			Command::ProbeKubeContext { context, namespace } => {
				write!(f, "probe_kubectxt {context}/{namespace}")
			}
			other => f.write_str(other.name()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_bare_commands() {
		assert_eq!(Command::parse("hosts").unwrap(), Command::Hosts);
		assert_eq!(Command::parse("probes\n").unwrap(), Command::Probes);
		assert_eq!(Command::parse("kubectxt").unwrap(), Command::KubeContexts);
		assert_eq!(Command::parse("status").unwrap(), Command::Status);
	}

	#[test]
	fn host_is_known_for_session_commands_only() {
		assert_eq!(Command::parse("probe web1:::disk").unwrap().host(), Some("web1"));
		assert_eq!(Command::parse("run db1:::1:::uptime").unwrap().host(), Some("db1"));
		assert_eq!(Command::parse("hosts").unwrap().host(), None);
	}

	#[test]
	fn probe_splits_on_triple_colon_not_port_colon() {
		let cmd = Command::parse("probe db01:2222:::disk").unwrap();
		assert_eq!(
			cmd,
			Command::Probe {
				host: "db01:2222".into(),
				probe: "disk".into(),
			}
		);
	}

	#[test]
	fn run_keeps_spaces_and_delimiters_in_command() {
		let cmd = Command::parse("run web1:::7:::echo a:::b | wc -c").unwrap();
		assert_eq!(
			cmd,
			Command::Run {
				host: "web1".into(),
				id: "7".into(),
				command: "echo a:::b | wc -c".into(),
			}
		);
	}

	#[test]
	fn probe_without_delimiter_is_malformed() {
		let err = Command::parse("probe localhost").unwrap_err();
		assert_eq!(err.cmd, "probe");
	}

	#[test]
	fn kube_context_requires_namespace() {
		assert!(Command::parse("probe_kubectxt prod").is_err());
		assert_eq!(
			Command::parse("probe_kubectxt prod/kube-system").unwrap(),
			Command::ProbeKubeContext {
				context: "prod".into(),
				namespace: "kube-system".into(),
			}
		);
	}

	#[test]
	fn unknown_command_keeps_its_name() {
		let cmd = Command::parse("reboot now").unwrap();
		assert_eq!(cmd.name(), "reboot");
		assert_eq!(cmd.kind(), None);
	}

	#[test]
	fn display_matches_wire_form() {
		let cmd = Command::Probe {
			host: "localhost".into(),
			probe: "uptime".into(),
		};
		assert_eq!(cmd.to_string(), "probe localhost:::uptime");
		assert_eq!(Command::parse(&cmd.to_string()).unwrap(), cmd);
		assert_eq!(Command::History.to_string(), "history");
	}
}
