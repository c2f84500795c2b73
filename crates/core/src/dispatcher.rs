//! Probe dispatcher
//!
//! Turns `probe` and `run` requests into executions on the host's session
//! and builds the reply: output, follow-up suggestions, and the rendering
//! hints clients need.

use std::sync::Arc;

use tracing::debug;
use wurm_protocol::{Frame, LOCAL_HOST, ProbeDefinition, RenderHint};
use wurm_runtime::CommandRunner;

use crate::error::Result;
use crate::filter::LocalFilter;
use crate::registry::ProbeRegistry;

/// Outcome of one probe execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
	pub host: String,
	pub probe: String,
	pub stdout: String,
	pub stderr: String,
	/// Follow-up probes enqueued by this output, in catalog order.
	pub next: Vec<String>,
	pub name: Option<String>,
	pub render: Option<RenderHint>,
	pub kind: Option<String>,
}

impl ProbeReport {
	pub fn into_frame(self) -> Frame {
		Frame {
			cmd: "probe".into(),
			host: Some(self.host),
			probe: Some(self.probe),
			stdout: Some(self.stdout),
			stderr: Some(self.stderr),
			next: Some(self.next),
			name: self.name,
			render: self.render,
			kind: self.kind,
			..Frame::default()
		}
	}
}

/// Outcome of one ad-hoc command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
	pub host: String,
	pub id: String,
	pub stdout: String,
	pub stderr: String,
}

impl RunReport {
	pub fn into_frame(self) -> Frame {
		Frame {
			cmd: "run".into(),
			host: Some(self.host),
			id: Some(self.id),
			stdout: Some(self.stdout),
			stderr: Some(self.stderr),
			..Frame::default()
		}
	}
}

pub struct Dispatcher {
	registry: Arc<ProbeRegistry>,
	runner: Arc<dyn CommandRunner>,
	filter: LocalFilter,
}

impl Dispatcher {
	pub fn new(registry: Arc<ProbeRegistry>, runner: Arc<dyn CommandRunner>) -> Self {
		Self::with_filter(registry, runner, LocalFilter::default())
	}

	pub fn with_filter(registry: Arc<ProbeRegistry>, runner: Arc<dyn CommandRunner>, filter: LocalFilter) -> Self {
		Self { registry, runner, filter }
	}

	pub fn registry(&self) -> &ProbeRegistry {
		&self.registry
	}

	/// Runs probe `probe` on `host`.
	///
	/// Returns `Ok(None)` without touching any session when a local-only
	/// probe is requested for a remote host.
	///
	/// # Errors
	///
	/// [`Error::UnknownProbe`](crate::Error::UnknownProbe) for names missing
	/// from the registry, runtime errors from the session pool otherwise.
	pub async fn run(&self, host: &str, probe: &str) -> Result<Option<ProbeReport>> {
		let definition = self.registry.require(probe)?;

		if definition.local_only && host != LOCAL_HOST {
			debug!(target = "wurm.dispatch", host, probe, "skipping local-only probe on remote host");
			return Ok(None);
		}

		let output = self.runner.execute(host, &definition.command).await?;
		// Follow-ups look at the raw output, before any local filter.
		let next = self.registry.follow_ups(probe, &output.stdout);

		let output = match &definition.local_filter {
			Some(filter) => self.filter.apply(self.runner.as_ref(), &output.stdout, filter).await,
			None => output,
		};

		debug!(target = "wurm.dispatch", host, probe, next = ?next, "probe finished");
		Ok(Some(report(host, definition, output.stdout, output.stderr, next)))
	}

	/// Runs an arbitrary command on `host`, bypassing the registry.
	pub async fn run_command(&self, host: &str, id: &str, command: &str) -> Result<RunReport> {
		let output = self.runner.execute(host, command).await?;
		Ok(RunReport {
			host: host.to_string(),
			id: id.to_string(),
			stdout: output.stdout,
			stderr: output.stderr,
		})
	}
}

fn report(host: &str, definition: &ProbeDefinition, stdout: String, stderr: String, next: Vec<String>) -> ProbeReport {
	ProbeReport {
		host: host.to_string(),
		probe: definition.id.clone(),
		stdout,
		stderr,
		next,
		name: definition.name.clone(),
		render: definition.render.clone(),
		kind: definition.kind.clone(),
	}
}
