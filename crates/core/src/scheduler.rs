//! Client-side probe scheduling
//!
//! Tracks, per host and probe, whether a request is in flight and when the
//! last answer arrived. The [`Scheduler`] is a plain state machine: callers
//! pass the current time in, and it answers which probes to issue. It never
//! performs I/O itself, which keeps [`ProbeClient`](crate::ProbeClient) thin
//! and the rules testable.
//!
//! Per (host, probe) the state is `idle -> updating -> idle`. A probe is only
//! (re)issued while idle, so there is never more than one request in flight
//! for the same pair.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};
use wurm_protocol::{Frame, LOCAL_HOST, ProbeMeta, Severity};

use crate::severity::classify;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Follow-up chains longer than this are cut.
pub const DEFAULT_MAX_CHAIN_DEPTH: u32 = 8;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
	/// Period of the per-host tick.
	pub refresh_interval: Duration,
	/// Probes that are never issued.
	pub blacklist: BTreeSet<String>,
	/// Maximum number of follow-up hops from an initial or refreshed probe.
	pub max_chain_depth: u32,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			refresh_interval: DEFAULT_REFRESH_INTERVAL,
			blacklist: BTreeSet::new(),
			max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
		}
	}
}

/// Latest known result of one probe on one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
	pub host: String,
	pub probe: String,
	pub stdout: String,
	pub stderr: String,
	pub next: Vec<String>,
	pub updating: bool,
	/// Epoch milliseconds of the last state change.
	pub timestamp: u64,
	pub severity: Severity,
}

/// A probe to issue because another one's output asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUp {
	pub probe: String,
	pub depth: u32,
}

/// What a server frame did to the schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
	Completed { result: ProbeResult, follow_ups: Vec<FollowUp> },
	Failed { host: String, probe: String, error: String },
}

#[derive(Debug, Clone, Default)]
struct ProbeState {
	updating: bool,
	timestamp: u64,
	depth: u32,
	result: Option<ProbeResult>,
}

#[derive(Debug, Default)]
pub struct Scheduler {
	config: SchedulerConfig,
	catalog: BTreeMap<String, ProbeMeta>,
	hosts: HashMap<String, BTreeMap<String, ProbeState>>,
}

impl Scheduler {
	pub fn new(config: SchedulerConfig) -> Self {
		Self {
			config,
			catalog: BTreeMap::new(),
			hosts: HashMap::new(),
		}
	}

	/// Replaces the probe catalog, as received from a `probes` frame.
	pub fn set_catalog(&mut self, catalog: BTreeMap<String, ProbeMeta>) {
		self.catalog = catalog;
	}

	pub fn catalog(&self) -> &BTreeMap<String, ProbeMeta> {
		&self.catalog
	}

	/// Starts tracking `host`. Existing probe state is kept.
	pub fn watch(&mut self, host: &str) {
		self.hosts.entry(host.to_string()).or_default();
	}

	/// True if `host` is watched but nothing was issued for it yet.
	pub fn is_untouched(&self, host: &str) -> bool {
		self.hosts.get(host).is_some_and(BTreeMap::is_empty)
	}

	pub fn watched_hosts(&self) -> impl Iterator<Item = &str> {
		self.hosts.keys().map(String::as_str)
	}

	/// Whether `probe` may be issued against `host`.
	///
	/// Probes missing from the catalog are refused, including every probe
	/// before the catalog has arrived.
	pub fn allows(&self, host: &str, probe: &str) -> bool {
		if self.config.blacklist.contains(probe) {
			return false;
		}
		let Some(meta) = self.catalog.get(probe) else {
			return false;
		};
		host == LOCAL_HOST || !meta.local_only
	}

	/// Initial probes for `host`, in name order.
	pub fn initial_probes(&self, host: &str) -> Vec<String> {
		self.catalog
			.iter()
			.filter(|(name, meta)| meta.initial && self.allows(host, name))
			.map(|(name, _)| name.clone())
			.collect()
	}

	/// Marks `probe` on `host` as updating if it may be issued now.
	///
	/// Returns false (and changes nothing) for disallowed probes, for pairs
	/// already in flight, and for follow-ups beyond the chain limit.
	pub fn begin(&mut self, host: &str, probe: &str, depth: u32, now: u64) -> bool {
		if !self.allows(host, probe) {
			debug!(target = "wurm.client", host, probe, "probe not allowed on host");
			return false;
		}
		if depth > self.config.max_chain_depth {
			warn!(target = "wurm.client", host, probe, depth, "follow-up chain too deep, dropping");
			return false;
		}

		let state = self.hosts.entry(host.to_string()).or_default().entry(probe.to_string()).or_default();
		if state.updating {
			return false;
		}
		state.updating = true;
		state.timestamp = now;
		state.depth = depth;
		if let Some(result) = &mut state.result {
			result.updating = true;
		}
		true
	}

	/// Applies a `probe` frame (result or error) received at `now`.
	///
	/// Frames for pairs that were never issued are ignored.
	pub fn complete(&mut self, frame: &Frame, now: u64) -> Option<Outcome> {
		let (Some(host), Some(probe)) = (frame.host.as_deref(), frame.probe.as_deref()) else {
			warn!(target = "wurm.client", cmd = %frame.cmd, "probe frame without host or probe");
			return None;
		};
		let Some(state) = self.hosts.get_mut(host).and_then(|probes| probes.get_mut(probe)) else {
			warn!(target = "wurm.client", host, probe, "frame does not match any issued probe");
			return None;
		};

		state.updating = false;
		state.timestamp = now;

		if let Some(error) = &frame.error {
			if let Some(result) = &mut state.result {
				result.updating = false;
				result.timestamp = now;
			}
			return Some(Outcome::Failed {
				host: host.to_string(),
				probe: probe.to_string(),
				error: error.clone(),
			});
		}

		let stdout = frame.stdout.clone().unwrap_or_default();
		let next = frame.next.clone().unwrap_or_default();
		let result = ProbeResult {
			host: host.to_string(),
			probe: probe.to_string(),
			severity: classify(&stdout, frame.render.as_ref()),
			stdout,
			stderr: frame.stderr.clone().unwrap_or_default(),
			next: next.clone(),
			updating: false,
			timestamp: now,
		};
		state.result = Some(result.clone());

		let depth = state.depth + 1;
		let follow_ups = next.into_iter().map(|probe| FollowUp { probe, depth }).collect();
		Some(Outcome::Completed { result, follow_ups })
	}

	/// Tracked probes on `host` whose result is older than their refresh period.
	///
	/// The local host only refreshes probes flagged `local`; remote hosts never
	/// refresh local-only probes.
	pub fn due_probes(&self, host: &str, now: u64) -> Vec<String> {
		let Some(probes) = self.hosts.get(host) else {
			return Vec::new();
		};
		probes
			.iter()
			.filter(|(name, state)| {
				let Some(meta) = self.catalog.get(name.as_str()) else {
					return false;
				};
				if host == LOCAL_HOST && !meta.local {
					return false;
				}
				!state.updating && now.saturating_sub(state.timestamp) > meta.refresh.saturating_mul(1000) && self.allows(host, name)
			})
			.map(|(name, _)| name.clone())
			.collect()
	}

	pub fn is_updating(&self, host: &str, probe: &str) -> bool {
		self.hosts
			.get(host)
			.and_then(|probes| probes.get(probe))
			.is_some_and(|state| state.updating)
	}

	pub fn result(&self, host: &str, probe: &str) -> Option<&ProbeResult> {
		self.hosts.get(host)?.get(probe)?.result.as_ref()
	}

	/// Latest results for `host`, in probe name order.
	pub fn results(&self, host: &str) -> Vec<&ProbeResult> {
		self.hosts
			.get(host)
			.map(|probes| probes.values().filter_map(|state| state.result.as_ref()).collect())
			.unwrap_or_default()
	}

	/// Forgets in-flight requests, e.g. after the connection dropped.
	pub fn reset_in_flight(&mut self) {
		for state in self.hosts.values_mut().flat_map(BTreeMap::values_mut) {
			state.updating = false;
			if let Some(result) = &mut state.result {
				result.updating = false;
			}
		}
	}
}
