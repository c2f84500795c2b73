//! Probe catalog
//!
//! The registry is loaded once at startup and never changes afterwards. It
//! also keeps a reverse-dependency index (trigger probe to dependents) so
//! computing follow-ups after a result only looks at candidate probes.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use tracing::debug;
use wurm_protocol::{ProbeDefinition, ProbeMeta};

use crate::error::{Error, Result};

/// Catalog shipped with the binary, used when no catalog path is configured.
pub const DEFAULT_CATALOG: &str = include_str!("../probes/default.json");

#[derive(Debug, Clone, Default)]
pub struct ProbeRegistry {
	probes: BTreeMap<String, ProbeDefinition>,
	dependents: HashMap<String, Vec<String>>,
}

impl ProbeRegistry {
	/// Builds a registry from definitions, keyed by their `id`.
	pub fn from_definitions(definitions: impl IntoIterator<Item = ProbeDefinition>) -> Self {
		let probes: BTreeMap<String, ProbeDefinition> = definitions.into_iter().map(|probe| (probe.id.clone(), probe)).collect();

		// Iterating the BTreeMap keeps each dependents list in name order.
		let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
		for (id, probe) in &probes {
			if let Some(trigger) = &probe.depends_on {
				dependents.entry(trigger.clone()).or_default().push(id.clone());
			}
		}

		Self { probes, dependents }
	}

	/// Parses a catalog: a JSON object mapping probe names to definitions.
	pub fn from_json(json: &str) -> Result<Self> {
		let raw: BTreeMap<String, ProbeDefinition> = serde_json::from_str(json).map_err(|e| Error::Catalog(e.to_string()))?;
		let registry = Self::from_definitions(raw.into_iter().map(|(id, mut probe)| {
			probe.id = id;
			probe
		}));
		debug!(target = "wurm.dispatch", probes = registry.len(), "loaded probe catalog");
		Ok(registry)
	}

	pub fn from_path(path: &Path) -> Result<Self> {
		let json = std::fs::read_to_string(path).map_err(|e| Error::Catalog(format!("{}: {e}", path.display())))?;
		Self::from_json(&json)
	}

	/// The catalog compiled into the binary.
	pub fn builtin() -> Result<Self> {
		Self::from_json(DEFAULT_CATALOG)
	}

	/// Loads `path` if given, the built-in catalog otherwise.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		match path {
			Some(path) => Self::from_path(path),
			None => Self::builtin(),
		}
	}

	pub fn get(&self, probe: &str) -> Option<&ProbeDefinition> {
		self.probes.get(probe)
	}

	/// Like [`get`](Self::get), failing with [`Error::UnknownProbe`].
	pub fn require(&self, probe: &str) -> Result<&ProbeDefinition> {
		self.get(probe).ok_or_else(|| Error::UnknownProbe { probe: probe.to_string() })
	}

	pub fn len(&self) -> usize {
		self.probes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.probes.is_empty()
	}

	/// Definitions in name order.
	pub fn iter(&self) -> impl Iterator<Item = &ProbeDefinition> {
		self.probes.values()
	}

	/// Probes a client issues when it starts watching a host.
	pub fn initial_probes(&self) -> impl Iterator<Item = &ProbeDefinition> {
		self.iter().filter(|probe| probe.initial)
	}

	/// Names of probes enqueued by `probe` producing `stdout`, in name order.
	///
	/// Depends only on its arguments and the catalog, never on prior results.
	pub fn follow_ups(&self, probe: &str, stdout: &str) -> Vec<String> {
		let Some(candidates) = self.dependents.get(probe) else {
			return Vec::new();
		};
		candidates
			.iter()
			.filter(|name| self.probes.get(name.as_str()).is_some_and(|p| p.follows(probe, stdout)))
			.cloned()
			.collect()
	}

	/// Catalog metadata as published by the `probes` command.
	pub fn metadata(&self) -> BTreeMap<String, ProbeMeta> {
		self.probes.iter().map(|(id, probe)| (id.clone(), probe.meta())).collect()
	}
}
