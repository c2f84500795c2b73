use serde::{Deserialize, Deserializer, Serialize};

/// One entry of the probe catalog.
///
/// The catalog is a JSON object keyed by probe name. Field names follow the
/// catalog format: the dependency predicate lives in `if` (the probe this one
/// follows) and `matches` (substring the trigger's output must contain).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeDefinition {
	/// Catalog key, filled in by the registry when loading.
	#[serde(default, skip_serializing)]
	pub id: String,
	/// Human-readable title.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	/// Shell command executed on the host session.
	pub command: String,
	/// Issued when a client starts watching a host.
	#[serde(default, deserialize_with = "flag")]
	pub initial: bool,
	/// Seconds after which a result is stale.
	#[serde(default)]
	pub refresh: u64,
	/// Refreshed by the local host's own loop.
	#[serde(default, deserialize_with = "flag")]
	pub local: bool,
	/// Must never run against anything but the local host.
	#[serde(default, deserialize_with = "flag")]
	pub local_only: bool,
	/// Shell pipeline applied to stdout on the local filter session.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub local_filter: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub render: Option<RenderHint>,
	/// Free-form result type hint forwarded to clients.
	#[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
	/// Probe whose output may trigger this one.
	#[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
	pub depends_on: Option<String>,
	/// Substring of the trigger's stdout that enqueues this probe.
	#[serde(default, rename = "matches", skip_serializing_if = "Option::is_none")]
	pub match_pattern: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub runbook: Option<String>,
}

impl ProbeDefinition {
	/// Minimal definition, mostly useful for building catalogs in code.
	pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			name: None,
			command: command.into(),
			initial: false,
			refresh: 0,
			local: false,
			local_only: false,
			local_filter: None,
			render: None,
			kind: None,
			depends_on: None,
			match_pattern: None,
			runbook: None,
		}
	}

	/// True if `stdout` of `trigger` should enqueue this probe.
	///
	/// An empty or missing pattern never matches.
	pub fn follows(&self, trigger: &str, stdout: &str) -> bool {
		self.depends_on.as_deref() == Some(trigger)
			&& self
				.match_pattern
				.as_deref()
				.is_some_and(|pattern| !pattern.is_empty() && stdout.contains(pattern))
	}

	/// Metadata exposed through the `probes` command.
	pub fn meta(&self) -> ProbeMeta {
		ProbeMeta {
			name: self.name.clone(),
			command: self.command.clone(),
			initial: self.initial,
			refresh: self.refresh,
			local: self.local,
			local_only: self.local_only,
			local_filter: self.local_filter.clone(),
			runbook: self.runbook.clone(),
		}
	}
}

/// Registry entry as published to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeMeta {
	#[serde(default)]
	pub name: Option<String>,
	pub command: String,
	#[serde(default)]
	pub initial: bool,
	#[serde(default)]
	pub refresh: u64,
	#[serde(default)]
	pub local: bool,
	#[serde(default)]
	pub local_only: bool,
	#[serde(default)]
	pub local_filter: Option<String>,
	#[serde(default)]
	pub runbook: Option<String>,
}

/// Rendering hint attached to a probe, forwarded verbatim in `probe` frames.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RenderHint {
	/// `"lines"` or `"table"`.
	#[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
	/// Column separator regex for tables.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub split: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub severity: Option<SeverityRules>,
}

/// Regexes matched against result lines to flag a probe.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SeverityRules {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub critical: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub warning: Option<String>,
}

/// Classification of one probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
	#[default]
	Ok,
	Warning,
	Critical,
	Invalid,
}

impl Severity {
	pub fn as_str(self) -> &'static str {
		match self {
			Severity::Ok => "ok",
			Severity::Warning => "warning",
			Severity::Critical => "critical",
			Severity::Invalid => "invalid",
		}
	}
}

/// Accepts JSON booleans as well as the `"True"`/`"False"` strings older catalogs use.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Flag {
		Bool(bool),
		Text(String),
	}

	Ok(match Flag::deserialize(deserializer)? {
		Flag::Bool(value) => value,
		Flag::Text(text) => text.eq_ignore_ascii_case("true"),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn catalog_entry_reads_legacy_field_names() {
		let json = r#"{
			"name": "Docker containers",
			"command": "docker ps",
			"initial": "True",
			"refresh": 30,
			"localOnly": "False",
			"if": "processes",
			"matches": "dockerd",
			"render": {"type": "table", "split": "\\s+", "severity": {"critical": "Exited"}}
		}"#;
		let probe: ProbeDefinition = serde_json::from_str(json).unwrap();
		assert!(probe.initial);
		assert!(!probe.local_only);
		assert_eq!(probe.depends_on.as_deref(), Some("processes"));
		assert_eq!(probe.match_pattern.as_deref(), Some("dockerd"));
		let render = probe.render.unwrap();
		assert_eq!(render.kind.as_deref(), Some("table"));
		assert_eq!(render.severity.unwrap().critical.as_deref(), Some("Exited"));
	}

	#[test]
	fn empty_pattern_never_follows() {
		let mut probe = ProbeDefinition::new("b", "true");
		probe.depends_on = Some("a".into());
		probe.match_pattern = Some(String::new());
		assert!(!probe.follows("a", "anything"));

		probe.match_pattern = Some("OK".into());
		assert!(probe.follows("a", "status OK"));
		assert!(!probe.follows("c", "status OK"));
	}

	#[test]
	fn meta_uses_catalog_field_names() {
		let mut probe = ProbeDefinition::new("df", "df -h");
		probe.local_only = true;
		probe.local_filter = Some("sort".into());
		let json = serde_json::to_value(probe.meta()).unwrap();
		assert_eq!(json["localOnly"], true);
		assert_eq!(json["localFilter"], "sort");
		assert_eq!(json["command"], "df -h");
	}
}
