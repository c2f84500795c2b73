//! Result severity classification.
//!
//! Each line (or table cell) is matched against the probe's `critical` and
//! `warning` patterns. One critical match makes the whole result critical;
//! otherwise any warning match makes it a warning.

use regex::Regex;
use tracing::debug;
use wurm_protocol::{RenderHint, Severity};

/// Classifies `stdout` according to the render hint of its probe.
///
/// Results without a hint render as plain lines and are always `ok`. A
/// hint naming an unknown renderer, or carrying a pattern that does not
/// compile, yields `invalid`.
pub fn classify(stdout: &str, render: Option<&RenderHint>) -> Severity {
	let Some(render) = render else {
		return Severity::Ok;
	};

	let splitter = match render.kind.as_deref() {
		Some("lines") => None,
		Some("table") => match Regex::new(render.split.as_deref().unwrap_or(r"\s+")) {
			Ok(re) => Some(re),
			Err(err) => {
				debug!(target = "wurm.client", error = %err, "invalid table split pattern");
				return Severity::Invalid;
			}
		},
		_ => return Severity::Invalid,
	};

	let Some(rules) = &render.severity else {
		return Severity::Ok;
	};
	let (Ok(critical), Ok(warning)) = (compile(rules.critical.as_deref()), compile(rules.warning.as_deref())) else {
		return Severity::Invalid;
	};

	let mut severity = Severity::Ok;
	for line in stdout.lines() {
		let cells: Vec<&str> = match &splitter {
			Some(re) => re.split(line).collect(),
			None => vec![line],
		};
		for cell in cells {
			if critical.as_ref().is_some_and(|re| re.is_match(cell)) {
				return Severity::Critical;
			}
			if warning.as_ref().is_some_and(|re| re.is_match(cell)) {
				severity = Severity::Warning;
			}
		}
	}
	severity
}

fn compile(pattern: Option<&str>) -> Result<Option<Regex>, regex::Error> {
	pattern.map(Regex::new).transpose()
}
