use std::path::PathBuf;

use colored::Colorize;
use wurm::ProbeRegistry;

use crate::config::ServerConfig;
use crate::error::Result;

pub fn execute(config: &ServerConfig, catalog: Option<PathBuf>, json: bool) -> Result<()> {
	let path = catalog.or_else(|| config.catalog.clone());
	let registry = ProbeRegistry::load(path.as_deref())?;

	if json {
		println!("{}", serde_json::to_string_pretty(&registry.metadata())?);
		return Ok(());
	}

	for probe in registry.iter() {
		let mut flags = Vec::new();
		if probe.initial {
			flags.push("initial");
		}
		if probe.local {
			flags.push("local");
		}
		if probe.local_only {
			flags.push("local-only");
		}

		print!("{}", probe.id.bold());
		if let Some(name) = &probe.name {
			print!(" ({name})");
		}
		if !flags.is_empty() {
			print!(" [{}]", flags.join(", ").cyan());
		}
		if probe.refresh > 0 {
			print!(" every {}s", probe.refresh);
		}
		println!();

		if let (Some(trigger), Some(pattern)) = (&probe.depends_on, &probe.match_pattern) {
			println!("  {} {trigger} matches {pattern:?}", "after".dimmed());
		}
		println!("  {}", probe.command.dimmed());
	}
	Ok(())
}
