use std::path::Path;

use colored::Colorize;

use crate::config::{ServerConfig, encode_token};
use crate::error::{Result, WurmError};

pub fn execute(mut config: ServerConfig, path: Option<&Path>, secret: &str, save: bool) -> Result<()> {
	if secret.is_empty() {
		return Err(WurmError::Config("secret must not be empty".into()));
	}

	let encoded = encode_token(secret);
	if !save {
		println!("{encoded}");
		return Ok(());
	}

	let path = path.map(Path::to_path_buf).unwrap_or_else(ServerConfig::default_path);
	config.token = Some(encoded);
	config.save(&path)?;
	eprintln!("{} token written to {}", "saved".green(), path.display());
	Ok(())
}
