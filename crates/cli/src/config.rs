//! Gateway and watcher configuration.
//!
//! Read from `$XDG_CONFIG_HOME/wurm/config.json` (falling back to
//! `~/.config`). Every field is optional in the file; missing fields take the
//! defaults below and a missing file is the same as an empty one.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use wurm::runtime::{PoolConfig, ShellLauncher};
use wurm::{DEFAULT_SCRATCH_PATH, DiscoveryConfig, SchedulerConfig};
use wurm_protocol::{DEFAULT_HOST, DEFAULT_PORT};

use crate::error::{Result, WurmError};

/// Environment variable holding the base64 token; wins over the config file.
pub const TOKEN_ENV: &str = "WURM_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
	pub host: String,
	pub port: u16,
	/// Shared client credential, base64 encoded.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
	/// Probe catalog; the built-in catalog is used when unset.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub catalog: Option<PathBuf>,
	pub host_idle_secs: u64,
	pub filter_idle_secs: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub exec_timeout_secs: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub shell: Option<PathBuf>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ssh: Option<PathBuf>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ssh_options: Option<Vec<String>>,
	pub scratch_path: PathBuf,
	pub discovery: DiscoveryConfig,
	pub refresh_interval_secs: u64,
	pub probe_blacklist: BTreeSet<String>,
	pub max_chain_depth: u32,
}

impl Default for ServerConfig {
	fn default() -> Self {
		let scheduler = SchedulerConfig::default();
		Self {
			host: DEFAULT_HOST.to_string(),
			port: DEFAULT_PORT,
			token: None,
			catalog: None,
			host_idle_secs: 15,
			filter_idle_secs: 60,
			exec_timeout_secs: None,
			shell: None,
			ssh: None,
			ssh_options: None,
			scratch_path: PathBuf::from(DEFAULT_SCRATCH_PATH),
			discovery: DiscoveryConfig::default(),
			refresh_interval_secs: scheduler.refresh_interval.as_secs(),
			probe_blacklist: scheduler.blacklist,
			max_chain_depth: scheduler.max_chain_depth,
		}
	}
}

impl ServerConfig {
	/// `$XDG_CONFIG_HOME/wurm/config.json`.
	pub fn default_path() -> PathBuf {
		let config_home = std::env::var_os("XDG_CONFIG_HOME")
			.map(PathBuf::from)
			.or_else(|| dirs::home_dir().map(|h| h.join(".config")))
			.unwrap_or_else(|| PathBuf::from("."));
		config_home.join("wurm").join("config.json")
	}

	/// Loads `path`, or the default location when `None`.
	///
	/// A missing file yields the defaults; an unreadable or malformed one is an error.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
		match fs::read_to_string(&path) {
			Ok(content) => Ok(serde_json::from_str(&content)?),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
			Err(source) => Err(WurmError::ConfigRead { path, source }),
		}
	}

	/// Writes the config with owner-only permissions, since it holds the token.
	pub fn save(&self, path: &Path) -> Result<()> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		fs::write(path, serde_json::to_string_pretty(self)?)?;
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
		}
		Ok(())
	}

	/// The decoded shared secret, from `WURM_TOKEN` or the config file.
	pub fn token_secret(&self) -> Result<Option<String>> {
		let encoded = std::env::var(TOKEN_ENV).ok().or_else(|| self.token.clone());
		encoded.filter(|t| !t.trim().is_empty()).map(|t| decode_token(&t)).transpose()
	}

	pub fn pool_config(&self) -> PoolConfig {
		let mut pool = PoolConfig::default();
		pool.host.idle_timeout = Duration::from_secs(self.host_idle_secs);
		pool.filter.idle_timeout = Duration::from_secs(self.filter_idle_secs);
		pool.exec_timeout = self.exec_timeout_secs.map(Duration::from_secs);
		pool
	}

	pub fn launcher(&self) -> ShellLauncher {
		let mut launcher = ShellLauncher::default();
		if let Some(shell) = &self.shell {
			launcher.shell = shell.clone();
		}
		if let Some(ssh) = &self.ssh {
			launcher.ssh = ssh.clone();
		}
		if let Some(options) = &self.ssh_options {
			launcher.ssh_options = options.clone();
		}
		launcher
	}

	pub fn scheduler_config(&self) -> SchedulerConfig {
		SchedulerConfig {
			refresh_interval: Duration::from_secs(self.refresh_interval_secs.max(1)),
			blacklist: self.probe_blacklist.clone(),
			max_chain_depth: self.max_chain_depth,
		}
	}
}

pub fn encode_token(secret: &str) -> String {
	STANDARD.encode(secret.as_bytes())
}

pub fn decode_token(encoded: &str) -> Result<String> {
	let bytes = STANDARD
		.decode(encoded.trim())
		.map_err(|e| WurmError::Config(format!("token is not valid base64: {e}")))?;
	String::from_utf8(bytes).map_err(|_| WurmError::Config("token is not valid UTF-8".into()))
}
