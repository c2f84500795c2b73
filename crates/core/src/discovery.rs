//! Host and environment discovery
//!
//! Backs the `hosts`, `history`, `kubectxt`, `localnet` and `probe_kubectxt`
//! commands. Everything here runs on the gateway machine through one-shot
//! processes, never through the per-host sessions. Collaborator scripts are
//! opaque: they must print a single JSON document on stdout.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;
use wurm_protocol::LOCAL_HOST;

use crate::error::{Error, Result};

static VALID_IP: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^([a-zA-Z0-9]+@)?(([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])$").unwrap()
});

static VALID_HOSTNAME: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^([a-zA-Z0-9]+@)?(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$").unwrap()
});

static SSH_PROCESS_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]+ +ssh +").unwrap());

/// Returns true for `[user@]hostname` or `[user@]ipv4` targets.
pub fn is_valid_target(target: &str) -> bool {
	target.len() > 1 && (VALID_HOSTNAME.is_match(target) || VALID_IP.is_match(target))
}

/// External commands used for discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
	/// Shell history scanned for ssh targets. Defaults to `~/.bash_history`.
	pub history_file: Option<PathBuf>,
	/// Number of trailing ssh history entries considered.
	pub history_limit: usize,
	/// kubectl binary.
	pub kubectl: String,
	/// Local network discovery script (program and arguments).
	pub localnet_command: Vec<String>,
	/// Namespace discovery script; `<context>/<namespace>` is appended.
	pub namespace_command: Vec<String>,
}

impl Default for DiscoveryConfig {
	fn default() -> Self {
		Self {
			history_file: None,
			history_limit: 50,
			kubectl: "kubectl".into(),
			localnet_command: vec!["node".into(), "scripts/local-network-discover.mjs".into()],
			namespace_command: vec!["node".into(), "scripts/kubernetes.mjs".into()],
		}
	}
}

/// Kubernetes contexts known to kubectl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeContexts {
	pub contexts: Vec<String>,
	pub current: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
	config: DiscoveryConfig,
}

impl Discovery {
	pub fn new(config: DiscoveryConfig) -> Self {
		Self { config }
	}

	/// Hosts with a running interactive ssh client, plus the local host.
	pub async fn hosts(&self) -> Result<Vec<String>> {
		let output = Command::new("pgrep")
			.args(["-fla", "^ssh "])
			.stdin(Stdio::null())
			.output()
			.await
			.map_err(|e| Error::discovery("pgrep", e))?;

		// pgrep exits 1 when nothing matched.
		if !output.status.success() && output.status.code() != Some(1) {
			return Err(Error::discovery("pgrep", String::from_utf8_lossy(&output.stderr).trim()));
		}

		Ok(parse_ssh_processes(&String::from_utf8_lossy(&output.stdout)))
	}

	/// Recent ssh targets from the shell history, sorted and deduplicated.
	pub async fn history(&self) -> Result<Vec<String>> {
		let Some(path) = self.config.history_file.clone().or_else(|| dirs::home_dir().map(|home| home.join(".bash_history"))) else {
			return Ok(Vec::new());
		};
		let content = match tokio::fs::read(&path).await {
			Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
				debug!(target = "wurm.gateway", path = %path.display(), "no shell history");
				return Ok(Vec::new());
			}
			Err(err) => return Err(err.into()),
		};
		Ok(parse_history(&content, self.config.history_limit))
	}

	/// Contexts from the local kubeconfig and the current one.
	pub async fn kube_contexts(&self) -> Result<KubeContexts> {
		let kubectl = &self.config.kubectl;
		let names = run_collaborator(kubectl, ["config", "get-contexts", "-o", "name"]).await?;
		let contexts = names.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect();
		// Having no current context is not an error.
		let current = run_collaborator(kubectl, ["config", "current-context"])
			.await
			.ok()
			.map(|c| c.trim().to_string())
			.filter(|c| !c.is_empty());
		Ok(KubeContexts { contexts, current })
	}

	/// Output of the local network discovery script.
	pub async fn local_network(&self) -> Result<Value> {
		run_json_script(&self.config.localnet_command, None).await
	}

	/// Workloads of one namespace, from the namespace discovery script.
	pub async fn kube_namespace(&self, context: &str, namespace: &str) -> Result<Value> {
		run_json_script(&self.config.namespace_command, Some(format!("{context}/{namespace}"))).await
	}
}

/// Extracts ssh targets from `pgrep -fla` output and appends the local host.
pub fn parse_ssh_processes(stdout: &str) -> Vec<String> {
	let mut hosts: Vec<String> = Vec::new();
	for line in stdout.lines() {
		let target = SSH_PROCESS_PREFIX.replace(line.trim(), "");
		if is_valid_target(&target) && !hosts.iter().any(|h| *h == target) {
			hosts.push(target.into_owned());
		}
	}
	if !hosts.iter().any(|h| h == LOCAL_HOST) {
		hosts.push(LOCAL_HOST.to_string());
	}
	hosts
}

/// Picks `ssh <target>` lines, keeps the last `limit`, sorts, dedups, validates.
pub fn parse_history(content: &str, limit: usize) -> Vec<String> {
	let targets: Vec<&str> = content
		.lines()
		.filter_map(|line| {
			let mut words = line.split_whitespace();
			match (words.next(), words.next()) {
				(Some("ssh"), Some(target)) if target.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit()) => {
					Some(target)
				}
				_ => None,
			}
		})
		.collect();

	let mut recent: Vec<String> = targets[targets.len().saturating_sub(limit)..]
		.iter()
		.filter(|target| is_valid_target(target))
		.map(|target| target.to_string())
		.collect();
	recent.sort();
	recent.dedup();
	recent
}

async fn run_collaborator<I, S>(program: &str, args: I) -> Result<String>
where
	I: IntoIterator<Item = S>,
	S: AsRef<std::ffi::OsStr>,
{
	let output = Command::new(program)
		.args(args)
		.stdin(Stdio::null())
		.output()
		.await
		.map_err(|e| Error::discovery(program, e))?;

	if !output.status.success() {
		let stderr = String::from_utf8_lossy(&output.stderr);
		return Err(Error::discovery(program, format!("{}: {}", output.status, stderr.trim())));
	}
	Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn run_json_script(command: &[String], extra: Option<String>) -> Result<Value> {
	let Some((program, args)) = command.split_first() else {
		return Err(Error::discovery("", "no discovery command configured"));
	};
	let stdout = run_collaborator(program, args.iter().cloned().chain(extra)).await?;
	serde_json::from_str(&stdout).map_err(|e| Error::parse(program.clone(), e))
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use tempfile::NamedTempFile;

	use super::*;

	#[test]
	fn target_validation() {
		assert!(is_valid_target("web1"));
		assert!(is_valid_target("admin@db-2.example.org"));
		assert!(is_valid_target("10.0.0.254"));
		assert!(!is_valid_target("-oProxyCommand=x"));
		assert!(!is_valid_target("web1 -p 22"));
		assert!(!is_valid_target("x"));
	}

	#[test]
	fn ssh_processes_become_hosts() {
		let stdout = "1201 ssh web1\n1202 ssh admin@10.0.0.7\n1203 ssh -L 8080:localhost:80 web2\n1204 ssh web1\n";
		assert_eq!(parse_ssh_processes(stdout), vec!["web1", "admin@10.0.0.7", "localhost"]);
		assert_eq!(parse_ssh_processes(""), vec!["localhost"]);
	}

	#[test]
	fn history_keeps_recent_sorted_unique_targets() {
		let mut content = String::from("ls -la\nssh -A bastion\nssh Upper\n");
		for i in 0..60 {
			content.push_str(&format!("ssh host{i}\n"));
		}
		content.push_str("ssh web1\nssh web1\n");

		let hosts = parse_history(&content, 50);
		assert!(hosts.windows(2).all(|w| w[0] < w[1]));
		assert!(hosts.contains(&"web1".to_string()));
		assert!(!hosts.contains(&"host0".to_string()));
		assert!(!hosts.iter().any(|h| h.starts_with('-') || h == "Upper"));
		assert!(hosts.len() <= 50);
	}

	#[tokio::test]
	async fn history_reads_configured_file() {
		let mut file = NamedTempFile::new().unwrap();
		writeln!(file, "ssh db1\nssh web1\nssh db1").unwrap();
		let discovery = Discovery::new(DiscoveryConfig {
			history_file: Some(file.path().to_path_buf()),
			..DiscoveryConfig::default()
		});
		assert_eq!(discovery.history().await.unwrap(), vec!["db1", "web1"]);
	}

	#[tokio::test]
	async fn missing_history_is_empty() {
		let discovery = Discovery::new(DiscoveryConfig {
			history_file: Some("/nonexistent/.bash_history".into()),
			..DiscoveryConfig::default()
		});
		assert!(discovery.history().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn script_output_must_be_json() {
		let discovery = Discovery::new(DiscoveryConfig {
			localnet_command: vec!["echo".into(), "not json".into()],
			namespace_command: vec!["echo".into()],
			..DiscoveryConfig::default()
		});
		assert!(matches!(discovery.local_network().await, Err(Error::Parse { .. })));

		let discovery = Discovery::new(DiscoveryConfig {
			namespace_command: vec!["printf".into(), r#"{"id":"%s"}"#.into()],
			..DiscoveryConfig::default()
		});
		let value = discovery.kube_namespace("prod", "web").await.unwrap();
		assert_eq!(value["id"], "prod/web");
	}

	#[tokio::test]
	async fn failing_collaborator_is_a_discovery_error() {
		let discovery = Discovery::new(DiscoveryConfig {
			localnet_command: vec!["false".into()],
			kubectl: "/nonexistent/kubectl".into(),
			..DiscoveryConfig::default()
		});
		assert!(matches!(discovery.local_network().await, Err(Error::Discovery { .. })));
		assert!(matches!(discovery.kube_contexts().await, Err(Error::Discovery { .. })));
	}
}
