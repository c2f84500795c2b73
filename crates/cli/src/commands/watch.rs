use colored::{ColoredString, Colorize};
use tracing::debug;
use wurm::protocol::Severity;
use wurm::{ClientConfig, ClientEvent, ProbeClient, ProbeResult};

use crate::config::ServerConfig;
use crate::error::{Result, WurmError};

pub async fn execute(config: &ServerConfig, hosts: Vec<String>, url: Option<String>, token: Option<String>) -> Result<()> {
	let url = url.unwrap_or_else(|| format!("ws://{}:{}/", config.host, config.port));
	let token = match token {
		Some(token) => Some(token),
		None => config.token_secret()?,
	};

	let mut client_config = ClientConfig::new(url);
	client_config.token = token;
	client_config.scheduler = config.scheduler_config();

	let (client, mut events) = ProbeClient::new(client_config);
	client.connect();
	for host in &hosts {
		client.start(host);
	}

	let outcome = loop {
		tokio::select! {
			event = events.recv() => match event {
				Some(ClientEvent::AuthRejected) => break Err(WurmError::Config("gateway rejected the token".into())),
				Some(event) => print_event(event),
				None => break Ok(()),
			},
			_ = tokio::signal::ctrl_c() => break Ok(()),
		}
	};

	client.disconnect();
	outcome
}

fn print_event(event: ClientEvent) {
	match event {
		ClientEvent::Connected => eprintln!("{}", "connected".dimmed()),
		ClientEvent::Disconnected => eprintln!("{}", "disconnected, reconnecting".dimmed()),
		ClientEvent::Result(result) => print_result(&result),
		ClientEvent::ProbeFailed { host, probe, error } => {
			println!("{} {} {}", host.bold(), probe, error.red());
		}
		ClientEvent::Error { cmd, error } => eprintln!("{} {cmd}: {error}", "error".red()),
		other => debug!(target = "wurm.client", event = ?other, "ignored event"),
	}
}

fn print_result(result: &ProbeResult) {
	println!("{} {} {}", result.host.bold(), result.probe.cyan(), severity_label(result.severity));
	for line in result.stdout.lines() {
		println!("  {line}");
	}
	for line in result.stderr.lines() {
		println!("  {}", line.yellow());
	}
}

fn severity_label(severity: Severity) -> ColoredString {
	match severity {
		Severity::Ok => severity.as_str().green(),
		Severity::Warning => severity.as_str().yellow(),
		Severity::Critical => severity.as_str().red().bold(),
		Severity::Invalid => severity.as_str().magenta(),
	}
}
