//! One client connection: authentication state, command fan-out, and the
//! outbound frame queue.
//!
//! Commands run concurrently, except that `probe` and `run` requests for the
//! same host take turns in the order they arrived on this connection.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use wurm_protocol::{Command, Frame};

use super::GatewayState;

type Outbound = mpsc::UnboundedSender<Message>;

/// Per host, resolves once the last command queued for it has finished.
type Turns = HashMap<String, oneshot::Receiver<()>>;

pub(super) async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
	let (mut ws_tx, mut ws_rx) = socket.split();
	let (tx, rx) = mpsc::unbounded_channel::<Message>();
	let mut rx = UnboundedReceiverStream::new(rx);

	let send_task = tokio::spawn(async move {
		while let Some(msg) = rx.next().await {
			if ws_tx.send(msg).await.is_err() {
				break;
			}
		}
	});

	info!(target = "wurm.gateway", "client connected");
	send_frame(&tx, &Frame::version(env!("CARGO_PKG_VERSION")));

	let mut authenticated = false;
	let mut turns = Turns::new();
	while let Some(msg) = ws_rx.next().await {
		match msg {
			Ok(Message::Text(text)) => handle_line(text.as_str(), &mut authenticated, &mut turns, &state, &tx),
			Ok(Message::Close(_)) => break,
			Ok(_) => {}
			Err(err) => {
				warn!(target = "wurm.gateway", error = %err, "client socket error");
				break;
			}
		}
	}

	info!(target = "wurm.gateway", "client disconnected");
	send_task.abort();
}

fn handle_line(line: &str, authenticated: &mut bool, turns: &mut Turns, state: &Arc<GatewayState>, tx: &Outbound) {
	let line = line.trim_end_matches(['\r', '\n']);
	let name = line.split_once(' ').map_or(line, |(cmd, _)| cmd);

	if !*authenticated && name != "auth" {
		debug!(target = "wurm.gateway", cmd = name, "rejecting command before auth");
		send_frame(tx, &Frame::unsupported(name));
		return;
	}

	let command = match Command::parse(line) {
		Ok(command) => command,
		Err(err) => {
			send_frame(tx, &Frame::error(err.cmd, err.to_string()));
			return;
		}
	};

	if let Command::Auth { token } = &command {
		*authenticated = token_matches(&state.token, token);
		if !*authenticated {
			warn!(target = "wurm.gateway", "authentication failed");
		}
		send_frame(tx, &Frame::auth(*authenticated));
		return;
	}

	// Turns are taken in arrival order, before spawning.
	let turn = command.host().map(|host| take_turn(turns, host));
	let state = state.clone();
	let tx = tx.clone();
	let cmd = command.name().to_string();
	tokio::spawn(async move {
		let _finished = match turn {
			Some((previous, finished)) => {
				if let Some(previous) = previous {
					let _ = previous.await;
				}
				Some(finished)
			}
			None => None,
		};
		match AssertUnwindSafe(handle_command(&state, command)).catch_unwind().await {
			Ok(Some(frame)) => send_frame(&tx, &frame),
			Ok(None) => {}
			Err(_) => {
				error!(target = "wurm.gateway", %cmd, "command handler panicked");
				send_frame(&tx, &Frame::error(cmd, "Internal error"));
			}
		}
	});
}

/// Queues behind the previous command for `host`.
///
/// Returns the receiver to wait on, if any, and the sender to drop once this
/// command is done. Turns whose command already finished are pruned.
fn take_turn(turns: &mut Turns, host: &str) -> (Option<oneshot::Receiver<()>>, oneshot::Sender<()>) {
	turns.retain(|_, last| matches!(last.try_recv(), Err(TryRecvError::Empty)));
	let (finished, done) = oneshot::channel();
	(turns.insert(host.to_string(), done), finished)
}

/// Runs one authenticated command. `None` means the command has no reply.
async fn handle_command(state: &GatewayState, command: Command) -> Option<Frame> {
	let cmd = command.name().to_string();
	debug!(target = "wurm.gateway", command = %command, "handling command");

	let frame = match command {
		Command::Hosts => reply(&cmd, state.discovery.hosts().await),
		Command::History => reply(&cmd, state.discovery.history().await),
		Command::KubeContexts => reply(&cmd, state.discovery.kube_contexts().await),
		Command::LocalNet => reply(&cmd, state.discovery.local_network().await),
		Command::ProbeKubeContext { context, namespace } => {
			reply(&cmd, state.discovery.kube_namespace(&context, &namespace).await)
		}
		Command::Probes => reply(&cmd, Ok(state.dispatcher.registry().metadata())),
		Command::Status => Frame::result(
			cmd,
			json!({
				"version": env!("CARGO_PKG_VERSION"),
				"probes": state.dispatcher.registry().len(),
				"sessions": state.pool.status(),
			}),
		),
		Command::Probe { host, probe } => match state.dispatcher.run(&host, &probe).await {
			Ok(Some(report)) => report.into_frame(),
			Ok(None) => return None,
			Err(err) => {
				warn!(target = "wurm.gateway", %host, %probe, error = %err, "probe failed");
				Frame::probe_error(host, probe, err.to_string())
			}
		},
		Command::Run { host, id, command } => match state.dispatcher.run_command(&host, &id, &command).await {
			Ok(report) => report.into_frame(),
			Err(err) => {
				warn!(target = "wurm.gateway", %host, %id, error = %err, "run failed");
				Frame::run_error(host, id, err.to_string())
			}
		},
		Command::Auth { .. } | Command::Unsupported { .. } => Frame::unsupported(cmd),
	};
	Some(frame)
}

fn reply<T: serde::Serialize>(cmd: &str, result: wurm::Result<T>) -> Frame {
	match result.map(|value| serde_json::to_value(value)) {
		Ok(Ok(value)) => Frame::result(cmd, value),
		Ok(Err(err)) => Frame::error(cmd, err.to_string()),
		Err(err) => {
			warn!(target = "wurm.gateway", cmd, error = %err, "command failed");
			Frame::error(cmd, err.to_string())
		}
	}
}

fn send_frame(tx: &Outbound, frame: &Frame) {
	let _ = tx.send(Message::Text(frame.to_json().into()));
}

/// Compares without short-circuiting on the first differing byte.
fn token_matches(expected: &str, given: &str) -> bool {
	let (expected, given) = (expected.as_bytes(), given.as_bytes());
	!expected.is_empty()
		&& expected.len() == given.len()
		&& expected.iter().zip(given).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn turns_chain_per_host() {
		let mut turns = Turns::new();
		let (none, first) = take_turn(&mut turns, "web1");
		assert!(none.is_none());
		let (after_first, second) = take_turn(&mut turns, "web1");
		let mut after_first = after_first.unwrap();
		let (other, _web2) = take_turn(&mut turns, "web2");
		assert!(other.is_none());

		assert_eq!(after_first.try_recv(), Err(TryRecvError::Empty));
		drop(first);
		assert!(after_first.await.is_err());

		drop(second);
		let (pruned, _third) = take_turn(&mut turns, "web1");
		assert!(pruned.is_none());
		assert_eq!(turns.len(), 2);
	}

	#[test]
	fn token_comparison() {
		assert!(token_matches("s3cret", "s3cret"));
		assert!(!token_matches("s3cret", "s3cre"));
		assert!(!token_matches("s3cret", "S3cret"));
		assert!(!token_matches("", ""));
	}
}
