//! Session pool: one exclusive shell per host key.
//!
//! Each key owns a slot guarded by an async mutex. Holding the slot lock is
//! what makes a caller the single user of that host's shell, so commands for
//! one host run strictly one after another while different hosts proceed in
//! parallel. Slots are created under the map lock, which also makes session
//! creation single-flight: whoever holds the slot spawns, everybody queued
//! behind it reuses the result. A slot leaves the map once it has no session
//! and nobody else holds a handle to it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::Mutex as SlotMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::{Session, SessionState, SessionStatus};
use crate::shell::{CommandOutput, FILTER_SESSION_KEY, ShellLauncher};

/// Per-kind session settings.
#[derive(Debug, Clone)]
pub struct SessionProfile {
	/// Sessions unused for this long are torn down by the reaper.
	pub idle_timeout: Duration,
	/// Stderr matching this pattern invalidates the session after the command.
	pub invalidate_on: Option<Regex>,
	/// Commands run once after spawning; their output is discarded.
	pub init_commands: Vec<String>,
}

impl SessionProfile {
	/// Profile for host sessions: 15s idle window, invalidated on stderr `error`.
	pub fn host() -> Self {
		Self {
			idle_timeout: Duration::from_secs(15),
			invalidate_on: Regex::new("(?i)error").ok(),
			init_commands: vec!["LANG=C;echo".to_string()],
		}
	}

	/// Profile for the shared local filter session: 60s idle window, never invalidated.
	pub fn filter() -> Self {
		Self {
			idle_timeout: Duration::from_secs(60),
			invalidate_on: None,
			init_commands: vec!["LANG=C;echo".to_string()],
		}
	}

	fn invalidates(&self, stderr: &str) -> bool {
		self.invalidate_on.as_ref().is_some_and(|re| re.is_match(stderr))
	}
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
	pub host: SessionProfile,
	pub filter: SessionProfile,
	/// Opt-in bound on a single command. `None` lets a hung command block its host.
	pub exec_timeout: Option<Duration>,
	/// How often the reaper looks for idle sessions.
	pub reap_interval: Duration,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			host: SessionProfile::host(),
			filter: SessionProfile::filter(),
			exec_timeout: None,
			reap_interval: Duration::from_secs(1),
		}
	}
}

/// Executes commands against a host key.
///
/// The dispatcher only needs this seam, which lets tests substitute a
/// recording runner for real shells.
#[async_trait]
pub trait CommandRunner: Send + Sync {
	async fn execute(&self, key: &str, command: &str) -> Result<CommandOutput>;
}

struct SessionSlot {
	session: SlotMutex<Option<Session>>,
	/// Last known status, readable while the slot is locked by an execution.
	status: Mutex<Option<SessionStatus>>,
}

impl SessionSlot {
	fn new() -> Self {
		Self {
			session: SlotMutex::new(None),
			status: Mutex::new(None),
		}
	}

	fn record(&self, session: Option<&Session>) {
		*self.status.lock() = session.map(Session::status);
	}
}

pub struct SessionPool {
	config: PoolConfig,
	launcher: ShellLauncher,
	slots: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionPool {
	pub fn new(config: PoolConfig, launcher: ShellLauncher) -> Self {
		Self {
			config,
			launcher,
			slots: Mutex::new(HashMap::new()),
		}
	}

	fn profile(&self, key: &str) -> &SessionProfile {
		if key == FILTER_SESSION_KEY {
			&self.config.filter
		} else {
			&self.config.host
		}
	}

	fn slot(&self, key: &str) -> Arc<SessionSlot> {
		let mut slots = self.slots.lock();
		Arc::clone(slots.entry(key.to_string()).or_insert_with(|| Arc::new(SessionSlot::new())))
	}

	/// Drops the map entry for `key` if `slot` has no session and is unshared.
	///
	/// `slot` is the caller's own handle, so an unshared slot is referenced
	/// exactly twice: by the map and by the caller.
	fn release(&self, key: &str, slot: &Arc<SessionSlot>, current: &Option<Session>) {
		if current.is_some() {
			return;
		}
		let mut slots = self.slots.lock();
		if Arc::strong_count(slot) == 2 && slots.get(key).is_some_and(|held| Arc::ptr_eq(held, slot)) {
			slots.remove(key);
		}
	}

	fn snapshot(&self) -> Vec<(String, Arc<SessionSlot>)> {
		let slots = self.slots.lock();
		let mut entries: Vec<_> = slots.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect();
		entries.sort_by(|a, b| a.0.cmp(&b.0));
		entries
	}

	/// Makes sure `key` has a live session, spawning one if needed.
	pub async fn acquire(&self, key: &str) -> Result<()> {
		self.launcher.command_for(key)?;
		let slot = self.slot(key);
		let mut guard = slot.session.lock().await;
		let started = self.ensure_session(key, &mut guard).await.map(|_| ());
		slot.record(guard.as_ref());
		self.release(key, &slot, &guard);
		started
	}

	async fn ensure_session<'a>(&self, key: &str, current: &'a mut Option<Session>) -> Result<&'a mut Session> {
		let usable = match current.as_mut() {
			Some(session) => session.is_usable(),
			None => false,
		};

		if !usable {
			if let Some(stale) = current.take() {
				debug!(target = "wurm.session", key, state = ?stale.state(), "replacing unusable session");
				stale.close().await;
			}
			let fresh = Session::start(key, &self.launcher, self.profile(key)).await?;
			info!(target = "wurm.session", key, "session started");
			return Ok(current.insert(fresh));
		}

		current
			.as_mut()
			.ok_or_else(|| Error::session_start(key, "session slot emptied unexpectedly"))
	}

	/// Runs `command` on the session for `key`.
	///
	/// Calls for the same key queue behind each other. A failing session is
	/// replaced and the command retried once; a second failure surfaces as
	/// [`Error::Execution`]. Spawn failures surface as [`Error::SessionStart`]
	/// and timeouts as [`Error::Timeout`] without a retry.
	pub async fn execute(&self, key: &str, command: &str) -> Result<CommandOutput> {
		// Keys the launcher refuses never get a slot.
		self.launcher.command_for(key)?;
		let slot = self.slot(key);
		let mut guard = slot.session.lock().await;
		let profile = self.profile(key);
		let mut last_error = None;

		for attempt in 1..=2 {
			let session = match self.ensure_session(key, &mut guard).await {
				Ok(session) => session,
				Err(err) => {
					slot.record(None);
					self.release(key, &slot, &guard);
					return Err(err);
				}
			};

			match session.execute(command, self.config.exec_timeout).await {
				Ok(output) => {
					if profile.invalidates(&output.stderr) {
						warn!(target = "wurm.session", key, "stderr matched invalidation pattern, dropping session");
						session.mark_invalid();
						if let Some(broken) = guard.take() {
							broken.close().await;
						}
					}
					slot.record(guard.as_ref());
					self.release(key, &slot, &guard);
					return Ok(output);
				}
				Err(err) if err.is_timeout() => {
					warn!(target = "wurm.session", key, error = %err, "command timed out, dropping session");
					if let Some(hung) = guard.take() {
						hung.close().await;
					}
					slot.record(None);
					self.release(key, &slot, &guard);
					return Err(err);
				}
				Err(err) => {
					warn!(target = "wurm.session", key, attempt, error = %err, "command failed, dropping session");
					if let Some(broken) = guard.take() {
						broken.close().await;
					}
					last_error = Some(err);
				}
			}
		}

		slot.record(None);
		self.release(key, &slot, &guard);
		Err(Error::Execution {
			key: key.to_string(),
			reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
		})
	}

	/// Tears down the session for `key`; the next call spawns a fresh one.
	pub async fn invalidate(&self, key: &str) -> bool {
		let Some(slot) = self.slots.lock().get(key).cloned() else {
			return false;
		};
		let mut guard = slot.session.lock().await;
		let closed = match guard.take() {
			Some(session) => {
				info!(target = "wurm.session", key, "session invalidated");
				session.close().await;
				true
			}
			None => false,
		};
		slot.record(None);
		self.release(key, &slot, &guard);
		closed
	}

	/// Closes every session idle longer than its profile allows.
	///
	/// Slots with an execution in flight are locked and therefore skipped.
	pub async fn evict_idle(&self) -> usize {
		let mut evicted = 0;
		for (key, slot) in self.snapshot() {
			let Ok(mut guard) = slot.session.try_lock() else {
				continue;
			};
			let idle_timeout = self.profile(&key).idle_timeout;
			let expired = guard.as_ref().is_some_and(|session| session.idle_for() >= idle_timeout);
			let stale = if expired { guard.take() } else { None };
			if let Some(session) = stale {
				debug!(target = "wurm.session", key = %key, "evicting idle session");
				session.close().await;
				evicted += 1;
				slot.record(None);
			}
			self.release(&key, &slot, &guard);
		}
		evicted
	}

	/// Starts the background reaper. It stops once the pool is dropped.
	pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
		let pool: Weak<Self> = Arc::downgrade(self);
		let every = self.config.reap_interval;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(every);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				let Some(pool) = pool.upgrade() else {
					break;
				};
				let evicted = pool.evict_idle().await;
				if evicted > 0 {
					debug!(target = "wurm.session", evicted, "reaped idle sessions");
				}
			}
		})
	}

	/// Live sessions with their health. Slots busy executing report `busy`.
	pub fn status(&self) -> Vec<SessionStatus> {
		self.snapshot()
			.into_iter()
			.filter_map(|(_, slot)| {
				let busy = slot.session.try_lock().is_err();
				let mut status = slot.status.lock().clone()?;
				if busy {
					status.state = SessionState::Busy;
				}
				Some(status)
			})
			.collect()
	}

	/// Closes all sessions, waiting for in-flight commands to finish.
	pub async fn shutdown(&self) {
		for (_, slot) in self.snapshot() {
			let mut guard = slot.session.lock().await;
			if let Some(session) = guard.take() {
				session.close().await;
			}
			slot.record(None);
		}
	}
}

#[async_trait]
impl CommandRunner for SessionPool {
	async fn execute(&self, key: &str, command: &str) -> Result<CommandOutput> {
		SessionPool::execute(self, key, command).await
	}
}
