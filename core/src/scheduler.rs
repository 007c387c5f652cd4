use std::{
	sync::{Arc, Weak},
	time::Duration,
};

use parking_lot::Mutex;
use tokio::{
	spawn,
	task::JoinHandle,
	time::{interval, timeout, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
	commit::CommitReport, config::SchedulerConfig, vault::LocalVault, NetworkReachability,
	RecordId,
};

const ONE_MINUTE: Duration = Duration::from_secs(60);

/// Commits offline changes of a vault on demand and, once enabled, on a timer.
///
/// Disabled unless its config says otherwise: nothing talks to the network behind an
/// application's back.
pub struct CommitScheduler {
	vault: Arc<LocalVault>,
	config: SchedulerConfig,
	reachability: Option<Arc<dyn NetworkReachability>>,
	stop: CancellationToken,
	handle: Mutex<Option<JoinHandle<()>>>,
}

impl CommitScheduler {
	#[must_use]
	pub fn new(vault: Arc<LocalVault>, config: SchedulerConfig) -> Self {
		Self {
			vault,
			config,
			reachability: None,
			stop: CancellationToken::new(),
			handle: Mutex::new(None),
		}
	}

	/// Consulted before every run when `check_network` is set.
	#[must_use]
	pub fn with_reachability(mut self, reachability: Arc<dyn NetworkReachability>) -> Self {
		self.reachability = Some(reachability);
		self
	}

	#[must_use]
	pub const fn is_enabled(&self) -> bool {
		self.config.enabled
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		self.handle
			.lock()
			.as_ref()
			.is_some_and(|handle| !handle.is_finished())
	}

	fn is_network_reachable(&self) -> bool {
		!self.config.check_network
			|| self
				.reachability
				.as_ref()
				.map_or(true, |reachability| reachability.is_reachable())
	}

	/// Starts the commit timer. Returns `false` when disabled, on demand only, or already running.
	pub fn start(self: &Arc<Self>) -> bool {
		if !self.config.enabled {
			debug!("Commit scheduler disabled");
			return false;
		}

		let Some(period) = self.config.commit_frequency() else {
			debug!("Commit scheduler runs on demand only");
			return false;
		};

		let mut handle = self.handle.lock();
		if handle.as_ref().is_some_and(|handle| !handle.is_finished()) {
			warn!("Commit scheduler already running!");
			return false;
		}

		let this = Arc::downgrade(self);
		let stop = self.stop.clone();

		*handle = Some(spawn(run_timer(this, stop, period)));

		info!(?period, "Commit scheduler started");
		true
	}

	/// Commits every record with pending changes.
	///
	/// Returns `None` when disabled, offline, or a commit is already in flight.
	#[instrument(skip(self))]
	pub async fn commit_changes(&self) -> Option<Vec<(RecordId, CommitReport)>> {
		if !self.config.enabled {
			debug!("Commit scheduler disabled, ignoring commit request");
			return None;
		}

		if !self.is_network_reachable() {
			debug!("Network unreachable, skipping commit");
			return None;
		}

		if self.vault.is_committing() {
			debug!("Commit already in progress");
			return None;
		}

		match self.vault.commit_offline_changes().await {
			Ok(reports) => Some(reports),
			Err(e) => {
				error!(?e, "Scheduled commit failed");
				None
			}
		}
	}

	pub fn cancel_active_commits(&self) -> usize {
		self.vault.cancel_active_commits()
	}

	/// Stops the timer and any run in flight, waiting a bounded time before aborting it.
	pub async fn shutdown(&self) {
		self.stop.cancel();
		self.cancel_active_commits();

		let maybe_handle = self.handle.lock().take();
		wait_stop_or_abort(maybe_handle).await;
	}
}

async fn run_timer(scheduler: Weak<CommitScheduler>, stop: CancellationToken, period: Duration) {
	let mut ticker = interval(period);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

	// The first tick completes right away
	ticker.tick().await;

	loop {
		tokio::select! {
			() = stop.cancelled() => break,
			_ = ticker.tick() => {
				let Some(scheduler) = scheduler.upgrade() else {
					break;
				};

				scheduler.commit_changes().await;
			}
		}
	}

	debug!("Commit timer stopped");
}

async fn wait_stop_or_abort(maybe_handle: Option<JoinHandle<()>>) {
	if let Some(handle) = maybe_handle {
		let abort_handle = handle.abort_handle();

		match timeout(ONE_MINUTE, handle).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				if e.is_panic() {
					error!("Commit timer unexpectedly panicked");
				}
			}
			Err(_) => {
				error!("Commit timer failed to gracefully stop in the allotted time, will force abortion");
				abort_handle.abort();
			}
		}
	}
}
