//! Bounded pool of worker processes, one per session.
//!
//! # Slots
//!
//! A session owns at most one slot, either `Starting` (a spawn is in flight)
//! or `Live`. Slots are what `max_processes` bounds, so a reservation counts
//! against capacity before the process exists and two concurrent acquires for
//! one session never spawn twice.
//!
//! A worker evicted from its slot keeps holding capacity as `stopping` until
//! its process has exited. Only then can the slot go to someone else.
//!
//! # Admission
//!
//! At capacity, an acquire queues a [`WaitTicket`] and gives up with
//! [`BrokerError::PoolExhausted`] after `admission_timeout`. Before queueing
//! it stops the worker that has been idle longest (no leases, idle for at
//! least `reclaim_after`) unless enough workers are already stopping to
//! serve every queued session. Tickets are promoted in FIFO order whenever a
//! slot frees up: on release, sweep, crash, termination or a failed spawn.
//!
//! # Locking
//!
//! All slot and queue mutations happen under one `parking_lot::Mutex`. The
//! lock is never held across an `.await`, and values whose `Drop` takes the
//! lock ([`Reservation`]) are never dropped while it is held.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wharf_rpc::CallError;

use crate::config::PoolConfig;
use crate::error::{BrokerError, Result};
use crate::launcher::WorkerLauncher;
use crate::worker::{SessionKey, WorkerHandle, WorkerId};

/// Why a worker process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
	/// The broker asked it to stop.
	Requested,
	/// It exited on its own.
	Unexpected {
		/// Exit code, when the OS reported one.
		code: Option<i32>,
	},
}

/// Lets a launcher's exit monitor report back to the pool.
#[derive(Debug, Clone)]
pub struct ExitReporter {
	pool: Weak<PoolShared>,
}

impl ExitReporter {
	fn new(pool: &Arc<PoolShared>) -> Self {
		Self {
			pool: Arc::downgrade(pool),
		}
	}

	/// A reporter not connected to any pool.
	pub fn detached() -> Self {
		Self { pool: Weak::new() }
	}

	/// Tell the pool that `id` exited.
	pub fn report(&self, id: WorkerId, kind: ExitKind) {
		if let Some(pool) = self.pool.upgrade() {
			pool.handle_exit(id, kind);
		}
	}
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
	/// Running workers.
	pub live: usize,
	/// Slots reserved for spawns in flight.
	pub starting: usize,
	/// Evicted workers whose process has not exited yet.
	pub stopping: usize,
	/// Running workers with at least one lease.
	pub busy: usize,
	/// Queued acquires.
	pub queued: usize,
	/// Configured capacity.
	pub max_processes: usize,
}

struct LiveWorker {
	handle: WorkerHandle,
	leases: usize,
	last_used: Instant,
}

enum Slot {
	Starting {
		generation: u64,
		/// Closes when the spawn finishes either way.
		started: watch::Receiver<()>,
	},
	Live(LiveWorker),
}

/// A queued acquire.
struct WaitTicket {
	id: u64,
	session: SessionKey,
	enqueued_at: Instant,
	grant: oneshot::Sender<Grant>,
}

/// What a promoted ticket receives.
enum Grant {
	/// A slot was reserved for the waiter; it must spawn into it.
	Reserved(Reservation),
	/// The waiter's session already has a slot; retry the fast path.
	Existing,
}

#[derive(Default)]
struct PoolState {
	slots: HashMap<SessionKey, Slot>,
	queue: VecDeque<WaitTicket>,
	/// Workers out of `slots` that still hold capacity.
	stopping: usize,
	next_ticket: u64,
	closed: bool,
}

impl PoolState {
	/// Capacity in use, counting workers still shutting down.
	fn occupied(&self) -> usize {
		self.slots.len() + self.stopping
	}

	/// Queued tickets whose session has no slot yet.
	fn slotless_waiters(&self) -> usize {
		self.queue.iter().filter(|t| !self.slots.contains_key(&t.session)).count()
	}

	/// Take a live worker out of the table. It counts as stopping until
	/// [`PoolShared::stop`] finishes with it.
	fn evict(&mut self, session: SessionKey) -> Option<WorkerHandle> {
		match self.slots.remove(&session)? {
			Slot::Live(worker) => {
				self.stopping += 1;
				Some(worker.handle)
			}
			Slot::Starting { .. } => None,
		}
	}
}

struct PoolShared {
	config: PoolConfig,
	launcher: Arc<dyn WorkerLauncher>,
	state: Mutex<PoolState>,
	next_generation: AtomicU64,
	shutdown: CancellationToken,
}

/// A `Starting` slot owned by one spawner.
///
/// Dropping it without [`Self::install`] rolls the slot back and promotes the
/// queue, so a failed or cancelled spawn never leaks capacity.
struct Reservation {
	shared: Arc<PoolShared>,
	session: SessionKey,
	generation: u64,
	_started: watch::Sender<()>,
	armed: bool,
}

impl Reservation {
	fn id(&self) -> WorkerId {
		WorkerId {
			session: self.session,
			generation: self.generation,
		}
	}

	/// Turn the reserved slot into a live one holding one lease.
	///
	/// Hands the worker back if the slot was torn down while spawning.
	fn install(mut self, handle: WorkerHandle) -> std::result::Result<(), WorkerHandle> {
		self.armed = false;
		let mut state = self.shared.state.lock();
		let ours = !state.closed
			&& matches!(
				state.slots.get(&self.session),
				Some(Slot::Starting { generation, .. }) if *generation == self.generation
			);
		if !ours {
			return Err(handle);
		}
		state.slots.insert(
			self.session,
			Slot::Live(LiveWorker {
				handle,
				leases: 1,
				last_used: Instant::now(),
			}),
		);
		Ok(())
	}

	/// Remove the slot without promoting. For use inside promotion itself.
	fn discard(mut self) {
		self.armed = false;
		self.shared.remove_starting(self.session, self.generation);
	}
}

impl Drop for Reservation {
	fn drop(&mut self) {
		if self.armed {
			self.shared.remove_starting(self.session, self.generation);
			self.shared.promote();
		}
	}
}

/// A queued acquire, cancelled on drop.
struct QueuedAcquire {
	shared: Arc<PoolShared>,
	ticket: u64,
	rx: Option<oneshot::Receiver<Grant>>,
}

impl QueuedAcquire {
	async fn wait(mut self, timeout: Duration) -> Result<Grant> {
		let outcome = match self.rx.as_mut() {
			Some(rx) => tokio::time::timeout(timeout, rx).await,
			None => return Err(BrokerError::PoolExhausted),
		};
		match outcome {
			Ok(Ok(grant)) => {
				self.rx = None;
				Ok(grant)
			}
			Ok(Err(_)) => {
				// The ticket was dropped by session teardown or shutdown.
				self.rx = None;
				Err(if self.shared.state.lock().closed {
					BrokerError::Shutdown
				} else {
					BrokerError::SessionClosed
				})
			}
			Err(_) => {
				if self.shared.cancel_ticket(self.ticket) {
					self.rx = None;
					return Err(BrokerError::PoolExhausted);
				}
				// Promoted right at the deadline; take the grant.
				let grant = self.rx.take().and_then(|mut rx| rx.try_recv().ok());
				grant.ok_or(BrokerError::PoolExhausted)
			}
		}
	}
}

impl Drop for QueuedAcquire {
	fn drop(&mut self) {
		let Some(mut rx) = self.rx.take() else {
			return;
		};
		if !self.shared.cancel_ticket(self.ticket) {
			// Already promoted. Dropping the grant here rolls its slot back.
			drop(rx.try_recv());
		}
	}
}

enum Plan {
	Ready(WorkerHandle),
	AwaitStart(watch::Receiver<()>),
	Spawn(Reservation),
	Queue(QueuedAcquire),
}

impl PoolShared {
	fn plan(self: &Arc<Self>, session: SessionKey) -> Result<Plan> {
		let mut guard = self.state.lock();
		let state = &mut *guard;
		if state.closed {
			return Err(BrokerError::Shutdown);
		}
		let now = Instant::now();

		let stale = match state.slots.get_mut(&session) {
			Some(Slot::Live(worker)) if worker.handle.is_alive() => {
				worker.leases += 1;
				worker.last_used = now;
				return Ok(Plan::Ready(worker.handle.clone()));
			}
			Some(Slot::Live(_)) => true,
			Some(Slot::Starting { started, .. }) => return Ok(Plan::AwaitStart(started.clone())),
			None => false,
		};
		if stale && let Some(handle) = state.evict(session) {
			// The channel died before the exit report arrived.
			warn!(worker = %handle.id(), "Evicting dead worker");
			self.stop(handle, true);
		}

		if state.occupied() < self.config.max_processes {
			return Ok(Plan::Spawn(self.reserve(state, session)));
		}

		// The slot freed by the victim goes to the queue once its process is
		// gone; this acquire waits for it like everyone else.
		if state.slotless_waiters() + 1 > state.stopping
			&& let Some(victim) = self.take_reclaimable(state, now)
		{
			info!(worker = %victim.id(), %session, "Reclaiming idle worker");
			self.stop(victim, false);
		}

		let ticket = state.next_ticket;
		state.next_ticket += 1;
		let (grant, rx) = oneshot::channel();
		state.queue.push_back(WaitTicket {
			id: ticket,
			session,
			enqueued_at: now,
			grant,
		});
		debug!(%session, ticket, queued = state.queue.len(), "pool.queue");
		Ok(Plan::Queue(QueuedAcquire {
			shared: self.clone(),
			ticket,
			rx: Some(rx),
		}))
	}

	fn reserve(self: &Arc<Self>, state: &mut PoolState, session: SessionKey) -> Reservation {
		let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
		let (started_tx, started) = watch::channel(());
		state.slots.insert(session, Slot::Starting { generation, started });
		Reservation {
			shared: self.clone(),
			session,
			generation,
			_started: started_tx,
			armed: true,
		}
	}

	/// Evict and return the longest-idle reclaimable worker.
	fn take_reclaimable(&self, state: &mut PoolState, now: Instant) -> Option<WorkerHandle> {
		let reclaim_after = self.config.reclaim_after();
		let (session, _) = state
			.slots
			.iter()
			.filter_map(|(session, slot)| match slot {
				Slot::Live(worker) if worker.leases == 0 && now.duration_since(worker.last_used) >= reclaim_after => {
					Some((*session, worker.last_used))
				}
				_ => None,
			})
			.min_by_key(|(_, last_used)| *last_used)?;
		state.evict(session)
	}

	fn remove_starting(&self, session: SessionKey, generation: u64) {
		let mut state = self.state.lock();
		if matches!(state.slots.get(&session), Some(Slot::Starting { generation: g, .. }) if *g == generation) {
			state.slots.remove(&session);
		}
	}

	fn cancel_ticket(&self, ticket: u64) -> bool {
		let mut state = self.state.lock();
		let Some(pos) = state.queue.iter().position(|t| t.id == ticket) else {
			return false;
		};
		state.queue.remove(pos);
		true
	}

	/// Hand free slots to queued tickets, oldest first.
	fn promote(self: &Arc<Self>) {
		loop {
			let (ticket, grant) = {
				let mut guard = self.state.lock();
				let state = &mut *guard;
				if state.closed {
					return;
				}
				let Some(session) = state.queue.front().map(|t| t.session) else {
					return;
				};
				let has_slot = state.slots.contains_key(&session);
				if !has_slot && state.occupied() >= self.config.max_processes {
					return;
				}
				let Some(ticket) = state.queue.pop_front() else {
					return;
				};
				let grant = if has_slot {
					Grant::Existing
				} else {
					Grant::Reserved(self.reserve(state, session))
				};
				(ticket, grant)
			};

			debug!(
				session = %ticket.session,
				ticket = ticket.id,
				waited_ms = ticket.enqueued_at.elapsed().as_millis() as u64,
				"pool.promote"
			);
			if let Err(Grant::Reserved(reservation)) = ticket.grant.send(grant) {
				debug!(worker = %reservation.id(), "pool.promote.abandoned");
				reservation.discard();
			}
		}
	}

	fn release_worker(self: &Arc<Self>, id: WorkerId) {
		let (evicted, dead) = {
			let mut guard = self.state.lock();
			let state = &mut *guard;
			let Some(Slot::Live(worker)) = state.slots.get_mut(&id.session) else {
				return;
			};
			if worker.handle.id() != id {
				return;
			}
			worker.leases = worker.leases.saturating_sub(1);
			worker.last_used = Instant::now();
			let idle = worker.leases == 0;
			// A worker that failed its handshake can never serve again.
			let dead = !worker.handle.is_alive();

			// An idle worker at capacity gives its slot to a waiting session
			// rather than leaving the queue to time out.
			let waiting = state.slotless_waiters() > state.stopping;
			let handoff = waiting && state.occupied() >= self.config.max_processes;
			if idle && (dead || handoff) {
				(state.evict(id.session), dead)
			} else {
				(None, dead)
			}
		};

		if let Some(handle) = evicted {
			if dead {
				warn!(worker = %handle.id(), "Replacing unusable worker");
			} else {
				info!(worker = %handle.id(), "Handing idle worker's slot to a queued session");
			}
			self.stop(handle, dead);
		}
		self.promote();
	}

	fn handle_exit(self: &Arc<Self>, id: WorkerId, kind: ExitKind) {
		let removed = {
			let mut state = self.state.lock();
			let current = matches!(state.slots.get(&id.session), Some(Slot::Live(w)) if w.handle.id() == id);
			match current.then(|| state.slots.remove(&id.session)).flatten() {
				Some(Slot::Live(worker)) => Some(worker.handle),
				_ => None,
			}
		};

		match kind {
			ExitKind::Unexpected { code } => {
				warn!(worker = %id, ?code, evicted = removed.is_some(), "Worker exited unexpectedly");
			}
			ExitKind::Requested => debug!(worker = %id, "pool.worker.exited"),
		}
		if let Some(handle) = removed {
			let failed = handle.connection().correlator().fail_all(CallError::WorkerCrashed);
			handle.mark_terminated();
			if failed > 0 {
				debug!(worker = %id, failed, "pool.crash.failed_pending");
			}
		}
		self.promote();
	}

	/// Terminate workers idle for at least `idle_timeout`. Returns how many.
	fn sweep_idle(self: &Arc<Self>) -> usize {
		let idle_timeout = self.config.idle_timeout();
		let now = Instant::now();
		let expired: Vec<WorkerHandle> = {
			let mut state = self.state.lock();
			let keys: Vec<SessionKey> = state
				.slots
				.iter()
				.filter(|(_, slot)| {
					matches!(slot, Slot::Live(w) if w.leases == 0 && now.duration_since(w.last_used) >= idle_timeout)
				})
				.map(|(session, _)| *session)
				.collect();
			keys.into_iter().filter_map(|session| state.evict(session)).collect()
		};

		let count = expired.len();
		for handle in expired {
			info!(worker = %handle.id(), "Terminating idle worker");
			self.stop(handle, false);
		}
		count
	}

	fn stats(&self) -> PoolStats {
		let state = self.state.lock();
		let mut stats = PoolStats {
			stopping: state.stopping,
			queued: state.queue.len(),
			max_processes: self.config.max_processes,
			..PoolStats::default()
		};
		for slot in state.slots.values() {
			match slot {
				Slot::Starting { .. } => stats.starting += 1,
				Slot::Live(worker) => {
					stats.live += 1;
					if worker.leases > 0 {
						stats.busy += 1;
					}
				}
			}
		}
		stats
	}

	/// Stop an evicted worker in the background and give its capacity back
	/// once the process has exited.
	fn stop(self: &Arc<Self>, handle: WorkerHandle, crashed: bool) -> JoinHandle<()> {
		if crashed {
			handle.connection().correlator().fail_all(CallError::WorkerCrashed);
		}
		let shared = self.clone();
		tokio::spawn(async move {
			handle.terminate().await;
			{
				let mut state = shared.state.lock();
				state.stopping = state.stopping.saturating_sub(1);
			}
			debug!(worker = %handle.id(), "pool.worker.stopped");
			shared.promote();
		})
	}
}

impl Drop for PoolShared {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

async fn run_sweep(pool: Weak<PoolShared>, period: Duration, shutdown: CancellationToken) {
	let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => break,
			_ = ticker.tick() => {
				let Some(pool) = pool.upgrade() else {
					break;
				};
				let evicted = pool.sweep_idle();
				if evicted > 0 {
					debug!(evicted, "pool.sweep");
				}
			}
		}
	}
}

/// One lease on a session's worker.
///
/// The worker counts as busy while any lease is held. Dropping the lease
/// releases it.
pub struct WorkerLease {
	shared: Arc<PoolShared>,
	handle: WorkerHandle,
}

impl WorkerLease {
	/// The leased worker.
	pub fn worker(&self) -> &WorkerHandle {
		&self.handle
	}
}

impl Deref for WorkerLease {
	type Target = WorkerHandle;

	fn deref(&self) -> &WorkerHandle {
		&self.handle
	}
}

impl Drop for WorkerLease {
	fn drop(&mut self) {
		self.shared.release_worker(self.handle.id());
	}
}

impl fmt::Debug for WorkerLease {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WorkerLease").field("worker", &self.handle.id()).finish()
	}
}

/// Bounded set of workers shared by all sessions.
#[derive(Clone)]
pub struct WorkerPool {
	shared: Arc<PoolShared>,
}

impl fmt::Debug for WorkerPool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WorkerPool").field("stats", &self.stats()).finish()
	}
}

impl WorkerPool {
	/// Create a pool and start its idle sweep. Must be called within a Tokio
	/// runtime.
	pub fn new(config: PoolConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
		let period = config.sweep_interval();
		let shared = Arc::new(PoolShared {
			config,
			launcher,
			state: Mutex::new(PoolState::default()),
			next_generation: AtomicU64::new(1),
			shutdown: CancellationToken::new(),
		});
		tokio::spawn(run_sweep(Arc::downgrade(&shared), period, shared.shutdown.clone()));
		Self { shared }
	}

	/// Lease the worker for `session`, spawning it if needed.
	///
	/// # Errors
	///
	/// [`BrokerError::PoolExhausted`] when no slot frees up within the
	/// admission timeout, [`BrokerError::SpawnFailed`] when the launcher
	/// fails, [`BrokerError::Shutdown`] once the pool is closed.
	pub async fn acquire(&self, session: SessionKey) -> Result<WorkerLease> {
		loop {
			match self.shared.plan(session)? {
				Plan::Ready(handle) => {
					return Ok(WorkerLease {
						shared: self.shared.clone(),
						handle,
					});
				}
				Plan::AwaitStart(mut started) => {
					// Resolves when the spawner drops its reservation.
					let _ = started.changed().await;
				}
				Plan::Spawn(reservation) => return self.spawn(reservation).await,
				Plan::Queue(queued) => match queued.wait(self.shared.config.admission_timeout()).await {
					Ok(Grant::Reserved(reservation)) => return self.spawn(reservation).await,
					Ok(Grant::Existing) => continue,
					Err(err) => {
						if matches!(err, BrokerError::PoolExhausted) {
							warn!(%session, "Worker pool exhausted; admission timed out");
						}
						return Err(err);
					}
				},
			}
		}
	}

	async fn spawn(&self, reservation: Reservation) -> Result<WorkerLease> {
		let id = reservation.id();
		debug!(worker = %id, "pool.spawn");
		let handle = match self.shared.launcher.launch(id, ExitReporter::new(&self.shared)).await {
			Ok(handle) => handle,
			Err(err) => {
				warn!(worker = %id, error = %err, "Worker spawn failed");
				drop(reservation);
				return Err(err);
			}
		};

		match reservation.install(handle.clone()) {
			Ok(()) => {
				info!(worker = %id, "Worker started");
				Ok(WorkerLease {
					shared: self.shared.clone(),
					handle,
				})
			}
			Err(handle) => {
				debug!(worker = %id, "pool.spawn.orphaned");
				self.shared.state.lock().stopping += 1;
				self.shared.stop(handle, false);
				Err(if self.shared.state.lock().closed {
					BrokerError::Shutdown
				} else {
					BrokerError::SessionClosed
				})
			}
		}
	}

	/// Release one lease on the session's current worker.
	///
	/// [`WorkerLease`] does this on drop; this is for callers that track
	/// leases by session.
	pub fn release(&self, session: SessionKey) {
		let id = match self.shared.state.lock().slots.get(&session) {
			Some(Slot::Live(worker)) => worker.handle.id(),
			_ => return,
		};
		self.shared.release_worker(id);
	}

	/// The session's running worker, without leasing it.
	pub fn worker(&self, session: SessionKey) -> Option<WorkerHandle> {
		match self.shared.state.lock().slots.get(&session) {
			Some(Slot::Live(worker)) => Some(worker.handle.clone()),
			_ => None,
		}
	}

	/// Tear down a session: stop its worker and drop its queued acquires.
	///
	/// Returns once the worker's process has exited.
	pub async fn terminate(&self, session: SessionKey) {
		let (handle, dropped) = {
			let mut state = self.shared.state.lock();
			let handle = state.evict(session);
			let before = state.queue.len();
			state.queue.retain(|t| t.session != session);
			(handle, before - state.queue.len())
		};

		match handle {
			Some(handle) => {
				info!(worker = %handle.id(), dropped, "Terminating session worker");
				let _ = self.shared.stop(handle, false).await;
			}
			None => self.shared.promote(),
		}
	}

	/// Run the idle sweep once. Returns how many workers were terminated.
	pub fn sweep(&self) -> usize {
		self.shared.sweep_idle()
	}

	/// Stop the sweep, fail queued acquires and terminate every worker.
	pub async fn shutdown(&self) {
		self.shared.shutdown.cancel();
		let handles: Vec<WorkerHandle> = {
			let mut state = self.shared.state.lock();
			state.closed = true;
			state.queue.clear();
			state
				.slots
				.drain()
				.filter_map(|(_, slot)| match slot {
					Slot::Live(worker) => Some(worker.handle),
					Slot::Starting { .. } => None,
				})
				.collect()
		};

		let count = handles.len();
		let mut tasks = JoinSet::new();
		for handle in handles {
			tasks.spawn(async move { handle.terminate().await });
		}
		while tasks.join_next().await.is_some() {}
		info!(terminated = count, "Worker pool shut down");
	}

	/// Current occupancy.
	pub fn stats(&self) -> PoolStats {
		self.shared.stats()
	}
}

#[cfg(test)]
mod tests;
