use pretty_assertions::assert_eq;
use serde_json::{Value as JsonValue, json};

use super::*;
use crate::launcher::test_helpers::{FakeBehavior, TestLauncher};

const S1: SessionKey = SessionKey(1);
const S2: SessionKey = SessionKey(2);
const S3: SessionKey = SessionKey(3);

fn config(max_processes: usize) -> PoolConfig {
	PoolConfig {
		max_processes,
		..PoolConfig::default()
	}
}

fn pool(max_processes: usize, launcher: &TestLauncher) -> WorkerPool {
	WorkerPool::new(config(max_processes), Arc::new(launcher.clone()))
}

/// Let spawned tasks (monitors, terminations) run to quiescence. With paused
/// time the clock only moves once nothing else is runnable.
async fn settle() {
	tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn acquire_reuses_the_session_worker() {
	let launcher = TestLauncher::new();
	let pool = pool(2, &launcher);

	let first = pool.acquire(S1).await.unwrap();
	let second = pool.acquire(S1).await.unwrap();
	assert_eq!(first.id(), second.id());
	assert_eq!(launcher.launches(), 1);
	assert_eq!(
		pool.stats(),
		PoolStats {
			live: 1,
			starting: 0,
			stopping: 0,
			busy: 1,
			queued: 0,
			max_processes: 2,
		}
	);

	drop(first);
	assert_eq!(pool.stats().busy, 1);
	drop(second);
	assert_eq!(pool.stats().busy, 0);
	assert_eq!(pool.stats().live, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn concurrent_acquires_for_one_session_spawn_once() {
	let launcher = TestLauncher::with_behavior(FakeBehavior {
		launch_delay: Duration::from_millis(20),
		..FakeBehavior::default()
	});
	let pool = pool(2, &launcher);

	let (a, b, c) = tokio::join!(pool.acquire(S1), pool.acquire(S1), pool.acquire(S1));
	let ids = [a.unwrap().id(), b.unwrap().id(), c.unwrap().id()];
	assert!(ids.iter().all(|id| *id == ids[0]));
	assert_eq!(launcher.launches(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn pool_never_exceeds_its_bound() {
	let launcher = TestLauncher::with_behavior(FakeBehavior {
		launch_delay: Duration::from_millis(5),
		..FakeBehavior::default()
	});
	let pool = pool(2, &launcher);

	let a = pool.acquire(S1).await.unwrap();
	let b = pool.acquire(S2).await.unwrap();

	let waiter = {
		let pool = pool.clone();
		tokio::spawn(async move { pool.acquire(S3).await.map(|lease| lease.id()) })
	};
	settle().await;
	let stats = pool.stats();
	assert_eq!(stats.live + stats.starting, 2);
	assert_eq!(stats.queued, 1);
	assert_eq!(launcher.launches(), 2);

	drop(a);
	let granted = waiter.await.unwrap().unwrap();
	assert_eq!(granted.session, S3);
	settle().await;
	let stats = pool.stats();
	assert!(stats.live + stats.starting <= 2);
	assert_eq!(launcher.running(), 2);
	drop(b);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn single_slot_hands_over_between_sessions() {
	let launcher = TestLauncher::new();
	let pool = pool(1, &launcher);

	let a = pool.acquire(S1).await.unwrap();
	let a_id = a.id();

	let b = {
		let pool = pool.clone();
		tokio::spawn(async move { pool.acquire(S2).await })
	};
	settle().await;
	assert!(!b.is_finished());
	assert_eq!(pool.stats().queued, 1);

	drop(a);
	let b = b.await.unwrap().unwrap();
	assert_eq!(b.id().session, S2);
	assert_ne!(b.id(), a_id);

	settle().await;
	assert_eq!(pool.stats().live, 1);
	assert!(pool.worker(S1).is_none());
	let workers = launcher.workers();
	assert!(!workers[0].is_running());
	assert_eq!(workers[0].count("shutdown"), 1);
	assert_eq!(workers[0].count("exit"), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn queued_acquire_times_out_with_pool_exhausted() {
	let launcher = TestLauncher::new();
	let pool = pool(1, &launcher);
	let _busy = pool.acquire(S1).await.unwrap();

	let err = pool.acquire(S2).await.unwrap_err();
	assert!(matches!(err, BrokerError::PoolExhausted));
	assert_eq!(pool.stats().queued, 0);
	assert_eq!(launcher.launches(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn idle_worker_is_reclaimed_under_pressure() {
	let launcher = TestLauncher::new();
	let pool = pool(1, &launcher);

	drop(pool.acquire(S1).await.unwrap());
	tokio::time::advance(Duration::from_secs(61)).await;

	let lease = pool.acquire(S2).await.unwrap();
	assert_eq!(lease.id().session, S2);
	settle().await;
	assert!(pool.worker(S1).is_none());
	assert!(!launcher.workers()[0].is_running());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn reclaimed_worker_exits_before_its_replacement_starts() {
	// A worker that ignores `shutdown` takes the whole grace period to stop.
	let launcher = TestLauncher::with_behavior(FakeBehavior::default().silent("shutdown"));
	let pool = pool(1, &launcher);

	drop(pool.acquire(S1).await.unwrap());
	tokio::time::advance(Duration::from_secs(61)).await;

	let waiter = {
		let pool = pool.clone();
		tokio::spawn(async move { pool.acquire(S2).await.map(|lease| lease.id()) })
	};
	settle().await;
	assert_eq!(pool.stats().stopping, 1);
	assert_eq!(launcher.launches(), 1, "replacement waits for the old process");

	while !waiter.is_finished() {
		assert!(launcher.running() <= 1);
		let stats = pool.stats();
		assert!(stats.live + stats.starting + stats.stopping <= 1);
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	let granted = waiter.await.unwrap().unwrap();
	assert_eq!(granted.session, S2);
	assert_eq!(launcher.launches(), 2);
	assert_eq!(launcher.running(), 1);
	assert_eq!(pool.stats().stopping, 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn handoff_on_release_waits_for_the_old_process() {
	let launcher = TestLauncher::with_behavior(FakeBehavior::default().silent("shutdown"));
	let pool = pool(1, &launcher);
	let a = pool.acquire(S1).await.unwrap();

	let b = {
		let pool = pool.clone();
		tokio::spawn(async move { pool.acquire(S2).await.map(|lease| lease.id()) })
	};
	settle().await;

	drop(a);
	while !b.is_finished() {
		assert!(launcher.running() <= 1);
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert_eq!(b.await.unwrap().unwrap().session, S2);
	assert_eq!(launcher.running(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn reclaim_prefers_the_longest_idle_worker() {
	let launcher = TestLauncher::new();
	let pool = pool(2, &launcher);

	drop(pool.acquire(S1).await.unwrap());
	tokio::time::advance(Duration::from_secs(30)).await;
	drop(pool.acquire(S2).await.unwrap());
	tokio::time::advance(Duration::from_secs(70)).await;

	let _lease = pool.acquire(S3).await.unwrap();
	assert!(pool.worker(S1).is_none());
	assert!(pool.worker(S2).is_some());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn idle_workers_are_evicted_within_one_sweep() {
	let launcher = TestLauncher::new();
	let pool = pool(2, &launcher);

	drop(pool.acquire(S1).await.unwrap());
	let _held = pool.acquire(S2).await.unwrap();
	settle().await;

	// Idle timeout is 300 s and the sweep runs every 60 s.
	tokio::time::sleep(Duration::from_secs(300 + 60)).await;
	settle().await;

	assert!(pool.worker(S1).is_none());
	assert!(pool.worker(S2).is_some(), "leased workers are never swept");
	assert!(!launcher.workers()[0].is_running());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn manual_sweep_respects_idle_timeout() {
	let launcher = TestLauncher::new();
	let config = PoolConfig {
		sweep_interval_secs: 3600,
		..config(2)
	};
	let pool = WorkerPool::new(config, Arc::new(launcher.clone()));

	drop(pool.acquire(S1).await.unwrap());
	tokio::time::advance(Duration::from_secs(100)).await;
	assert_eq!(pool.sweep(), 0);
	tokio::time::advance(Duration::from_secs(200)).await;
	assert_eq!(pool.sweep(), 1);
	assert_eq!(pool.stats().live, 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn crash_rejects_pending_requests_and_frees_the_slot() {
	let launcher = TestLauncher::with_behavior(FakeBehavior::default().silent("textDocument/hover"));
	let pool = pool(1, &launcher);

	let lease = pool.acquire(S1).await.unwrap();
	let pending: Vec<_> = (0..3)
		.map(|_| lease.connection().send("textDocument/hover", json!({})).unwrap())
		.collect();
	settle().await;

	let waiter = {
		let pool = pool.clone();
		tokio::spawn(async move { pool.acquire(S2).await.map(|l| l.id()) })
	};
	settle().await;

	launcher.workers()[0].crash();
	settle().await;

	for p in pending {
		assert!(matches!(p.recv().await, Err(CallError::WorkerCrashed)));
	}
	assert!(pool.worker(S1).is_none());

	// The crashed slot went to the queued session.
	let promoted = waiter.await.unwrap().unwrap();
	assert_eq!(promoted.session, S2);
	drop(lease);
	assert_eq!(pool.stats().live, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn session_respawns_after_crash_with_new_generation() {
	let launcher = TestLauncher::new();
	let pool = pool(1, &launcher);

	let first = pool.acquire(S1).await.unwrap().id();
	launcher.workers()[0].crash();
	settle().await;

	let second = pool.acquire(S1).await.unwrap().id();
	assert_eq!(second.session, S1);
	assert!(second.generation > first.generation);
	assert_eq!(launcher.launches(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failed_spawn_releases_its_reservation() {
	let launcher = TestLauncher::new();
	launcher.fail_next(1);
	let pool = pool(1, &launcher);

	let err = pool.acquire(S1).await.unwrap_err();
	assert!(matches!(err, BrokerError::SpawnFailed { .. }));
	assert_eq!(pool.stats().starting, 0);

	let lease = pool.acquire(S2).await.unwrap();
	assert_eq!(lease.id().session, S2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cancelled_waiter_leaves_no_ticket_and_spawns_nothing() {
	let launcher = TestLauncher::new();
	let pool = pool(1, &launcher);
	let busy = pool.acquire(S1).await.unwrap();

	let waiter = {
		let pool = pool.clone();
		tokio::spawn(async move { pool.acquire(S2).await.map(|l| l.id()) })
	};
	settle().await;
	assert_eq!(pool.stats().queued, 1);

	waiter.abort();
	settle().await;
	assert_eq!(pool.stats().queued, 0);

	drop(busy);
	settle().await;
	assert_eq!(launcher.launches(), 1);
	assert!(pool.worker(S1).is_some());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn terminate_session_stops_worker_and_drops_its_tickets() {
	let launcher = TestLauncher::new();
	let pool = pool(1, &launcher);
	let busy = pool.acquire(S1).await.unwrap();

	let queued = {
		let pool = pool.clone();
		tokio::spawn(async move { pool.acquire(S2).await.map(|l| l.id()) })
	};
	settle().await;

	pool.terminate(S2).await;
	assert!(matches!(queued.await.unwrap(), Err(BrokerError::SessionClosed)));

	pool.terminate(S1).await;
	assert!(!launcher.workers()[0].is_running());
	assert_eq!(pool.stats().live, 0);
	drop(busy);
	assert_eq!(pool.stats().live, 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn shutdown_terminates_everything_and_refuses_new_work() {
	let launcher = TestLauncher::new();
	let pool = pool(1, &launcher);
	let _a = pool.acquire(S1).await.unwrap();

	let queued = {
		let pool = pool.clone();
		tokio::spawn(async move { pool.acquire(S2).await.map(|l| l.id()) })
	};
	settle().await;

	pool.shutdown().await;
	assert!(matches!(queued.await.unwrap(), Err(BrokerError::Shutdown)));
	assert!(matches!(pool.acquire(S3).await, Err(BrokerError::Shutdown)));
	assert_eq!(launcher.running(), 0);
	assert_eq!(pool.stats().live, 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn leases_route_requests_to_the_worker() {
	let launcher = TestLauncher::new();
	let pool = pool(1, &launcher);
	let lease = pool.acquire(S1).await.unwrap();

	let result = lease
		.request("textDocument/hover", json!({}), Duration::from_secs(1))
		.await
		.unwrap();
	assert_eq!(result["contents"]["value"], "greet(name: str) -> str");

	let err = lease
		.request("textDocument/formatting", JsonValue::Null, Duration::from_secs(1))
		.await
		.unwrap_err();
	assert!(matches!(err, BrokerError::Rpc(_)));

	pool.release(S1);
	assert_eq!(pool.stats().busy, 0);
	// Releasing past zero saturates.
	drop(lease);
	assert_eq!(pool.stats().busy, 0);
	assert_eq!(pool.stats().live, 1);
}

mod properties {
	use proptest::prelude::*;
	use tokio::task::JoinHandle;

	use super::*;

	const MAX: usize = 2;

	#[derive(Debug, Clone)]
	enum PoolOp {
		Acquire(u64),
		Release,
		Crash(usize),
		Advance(u64),
	}

	fn pool_op() -> impl Strategy<Value = PoolOp> {
		prop_oneof![
			4 => (1u64..=4).prop_map(PoolOp::Acquire),
			3 => Just(PoolOp::Release),
			1 => (0usize..8).prop_map(PoolOp::Crash),
			2 => (1u64..400).prop_map(PoolOp::Advance),
			1 => Just(PoolOp::Advance(61_000)),
		]
	}

	fn run_paused<F: std::future::Future>(fut: F) -> F::Output {
		tokio::runtime::Builder::new_current_thread()
			.enable_time()
			.start_paused(true)
			.build()
			.unwrap()
			.block_on(fut)
	}

	fn check(pool: &WorkerPool, launcher: &TestLauncher) -> Result<(), TestCaseError> {
		let stats = pool.stats();
		prop_assert!(
			stats.live + stats.starting + stats.stopping <= MAX,
			"capacity exceeded: {stats:?}"
		);
		prop_assert!(launcher.running() <= MAX, "{} processes running", launcher.running());
		Ok(())
	}

	async fn drive(ops: Vec<PoolOp>) -> Result<(), TestCaseError> {
		// Workers that ignore `shutdown` keep their process around for the
		// whole grace period, which is when overlap would show.
		let launcher = TestLauncher::with_behavior(FakeBehavior {
			launch_delay: Duration::from_millis(5),
			..FakeBehavior::default().silent("shutdown")
		});
		let pool = pool(MAX, &launcher);
		let mut acquiring: Vec<JoinHandle<Result<WorkerLease>>> = Vec::new();
		let mut held: Vec<WorkerLease> = Vec::new();

		for op in ops {
			match op {
				PoolOp::Acquire(session) => {
					let pool = pool.clone();
					acquiring.push(tokio::spawn(async move { pool.acquire(SessionKey(session)).await }));
				}
				PoolOp::Release => {
					if !held.is_empty() {
						held.remove(0);
					}
				}
				PoolOp::Crash(index) => {
					let workers = launcher.workers();
					if let Some(worker) = workers.get(index) {
						worker.crash();
					}
				}
				PoolOp::Advance(ms) => {
					let mut remaining = ms;
					while remaining > 0 {
						let step = remaining.min(100);
						tokio::time::sleep(Duration::from_millis(step)).await;
						remaining -= step;
						check(&pool, &launcher)?;
					}
				}
			}
			settle().await;
			check(&pool, &launcher)?;

			let (done, waiting): (Vec<_>, Vec<_>) = acquiring.into_iter().partition(|task| task.is_finished());
			acquiring = waiting;
			for task in done {
				if let Ok(Ok(lease)) = task.await {
					held.push(lease);
				}
			}
		}

		held.clear();
		for task in acquiring {
			task.abort();
		}
		settle().await;
		check(&pool, &launcher)
	}

	proptest! {
		#![proptest_config(ProptestConfig::with_cases(64))]

		/// Neither reserved slots nor running processes ever exceed the bound,
		/// including while evicted workers are still shutting down.
		#[test]
		fn pool_bound_holds_for_any_schedule(ops in prop::collection::vec(pool_op(), 1..30)) {
			run_paused(drive(ops))?;
		}
	}
}
