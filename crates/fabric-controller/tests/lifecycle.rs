//! Start, stop and reboot against a simulated fleet.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fabric_controller::ErrorKind;
use fabric_controller::clock::Clock;
use fabric_controller::ledger::{LedgerError, Step, WorkType};
use fabric_controller::model::{HostStatus, HypervisorType, State};
use fabric_controller::services::VolumeService;
use fabric_controller::state::{Event, StateMachine, TransitionError};
use fabric_controller::usage::UsageEventType;
use fabric_controller::{AllocateRequest, Fault, RecoveryTask, RecoveryWorker};
use fabric_protocol::{CommandKind, FailureReason, HostId, PowerState};

#[path = "helpers.rs"]
mod helpers;
use helpers::{Fixture, LARGE, SMALL, host};

#[tokio::test]
async fn start_places_on_first_host_and_charges_capacity() {
    let fx = Fixture::new(3);
    let vm = fx.running(SMALL).await;

    assert_eq!(vm.host_id, Some(HostId(1)));
    assert_eq!(vm.pod_id, Some(1));
    assert_eq!(fx.fleet.power_of(HostId(1), &vm.name), Some(PowerState::PowerOn));
    assert_eq!(fx.allocated(1), (1000, 1024));
    assert_eq!(fx.instance(vm.id).power_state, PowerState::PowerOn);
    assert_eq!(fx.usage.count(UsageEventType::Create), 1);
    assert_eq!(fx.usage.count(UsageEventType::Start), 1);
    assert!(fx.orch.ledger().active(vm.id).unwrap().is_none());
}

#[tokio::test]
async fn starting_a_running_instance_is_a_no_op() {
    let fx = Fixture::new(2);
    let vm = fx.running(SMALL).await;

    let again = fx.orch.start(vm.id, None).await.unwrap();
    assert_eq!(again.state, State::Running);
    assert_eq!(again.host_id, vm.host_id);
    assert_eq!(fx.fleet.count(CommandKind::Start), 1);
    assert_eq!(fx.allocated(1), (1000, 1024));
}

#[tokio::test]
async fn explicit_host_is_honoured() {
    let fx = Fixture::new(3);
    let id = fx.allocate(SMALL).await;
    let vm = fx.orch.start(id, Some(HostId(3))).await.unwrap();
    assert_eq!(vm.host_id, Some(HostId(3)));
    assert_eq!(fx.allocated(1), (0, 0));
    assert_eq!(fx.allocated(3), (1000, 1024));
}

#[tokio::test]
async fn stop_releases_capacity_and_remembers_host() {
    let fx = Fixture::new(2);
    let vm = fx.running(SMALL).await;

    assert!(fx.orch.stop(vm.id, false).await.unwrap());

    let stopped = fx.instance(vm.id);
    assert_eq!(stopped.state, State::Stopped);
    assert_eq!(stopped.host_id, None);
    assert_eq!(stopped.last_host_id, Some(HostId(1)));
    assert!(fx.fleet.vms(HostId(1)).is_empty());
    fx.assert_no_capacity_charged(2);
    assert_eq!(fx.usage.count(UsageEventType::Stop), 1);

    // Stopping again does nothing.
    assert!(fx.orch.stop(vm.id, false).await.unwrap());
    assert_eq!(fx.fleet.count(CommandKind::Stop), 1);
}

#[tokio::test]
async fn restart_prefers_the_last_host() {
    let fx = Fixture::new(3);
    let id = fx.allocate(SMALL).await;
    fx.orch.start(id, Some(HostId(2))).await.unwrap();
    fx.orch.stop(id, false).await.unwrap();

    let vm = fx.orch.start(id, None).await.unwrap();
    assert_eq!(vm.host_id, Some(HostId(2)));
}

#[tokio::test]
async fn restart_widens_plan_when_volume_cluster_is_full() {
    let fx = Fixture::new(1);
    let id = fx.allocate(SMALL).await;
    fx.orch.start(id, None).await.unwrap();
    fx.orch.stop(id, false).await.unwrap();
    let root = fx.volumes.root_volume(id).await.unwrap().unwrap();
    assert_eq!(root.cluster_id, Some(1));
    assert_eq!(root.pool_id, Some(101));

    let mut other = host(2);
    other.cluster_id = 2;
    fx.store.upsert_host(&other).unwrap();
    fx.fleet.add_host(HostId(2));
    fx.store.set_host_status(HostId(1), HostStatus::Maintenance).unwrap();

    let vm = fx.orch.start(id, None).await.unwrap();
    assert_eq!(vm.state, State::Running);
    assert_eq!(vm.host_id, Some(HostId(2)));
    let root = fx.volumes.root_volume(id).await.unwrap().unwrap();
    assert_eq!(root.cluster_id, Some(2));
    assert_eq!(root.pool_id, Some(102));
    assert_eq!(fx.volumes.attached_to(id), Some(HostId(2)));
    assert_eq!(fx.allocated(2), (1000, 1024));
}

#[tokio::test]
async fn refused_stop_leaves_instance_running() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;
    fx.fleet.fail(
        HostId(1),
        Some(CommandKind::Stop),
        Fault::Reject(FailureReason::Other),
    );

    assert!(!fx.orch.stop(vm.id, false).await.unwrap());
    assert_eq!(fx.state(vm.id), State::Running);
    assert_eq!(fx.allocated(1), (1000, 1024));
    assert!(fx.orch.ledger().active(vm.id).unwrap().is_none());
}

#[tokio::test]
async fn forced_stop_tolerates_unreachable_host() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;
    fx.fleet.fail(HostId(1), None, Fault::Unavailable);

    let err = fx.orch.stop(vm.id, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert_eq!(fx.state(vm.id), State::Running);

    assert!(fx.orch.stop(vm.id, true).await.unwrap());
    assert_eq!(fx.state(vm.id), State::Stopped);
    fx.assert_no_capacity_charged(1);
}

#[tokio::test]
async fn failed_attempt_moves_to_next_host() {
    let fx = Fixture::new(3);
    fx.fleet.fail(
        HostId(1),
        Some(CommandKind::Start),
        Fault::Reject(FailureReason::InsufficientCapacity),
    );
    let vm = fx.running(SMALL).await;

    assert_eq!(vm.host_id, Some(HostId(2)));
    assert_eq!(fx.fleet.count(CommandKind::Start), 2);
    assert_eq!(fx.allocated(1), (0, 0));
    assert_eq!(fx.allocated(2), (1000, 1024));
}

#[tokio::test]
async fn storage_failure_moves_to_next_host() {
    let fx = Fixture::new(2);
    fx.volumes.fail_prepare_on(HostId(1));
    let vm = fx.running(SMALL).await;

    assert_eq!(vm.host_id, Some(HostId(2)));
    // Nothing was sent to the host whose storage failed.
    assert!(
        fx.fleet
            .commands()
            .iter()
            .all(|(host, cmd)| !(*host == HostId(1) && cmd.kind() == CommandKind::Start))
    );
}

#[tokio::test]
async fn exhausted_retries_leave_instance_stopped() {
    let fx = Fixture::new(4);
    for n in 1..=4 {
        fx.fleet.fail(
            HostId(n),
            Some(CommandKind::Start),
            Fault::Reject(FailureReason::ResourceUnavailable),
        );
    }
    let id = fx.allocate(SMALL).await;

    let err = fx.orch.start(id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientCapacity);
    // One attempt plus two retries.
    assert_eq!(fx.fleet.count(CommandKind::Start), 3);
    assert_eq!(fx.state(id), State::Stopped);
    assert!(!fx.networks.is_prepared(id));
    fx.assert_no_capacity_charged(4);
    assert!(fx.orch.ledger().active(id).unwrap().is_none());
}

#[tokio::test]
async fn full_hosts_are_skipped_without_contacting_them() {
    let fx = Fixture::new(2);
    let first = fx.running(LARGE).await;
    let second = fx.running(LARGE).await;
    assert_eq!(first.host_id, Some(HostId(1)));
    assert_eq!(second.host_id, Some(HostId(2)));

    let third = fx.allocate(LARGE).await;
    let err = fx.orch.start(third, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientCapacity);
    assert_eq!(fx.fleet.count(CommandKind::Start), 2);
    assert_eq!(fx.state(third), State::Stopped);

    // Room frees up once one of them stops.
    fx.orch.stop(first.id, false).await.unwrap();
    let vm = fx.orch.start(third, None).await.unwrap();
    assert_eq!(vm.host_id, Some(HostId(1)));
}

#[tokio::test(start_paused = true)]
async fn unanswered_start_is_not_treated_as_failure() {
    let mut fx = Fixture::new(2);
    fx.fleet
        .fail(HostId(1), Some(CommandKind::Start), Fault::Hang);
    let id = fx.allocate(SMALL).await;

    let err = fx.orch.start(id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Indeterminate);

    // No retry elsewhere; the reservation stays until someone finds out.
    assert_eq!(fx.fleet.count(CommandKind::Start), 1);
    assert_eq!(fx.state(id), State::Starting);
    assert_eq!(fx.allocated(1), (1000, 1024));

    let tasks = fx.drain_recovery();
    assert_eq!(
        tasks,
        vec![RecoveryTask::ForceStop {
            instance: id,
            host: Some(HostId(1)),
        }]
    );

    let worker = RecoveryWorker::new(fx.orch.clone());
    for task in tasks {
        worker.handle(task).await.unwrap();
    }
    assert_eq!(fx.state(id), State::Stopped);
    fx.assert_no_capacity_charged(2);
}

#[tokio::test(start_paused = true)]
async fn timed_out_start_that_booted_is_cleaned_up() {
    let mut fx = Fixture::new(1);
    fx.fleet
        .fail(HostId(1), Some(CommandKind::Start), Fault::Timeout);
    let id = fx.allocate(SMALL).await;
    let name = fx.instance(id).name;

    fx.orch.start(id, None).await.unwrap_err();
    assert_eq!(fx.fleet.power_of(HostId(1), &name), Some(PowerState::PowerOn));

    let worker = RecoveryWorker::new(fx.orch.clone());
    for task in fx.drain_recovery() {
        worker.handle(task).await.unwrap();
    }
    assert_eq!(fx.state(id), State::Stopped);
    assert_eq!(fx.fleet.power_of(HostId(1), &name), None);
}

#[tokio::test]
async fn conflicting_work_is_refused() {
    let fx = Fixture::new(1);
    let id = fx.allocate(SMALL).await;
    let ledger = fx.orch.ledger();
    let mut held = ledger.acquire(id, WorkType::Stop, State::Stopping).unwrap();

    let err = fx.orch.start(id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Concurrency);
    assert!(err.is_retryable());
    assert_eq!(fx.fleet.count(CommandKind::Start), 0);
    assert!(matches!(
        ledger.acquire(id, WorkType::Start, State::Starting),
        Err(LedgerError::Busy { .. })
    ));

    ledger.complete(&mut held).unwrap();
    fx.orch.start(id, None).await.unwrap();
}

#[tokio::test]
async fn waiting_start_runs_once_conflict_settles() {
    let fx = Fixture::new(1);
    let id = fx.allocate(SMALL).await;
    let ledger = fx.orch.ledger().clone();
    let mut held = ledger.acquire(id, WorkType::Stop, State::Stopping).unwrap();

    let orch = fx.orch.clone();
    let waiter = tokio::spawn(async move { orch.start(id, None).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    ledger.cancel(&mut held).unwrap();

    let vm = waiter.await.unwrap().unwrap();
    assert_eq!(vm.state, State::Running);
}

#[tokio::test]
async fn stale_work_is_overridden() {
    let fx = Fixture::new(1);
    let id = fx.allocate(SMALL).await;
    let held = fx
        .orch
        .ledger()
        .acquire(id, WorkType::Stop, State::Stopping)
        .unwrap();

    fx.clock.advance(Duration::from_secs(601));
    fx.orch.start(id, None).await.unwrap();

    let old = fx.orch.ledger().work_item(&held.id).unwrap().unwrap();
    assert_eq!(old.step, Step::Cancelled);
}

#[tokio::test]
async fn reboot_only_applies_to_running_instances() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;

    let rebooted = fx.orch.reboot(vm.id).await.unwrap();
    assert_eq!(rebooted.state, State::Running);
    assert_eq!(fx.fleet.count(CommandKind::Reboot), 1);
    assert_eq!(fx.usage.count(UsageEventType::Migrate), 0);

    fx.orch.stop(vm.id, false).await.unwrap();
    let err = fx.orch.reboot(vm.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);
}

#[tokio::test]
async fn timed_out_reboot_schedules_state_check() {
    let mut fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;
    fx.fleet
        .fail(HostId(1), Some(CommandKind::Reboot), Fault::Timeout);

    let err = fx.orch.reboot(vm.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Indeterminate);
    let tasks = fx.drain_recovery();
    assert_eq!(tasks, vec![RecoveryTask::CheckState { instance: vm.id }]);

    fx.fleet.clear_faults();
    let worker = RecoveryWorker::new(fx.orch.clone());
    for task in tasks {
        worker.handle(task).await.unwrap();
    }
    assert_eq!(fx.state(vm.id), State::Running);
    assert_eq!(fx.instance(vm.id).host_id, Some(HostId(1)));
    assert_eq!(fx.allocated(1), (1000, 1024));
}

#[tokio::test]
async fn allocate_replays_by_uuid() {
    let fx = Fixture::new(1);
    let mut request = AllocateRequest::new(7, 1, SMALL, 1, HypervisorType::Simulator);
    request.uuid = Some("web-1".into());

    let first = fx.orch.allocate(request.clone()).await.unwrap();
    let second = fx.orch.allocate(request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(fx.limits.count(7), 1);
    let vm = fx.instance(first);
    assert_eq!(vm.state, State::Stopped);
    assert_eq!(vm.name, format!("i-7-{}-VM", first));
}

#[tokio::test]
async fn allocate_rejects_unknown_offering() {
    let fx = Fixture::new(1);
    let request = AllocateRequest::new(7, 1, 99, 1, HypervisorType::Simulator);
    let err = fx.orch.allocate(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(fx.limits.count(7), 0);
}

#[tokio::test]
async fn lifecycle_on_sqlite_store() {
    let fx = Fixture::sqlite(2);
    let vm = fx.running(SMALL).await;
    assert_eq!(fx.allocated(1), (1000, 1024));

    assert!(fx.orch.stop(vm.id, false).await.unwrap());
    assert_eq!(fx.state(vm.id), State::Stopped);
    fx.assert_no_capacity_charged(2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_start_and_stop_serialise() {
    let fx = Fixture::new(2);
    let id = fx.allocate(SMALL).await;

    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let orch = fx.orch.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut most = 0;
            while !done.load(Ordering::SeqCst) {
                let live = orch
                    .ledger()
                    .outstanding_for_node()
                    .unwrap()
                    .into_iter()
                    .filter(|w| w.instance_id == id)
                    .count();
                most = most.max(live);
                tokio::task::yield_now().await;
            }
            most
        })
    };

    let start = tokio::spawn({
        let orch = fx.orch.clone();
        async move { orch.start(id, None).await }
    });
    let stop = tokio::spawn({
        let orch = fx.orch.clone();
        async move { orch.stop(id, false).await }
    });
    let started = start.await.unwrap().unwrap();
    let stopped = stop.await.unwrap().unwrap();
    done.store(true, Ordering::SeqCst);

    assert!(watcher.await.unwrap() <= 1);
    assert_eq!(started.state, State::Running);
    assert!(stopped);
    assert!(fx.orch.ledger().active(id).unwrap().is_none());

    // Either order is fine, as long as host and books agree with the row.
    let vm = fx.instance(id);
    match vm.state {
        State::Running => {
            let host = vm.host_id.unwrap();
            assert!(fx.fleet.vms(host).contains(&vm.name));
            assert_eq!(fx.allocated(host.0), (1000, 1024));
        }
        State::Stopped => {
            assert_eq!(vm.host_id, None);
            assert!(fx.fleet.vms(HostId(1)).is_empty());
            assert!(fx.fleet.vms(HostId(2)).is_empty());
            fx.assert_no_capacity_charged(2);
        }
        other => panic!("instance left in {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_transitions_from_one_snapshot() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;
    let clock: Arc<dyn Clock> = fx.clock.clone();
    let machine = Arc::new(StateMachine::new(fx.store.clone(), clock));

    let racers: Vec<_> = (0..2)
        .map(|_| {
            let machine = machine.clone();
            let snapshot = vm.clone();
            tokio::spawn(async move {
                machine.transition(&snapshot, Event::StopRequested, None, None)
            })
        })
        .collect();
    let mut results = Vec::new();
    for racer in racers {
        results.push(racer.await.unwrap());
    }

    let won: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(won.len(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(TransitionError::Stale {
            expected: State::Running,
            ..
        })
    )));

    let row = fx.instance(vm.id);
    assert_eq!(row.state, State::Stopping);
    assert_eq!(row.version, vm.version + 1);
    assert_eq!(won[0].version, row.version);
}
