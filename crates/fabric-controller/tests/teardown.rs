//! Destroy, recover and expunge.

use fabric_controller::model::State;
use fabric_controller::usage::UsageEventType;
use fabric_controller::{ControllerConfig, ErrorKind, Fault, SyncEngine};
use fabric_protocol::{CommandKind, HostId, PowerState, VmStateReport};

#[path = "helpers.rs"]
mod helpers;
use helpers::{ACCOUNT, Fixture, SMALL, test_config};

#[tokio::test]
async fn destroying_a_running_instance_stops_it_first() {
    let fx = Fixture::new(2);
    let vm = fx.running(SMALL).await;

    let destroyed = fx.orch.destroy(vm.id).await.unwrap();
    assert_eq!(destroyed.state, State::Destroyed);
    assert_eq!(destroyed.host_id, None);
    assert!(fx.fleet.vms(HostId(1)).is_empty());
    assert!(fx.volumes.is_destroyed(vm.id));
    fx.assert_no_capacity_charged(2);
    assert_eq!(fx.usage.count(UsageEventType::Stop), 1);
    assert_eq!(fx.usage.count(UsageEventType::Destroy), 1);

    // Repeating is harmless.
    let again = fx.orch.destroy(vm.id).await.unwrap();
    assert_eq!(again.state, State::Destroyed);
    assert_eq!(fx.usage.count(UsageEventType::Destroy), 1);
}

#[tokio::test]
async fn destroy_goes_through_even_when_host_is_gone() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;
    fx.fleet.fail(HostId(1), None, Fault::Unavailable);

    let destroyed = fx.orch.destroy(vm.id).await.unwrap();
    assert_eq!(destroyed.state, State::Destroyed);
    fx.assert_no_capacity_charged(1);
}

#[tokio::test]
async fn unforced_destroy_needs_a_reachable_host() {
    let config = ControllerConfig {
        destroy_forces_stop: false,
        ..test_config()
    };
    let fx = Fixture::with_config(1, config);
    let vm = fx.running(SMALL).await;
    fx.fleet.fail(HostId(1), None, Fault::Unavailable);

    let err = fx.orch.destroy(vm.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert_eq!(fx.state(vm.id), State::Running);
    assert_eq!(fx.allocated(1), (1000, 1024));

    fx.fleet.clear_faults();
    let destroyed = fx.orch.destroy(vm.id).await.unwrap();
    assert_eq!(destroyed.state, State::Destroyed);
    fx.assert_no_capacity_charged(1);
}

#[tokio::test]
async fn recover_brings_back_a_stopped_instance() {
    let fx = Fixture::new(1);
    let id = fx.allocate(SMALL).await;
    fx.orch.destroy(id).await.unwrap();

    let recovered = fx.orch.recover(id).await.unwrap();
    assert_eq!(recovered.state, State::Stopped);
    assert!(!fx.volumes.is_destroyed(id));
    assert_eq!(fx.usage.count(UsageEventType::Recover), 1);

    // And it starts again like any stopped instance.
    let vm = fx.orch.start(id, None).await.unwrap();
    assert_eq!(vm.state, State::Running);
}

#[tokio::test]
async fn recover_requires_a_destroyed_instance() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;
    let err = fx.orch.recover(vm.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);
}

#[tokio::test]
async fn expunge_removes_everything() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;
    assert_eq!(fx.limits.count(ACCOUNT), 1);

    let err = fx.orch.expunge(vm.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);

    fx.orch.destroy(vm.id).await.unwrap();
    assert!(fx.orch.expunge(vm.id).await.unwrap());

    let row = fx.instance(vm.id);
    assert!(row.is_removed());
    assert_eq!(row.state, State::Expunging);
    assert!(!fx.volumes.exists(vm.id));
    assert_eq!(fx.networks.nic_count(vm.id), 0);
    assert_eq!(fx.limits.count(ACCOUNT), 0);
    assert_eq!(fx.usage.count(UsageEventType::Expunge), 1);

    // Gone from the API, and its work history with it.
    let err = fx.orch.instance(vm.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(fx.orch.ledger().active(vm.id).unwrap().is_none());

    // A second expunge is a no-op.
    assert!(fx.orch.expunge(vm.id).await.unwrap());
}

#[tokio::test]
async fn failed_expunge_can_be_retried() {
    let fx = Fixture::new(1);
    let id = fx.allocate(SMALL).await;
    fx.orch.destroy(id).await.unwrap();
    fx.volumes.fail_expunge(true);

    fx.orch.expunge(id).await.unwrap_err();
    let row = fx.instance(id);
    assert_eq!(row.state, State::Expunging);
    assert!(!row.is_removed());
    assert_eq!(fx.limits.count(ACCOUNT), 1);

    fx.volumes.fail_expunge(false);
    assert!(fx.orch.expunge(id).await.unwrap());
    assert!(fx.instance(id).is_removed());
    assert_eq!(fx.limits.count(ACCOUNT), 0);
}

#[tokio::test]
async fn expunged_vm_reported_by_a_host_is_torn_down() {
    let fx = Fixture::new(1);
    let id = fx.allocate(SMALL).await;
    let name = fx.instance(id).name;
    fx.orch.destroy(id).await.unwrap();
    fx.orch.expunge(id).await.unwrap();

    fx.fleet.place_vm(HostId(1), &name, PowerState::PowerOn);
    let sync = SyncEngine::new(fx.orch.clone());
    let report = vec![VmStateReport::new(name.clone(), PowerState::PowerOn)];
    sync.delta_sync(HostId(1), &report).await.unwrap();

    assert!(fx.fleet.vms(HostId(1)).is_empty());
    assert_eq!(fx.fleet.count(CommandKind::Stop), 1);
}
