//! NIC hot-plug on running and stopped instances.

use fabric_controller::ErrorKind;
use fabric_controller::Fault;
use fabric_controller::model::State;
use fabric_controller::services::NetworkService;
use fabric_protocol::{CommandKind, FailureReason, HostCommand, HostId};

#[path = "helpers.rs"]
mod helpers;
use helpers::{Fixture, SMALL};

#[tokio::test]
async fn running_instance_gets_nic_plugged() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;

    let nic = fx.orch.add_nic(vm.id, 200).await.unwrap();
    assert_eq!(nic.network_id, 200);
    assert_eq!(nic.device_id, 1);
    assert!(nic.ip.is_some());
    assert_eq!(fx.fleet.count(CommandKind::PlugNic), 1);
    assert_eq!(fx.networks.nic_count(vm.id), 2);
    assert_eq!(fx.state(vm.id), State::Running);
    assert!(fx.orch.ledger().active(vm.id).unwrap().is_none());
}

#[tokio::test]
async fn refused_plug_drops_the_record() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;
    fx.fleet.fail(
        HostId(1),
        Some(CommandKind::PlugNic),
        Fault::Reject(FailureReason::ResourceUnavailable),
    );

    let err = fx.orch.add_nic(vm.id, 200).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert_eq!(fx.networks.nic_count(vm.id), 1);

    fx.fleet.clear_faults();
    fx.orch.add_nic(vm.id, 200).await.unwrap();
    assert_eq!(fx.networks.nic_count(vm.id), 2);
}

#[tokio::test]
async fn stopped_instance_picks_nic_up_on_start() {
    let fx = Fixture::new(1);
    let id = fx.allocate(SMALL).await;

    fx.orch.add_nic(id, 200).await.unwrap();
    assert_eq!(fx.fleet.count(CommandKind::PlugNic), 0);

    fx.orch.start(id, None).await.unwrap();
    let started = fx
        .fleet
        .commands()
        .into_iter()
        .find_map(|(_, cmd)| match cmd {
            HostCommand::Start(start) => Some(start.vm),
            _ => None,
        })
        .unwrap();
    let networks: Vec<u64> = started.nics.iter().map(|n| n.network_id).collect();
    assert_eq!(networks, vec![100, 200]);
}

#[tokio::test]
async fn duplicate_network_is_refused() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;

    let err = fx.orch.add_nic(vm.id, 100).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(fx.fleet.count(CommandKind::PlugNic), 0);
}

#[tokio::test]
async fn remove_nic_unplugs_from_running_instance() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;
    fx.orch.add_nic(vm.id, 200).await.unwrap();

    assert!(fx.orch.remove_nic(vm.id, 200).await.unwrap());
    assert_eq!(fx.fleet.count(CommandKind::UnplugNic), 1);
    let left: Vec<u64> = fx
        .networks
        .nics(vm.id)
        .await
        .unwrap()
        .iter()
        .map(|n| n.network_id)
        .collect();
    assert_eq!(left, vec![100]);

    assert!(!fx.orch.remove_nic(vm.id, 200).await.unwrap());
    assert_eq!(fx.fleet.count(CommandKind::UnplugNic), 1);
}

#[tokio::test]
async fn refused_unplug_keeps_the_record() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;
    fx.fleet.fail(
        HostId(1),
        Some(CommandKind::UnplugNic),
        Fault::Reject(FailureReason::Other),
    );

    let err = fx.orch.remove_nic(vm.id, 100).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert_eq!(fx.networks.nic_count(vm.id), 1);
}

#[tokio::test]
async fn nics_do_not_change_on_destroyed_instances() {
    let fx = Fixture::new(1);
    let vm = fx.running(SMALL).await;
    fx.orch.destroy(vm.id).await.unwrap();

    let err = fx.orch.add_nic(vm.id, 200).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    let err = fx.orch.remove_nic(vm.id, 100).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}
