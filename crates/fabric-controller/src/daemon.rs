//! Long-lived controller process.
//!
//! The daemon runs a select loop that:
//! 1. Dispatches control messages to the orchestrator
//! 2. Feeds agent reports to the sync engine
//! 3. Drains the recovery queue
//! 4. Reaps finished work items and scans for stuck transitions on timers
//! 5. Handles graceful shutdown
//!
//! Every lifecycle operation runs on its own task; the loop itself never
//! waits on a host.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use fabric_protocol::{AgentEvent, NicSpec};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{HostId, Instance, InstanceId, NetworkId};
use crate::orchestrator::{AllocateRequest, Orchestrator};
use crate::recovery::{RecoveryTask, RecoveryWorker};
use crate::sync::SyncEngine;

type Reply<T> = oneshot::Sender<OrchestratorResult<T>>;

/// Control message for the daemon, usually produced by the control server.
#[derive(Debug)]
pub enum ControlMsg {
    Allocate {
        request: AllocateRequest,
        resp: Reply<InstanceId>,
    },
    Start {
        instance: InstanceId,
        host: Option<HostId>,
        resp: Reply<Instance>,
    },
    Stop {
        instance: InstanceId,
        forced: bool,
        resp: Reply<bool>,
    },
    Reboot {
        instance: InstanceId,
        resp: Reply<Instance>,
    },
    Migrate {
        instance: InstanceId,
        destination: HostId,
        resp: Reply<Instance>,
    },
    MigrateAway {
        instance: InstanceId,
        source: HostId,
        resp: Reply<Instance>,
    },
    Destroy {
        instance: InstanceId,
        resp: Reply<Instance>,
    },
    Expunge {
        instance: InstanceId,
        resp: Reply<bool>,
    },
    Recover {
        instance: InstanceId,
        resp: Reply<Instance>,
    },
    AddNic {
        instance: InstanceId,
        network: NetworkId,
        resp: Reply<NicSpec>,
    },
    RemoveNic {
        instance: InstanceId,
        network: NetworkId,
        resp: Reply<bool>,
    },
    Show {
        instance: InstanceId,
        resp: Reply<Instance>,
    },
    Shutdown {
        resp: Reply<()>,
        /// Propagates shutdown to the control server.
        shutdown_tx: broadcast::Sender<()>,
    },
}

pub struct FabricDaemon {
    orchestrator: Arc<Orchestrator>,
    sync: Arc<SyncEngine>,
    recovery: Arc<RecoveryWorker>,
    control_rx: mpsc::Receiver<ControlMsg>,
    events_rx: mpsc::UnboundedReceiver<AgentEvent>,
    recovery_rx: mpsc::UnboundedReceiver<RecoveryTask>,
    shutdown_rx: broadcast::Receiver<()>,
    control_server: Option<JoinHandle<()>>,
}

impl FabricDaemon {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        recovery_rx: mpsc::UnboundedReceiver<RecoveryTask>,
        events_rx: mpsc::UnboundedReceiver<AgentEvent>,
        control_rx: mpsc::Receiver<ControlMsg>,
        shutdown_rx: broadcast::Receiver<()>,
        control_server: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            sync: Arc::new(SyncEngine::new(orchestrator.clone())),
            recovery: Arc::new(RecoveryWorker::new(orchestrator.clone())),
            orchestrator,
            control_rx,
            events_rx,
            recovery_rx,
            shutdown_rx,
            control_server,
        }
    }

    /// Run until shutdown is requested or every input channel has closed.
    pub async fn run(&mut self) -> OrchestratorResult<()> {
        tracing::info!(node = self.orchestrator.config().node_id, "fabric daemon started");

        // Work this node left behind before a restart.
        let handed = self.recovery.hand_off()?;
        if handed > 0 {
            tracing::info!("Handed off {} abandoned work item(s)", handed);
        }

        let config = self.orchestrator.config().clone();
        let mut cleanup = interval(config.ledger.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut scan = interval(config.sync.scan_interval);
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut control_open = true;
        let mut events_open = true;

        loop {
            if !control_open && !events_open {
                tracing::info!("Control and event channels closed, exiting");
                break;
            }

            tokio::select! {
                msg = self.control_rx.recv(), if control_open => {
                    match msg {
                        Some(ControlMsg::Shutdown { resp, shutdown_tx }) => {
                            tracing::info!("Shutdown requested via control channel");
                            let _ = resp.send(Ok(()));
                            let _ = shutdown_tx.send(());
                            break;
                        }
                        Some(cmd) => self.dispatch(cmd),
                        None => {
                            tracing::debug!("Control channel closed");
                            control_open = false;
                        }
                    }
                }

                event = self.events_rx.recv(), if events_open => {
                    match event {
                        Some(event) => {
                            let sync = self.sync.clone();
                            tokio::spawn(async move {
                                let host = event.host();
                                if let Err(err) = sync.handle_event(event).await {
                                    tracing::warn!(%host, error = %err, "sync failed");
                                }
                            });
                        }
                        None => {
                            tracing::debug!("Agent event channel closed");
                            events_open = false;
                        }
                    }
                }

                Some(task) = self.recovery_rx.recv() => {
                    let worker = self.recovery.clone();
                    tokio::spawn(async move {
                        let instance = task.instance();
                        if let Err(err) = worker.handle(task).await {
                            tracing::warn!(%instance, error = %err, "recovery task failed");
                        }
                    });
                }

                _ = cleanup.tick() => {
                    if let Err(err) = self.orchestrator.ledger().cleanup(config.ledger.retention) {
                        tracing::warn!(error = %err, "work cleanup failed");
                    }
                }

                _ = scan.tick() => {
                    match self.sync.scan_stuck() {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("Queued state checks for {} stuck instance(s)", n),
                        Err(err) => tracing::warn!(error = %err, "stuck scan failed"),
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        tracing::info!("fabric daemon stopped");
        if let Some(handle) = self.control_server.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Run one control command on its own task and answer on its channel.
    fn dispatch(&self, cmd: ControlMsg) {
        let orch = self.orchestrator.clone();
        tokio::spawn(async move {
            match cmd {
                ControlMsg::Allocate { request, resp } => {
                    let _ = resp.send(orch.allocate(request).await);
                }
                ControlMsg::Start {
                    instance,
                    host,
                    resp,
                } => {
                    let _ = resp.send(orch.start(instance, host).await);
                }
                ControlMsg::Stop {
                    instance,
                    forced,
                    resp,
                } => {
                    let _ = resp.send(orch.stop(instance, forced).await);
                }
                ControlMsg::Reboot { instance, resp } => {
                    let _ = resp.send(orch.reboot(instance).await);
                }
                ControlMsg::Migrate {
                    instance,
                    destination,
                    resp,
                } => {
                    let _ = resp.send(orch.migrate(instance, destination).await);
                }
                ControlMsg::MigrateAway {
                    instance,
                    source,
                    resp,
                } => {
                    let _ = resp.send(orch.migrate_away(instance, source).await);
                }
                ControlMsg::Destroy { instance, resp } => {
                    let _ = resp.send(orch.destroy(instance).await);
                }
                ControlMsg::Expunge { instance, resp } => {
                    let _ = resp.send(orch.expunge(instance).await);
                }
                ControlMsg::Recover { instance, resp } => {
                    let _ = resp.send(orch.recover(instance).await);
                }
                ControlMsg::AddNic {
                    instance,
                    network,
                    resp,
                } => {
                    let _ = resp.send(orch.add_nic(instance, network).await);
                }
                ControlMsg::RemoveNic {
                    instance,
                    network,
                    resp,
                } => {
                    let _ = resp.send(orch.remove_nic(instance, network).await);
                }
                ControlMsg::Show { instance, resp } => {
                    let _ = resp.send(orch.instance(instance));
                }
                ControlMsg::Shutdown { resp, .. } => {
                    let _ = resp.send(Err(OrchestratorError::InvalidRequest(
                        "shutdown is handled by the daemon loop".into(),
                    )));
                }
            }
        });
    }
}
