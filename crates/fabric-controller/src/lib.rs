pub mod capacity;
pub mod channel;
pub mod clock;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod guru;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod profile;
pub mod recovery;
pub mod services;
pub mod sim;
pub mod state;
pub mod store;
pub mod sync;
pub mod usage;

pub use channel::{ChannelError, HostChannel, HostTransport};
pub use config::ControllerConfig;
pub use control::{ControlClient, ControlServer, RequestEnvelope, ResponseEnvelope};
pub use daemon::{ControlMsg, FabricDaemon};
pub use error::{ErrorKind, OrchestratorError, OrchestratorResult};
pub use ledger::{WorkItem, WorkLedger};
pub use orchestrator::{AllocateRequest, Orchestrator, OrchestratorBuilder};
pub use recovery::{RecoveryQueue, RecoveryTask, RecoveryWorker};
pub use sim::{Fault, SimulatedFleet};
pub use store::{FleetStore, MemStore, SqliteStore};
pub use sync::{SyncEngine, reconcile};
