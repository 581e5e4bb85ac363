//! Command channel to host agents.
//!
//! [`HostChannel`] stamps every command with a correlation sequence, hands
//! it to a [`HostTransport`], and bounds the wait with a per-command
//! timeout. An expired wait is reported as
//! [`ChannelError::OperationTimedOut`] with `is_active = true`: the agent
//! may still be executing the command, so callers must treat the outcome as
//! unknown rather than failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use fabric_protocol::{Answer, CommandKind, HostCommand, HostId, Request, Response};

use crate::config::ChannelConfig;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("agent on {host} unavailable: {reason}")]
    AgentUnavailable { host: HostId, reason: String },
    #[error("{command} on {host} timed out (still active: {is_active})")]
    OperationTimedOut {
        host: HostId,
        command: &'static str,
        is_active: bool,
    },
    #[error("protocol error from {host}: {detail}")]
    Protocol { host: HostId, detail: String },
}

/// Moves a request to its host agent and returns the correlated response.
#[async_trait]
pub trait HostTransport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, ChannelError>;
}

pub struct HostChannel {
    transport: Arc<dyn HostTransport>,
    config: ChannelConfig,
    next_seq: AtomicU64,
}

impl HostChannel {
    pub fn new(transport: Arc<dyn HostTransport>, config: ChannelConfig) -> Self {
        Self {
            transport,
            config,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Send `command` to `host` and await its answer.
    pub async fn send(&self, host: HostId, command: HostCommand) -> Result<Answer, ChannelError> {
        let kind = command.kind();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let wait = self.config.timeout_for(kind);
        debug!(%host, seq, command = kind.as_str(), vm = command.vm_name(), "sending command");

        let request = Request {
            seq,
            host,
            command,
        };
        match timeout(wait, self.transport.send(request)).await {
            Ok(Ok(response)) if response.seq == seq => Ok(response.answer),
            Ok(Ok(response)) => Err(ChannelError::Protocol {
                host,
                detail: format!("answer seq {} does not match request {seq}", response.seq),
            }),
            Ok(Err(err)) => {
                debug!(%host, seq, error = %err, "command failed in transport");
                Err(err)
            }
            Err(_) => {
                warn!(%host, seq, command = kind.as_str(), ?wait, "command timed out");
                Err(timed_out(host, kind))
            }
        }
    }
}

fn timed_out(host: HostId, kind: CommandKind) -> ChannelError {
    ChannelError::OperationTimedOut {
        host,
        command: kind.as_str(),
        is_active: true,
    }
}
