//! Live node actors, keyed by node id.

use std::collections::HashMap;
use std::time::Duration;

use fleet_id::{NodeId, TickId};
use fleet_reconcile::DrainPriority;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use super::framework::{spawn_actor, ActorError, ActorHandle, ActorRef};
use super::node::{NodeActor, NodeMessage};
use crate::context::FleetContext;
use crate::registry::{NodeRecord, NodeState, RegistryError};

/// Handle on one running node actor.
#[derive(Debug)]
pub struct NodeHandle {
    mailbox: ActorHandle<NodeMessage>,
    actor: ActorRef,
    boot_cancel: watch::Sender<bool>,
}

impl NodeHandle {
    /// Queue a shutdown and cancel any pending create retry.
    pub fn shutdown(&self, reason: DrainPriority, tick: TickId) -> Result<(), ActorError> {
        self.mailbox.try_send(NodeMessage::Shutdown { reason, tick })?;
        let _ = self.boot_cancel.send(true);
        Ok(())
    }

    pub fn reclaim(&self, tick: TickId) -> Result<(), ActorError> {
        self.mailbox.try_send(NodeMessage::Reclaim { tick })
    }

    pub fn is_running(&self) -> bool {
        self.actor.is_running()
    }
}

/// How the actors came down when the process stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Actors that stopped on their own before the deadline.
    pub stopped: usize,

    /// Actors still running at the deadline, aborted.
    pub aborted: usize,

    /// Records left mid-call (booting or waiting for destroy confirmation).
    pub unsettled: Vec<NodeId>,
}

impl DrainReport {
    /// Every actor finished before the deadline.
    pub fn is_clean(&self) -> bool {
        self.aborted == 0
    }
}

/// Spawns node actors and routes commands to them.
pub struct NodePool {
    ctx: FleetContext,
    nodes: HashMap<NodeId, NodeHandle>,
}

impl NodePool {
    pub fn new(ctx: FleetContext) -> Self {
        Self {
            ctx,
            nodes: HashMap::new(),
        }
    }

    /// Register `record` and start its actor.
    pub fn spawn(&mut self, record: NodeRecord) -> Result<NodeId, RegistryError> {
        let writer = self.ctx.registry.insert(record)?;
        let node_id = writer.id();
        let (boot_cancel, boot_cancel_rx) = watch::channel(false);

        let actor = NodeActor::new(self.ctx.clone(), writer, boot_cancel_rx);
        let (mailbox, actor) = spawn_actor(actor, node_id.to_string(), self.ctx.config.daemon.mailbox_size);

        self.nodes.insert(
            node_id,
            NodeHandle {
                mailbox,
                actor,
                boot_cancel,
            },
        );
        Ok(node_id)
    }

    pub fn get(&self, node_id: NodeId) -> Option<&NodeHandle> {
        self.nodes.get(&node_id)
    }

    pub fn shutdown(&self, node_id: NodeId, reason: DrainPriority, tick: TickId) -> Result<(), ActorError> {
        self.nodes
            .get(&node_id)
            .ok_or(ActorError::ActorStopped)?
            .shutdown(reason, tick)
    }

    pub fn reclaim(&self, node_id: NodeId, tick: TickId) -> Result<(), ActorError> {
        self.nodes
            .get(&node_id)
            .ok_or(ActorError::ActorStopped)?
            .reclaim(tick)
    }

    /// Forget actors that have stopped. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, handle| handle.is_running());
        before - self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Stop every actor. Each finishes the call it is in, records the
    /// outcome, then stops; actors still running at `deadline` are aborted.
    pub async fn drain(&mut self, deadline: Duration) -> DrainReport {
        info!(count = self.nodes.len(), "Stopping node actors");

        for handle in self.nodes.values() {
            handle.actor.stop();
        }

        let until = Instant::now() + deadline;
        while Instant::now() < until && self.nodes.values().any(NodeHandle::is_running) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut report = DrainReport::default();
        for (node_id, handle) in self.nodes.drain() {
            if handle.is_running() {
                warn!(node_id = %node_id, "Force aborting node actor");
                handle.actor.abort();
                report.aborted += 1;
            } else {
                report.stopped += 1;
            }
        }

        report.unsettled = self
            .ctx
            .registry
            .snapshot()
            .into_iter()
            .filter(|r| matches!(r.state, NodeState::Booting | NodeState::ShutdownRequested))
            .map(|r| r.id)
            .collect();
        report.unsettled.sort();

        report
    }
}
