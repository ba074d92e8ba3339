//! Node actor: drives one node record through its lifecycle.
//!
//! The actor is the only writer of its record and the only caller of
//! create/destroy for its node. It wakes up on a short tick to look at the
//! latest inventory and demand snapshots and its own timers, and handles
//! commands from the reconciler in between. Work is strictly sequential, so
//! a snapshot, a timer and a command can never race on the same record.
//!
//! A shutdown command cancels a pending create retry through a separate
//! watch channel, since the actor cannot read its mailbox while it waits in
//! a retry backoff.

use std::time::Duration;

use async_trait::async_trait;
use fleet_id::TickId;
use fleet_reconcile::DrainPriority;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::framework::{Actor, ActorContext, ActorError};
use crate::cloud::{instance_tags, CancelSignal, CloudError, InstanceId, InstanceState};
use crate::context::FleetContext;
use crate::events::{CloudOp, FleetEvent};
use crate::registry::{NodeState, RecordWriter, RegistryError};

// =============================================================================
// Messages
// =============================================================================

/// Commands from the reconciler.
#[derive(Debug)]
pub enum NodeMessage {
    /// Begin shutting the node down. Ignored while the node is busy.
    Shutdown { reason: DrainPriority, tick: TickId },

    /// Cancel a shutdown that is still inside its grace window.
    Reclaim { tick: TickId },
}

impl From<RegistryError> for ActorError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Terminal { .. } => ActorError::Permanent(e.to_string()),
            other => ActorError::Transient(other.to_string()),
        }
    }
}

/// Destroy bookkeeping while in `ShutdownRequested`.
#[derive(Debug, Clone, Copy)]
struct DestroyProgress {
    /// Inventory sequence number current when the destroy was acknowledged.
    /// Only a newer snapshot can confirm absence.
    acked_seq: Option<u64>,
    next_check_at: Instant,
}

// =============================================================================
// Node Actor
// =============================================================================

/// Actor owning one node record.
pub struct NodeActor {
    ctx: FleetContext,
    writer: RecordWriter,

    /// Fires when the reconciler shuts the node down.
    boot_cancel: watch::Receiver<bool>,
    create_cancel: CancelSignal,
    destroy_cancel: CancelSignal,

    /// Last inventory snapshot processed.
    inventory_seq: u64,

    /// Consecutive fresh snapshots that did not list a paired instance.
    missing_polls: u32,

    next_create_at: Option<Instant>,
    destroy: Option<DestroyProgress>,
}

impl NodeActor {
    pub fn new(ctx: FleetContext, writer: RecordWriter, boot_cancel: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            writer,
            create_cancel: CancelSignal::from_watch(boot_cancel.clone()),
            boot_cancel,
            destroy_cancel: CancelSignal::never(),
            inventory_seq: 0,
            missing_polls: 0,
            next_create_at: None,
            destroy: None,
        }
    }

    fn is_done(&self) -> bool {
        self.writer.state().is_terminal()
    }

    /// Apply a transition and emit its event.
    fn transition(&self, to: NodeState, reason: &str) -> Result<(), ActorError> {
        let from = self.writer.transition(to, Instant::now())?;
        let record = self.writer.read();

        if to == NodeState::Failed {
            warn!(node_id = %record.id, from = %from, reason, "Node failed");
        } else {
            info!(node_id = %record.id, from = %from, to = %to, reason, "Node state changed");
        }

        self.ctx.events.emit(FleetEvent::NodeStateChanged {
            node_id: record.id,
            instance_id: record.instance_id,
            size: record.size.name,
            from,
            to,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn fail(&self, reason: &str, error: Option<String>) -> Result<(), ActorError> {
        self.writer.update(|r| {
            if error.is_some() {
                r.last_error = error;
            }
        })?;
        self.transition(NodeState::Failed, reason)
    }

    fn emit_call<T>(&self, op: CloudOp, instance_id: Option<InstanceId>, result: &Result<T, CloudError>) {
        self.ctx.events.emit(FleetEvent::CloudCall {
            node_id: self.writer.id(),
            op,
            instance_id,
            ok: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    async fn attempt_create(&mut self) -> Result<(), ActorError> {
        let record = self.writer.read();
        let tags = instance_tags(&self.ctx.config.cloud.owner_tag, record.id, &record.size);

        let result = self
            .ctx
            .cloud
            .create(&record.size, &tags, &mut self.create_cancel)
            .await;
        if matches!(result, Err(CloudError::Cancelled)) {
            debug!(node_id = %record.id, "Create cancelled before it was issued");
            self.next_create_at = None;
            return Ok(());
        }
        self.emit_call(CloudOp::Create, result.as_ref().ok().cloned(), &result);

        match result {
            Ok(instance_id) => {
                self.next_create_at = None;
                self.writer.set_instance_id(instance_id)?;
                self.transition(NodeState::UnpairedWait, "create acknowledged")
            }
            Err(e @ CloudError::RetriesExhausted { .. }) => {
                let failures = self.writer.update(|r| {
                    r.failure_count += 1;
                    r.last_error = Some(e.to_string());
                    r.failure_count
                })?;

                if failures >= self.ctx.config.daemon.max_create_attempts {
                    self.transition(NodeState::Failed, "create attempts exhausted")
                } else {
                    let delay = self.ctx.cloud.backoff().delay(failures);
                    warn!(node_id = %record.id, failures, retry_in_ms = delay.as_millis() as u64, error = %e, "Create failed, will retry");
                    self.next_create_at = Some(Instant::now() + delay);
                    Ok(())
                }
            }
            Err(e) => self.fail("create rejected by provider", Some(e.to_string())),
        }
    }

    // -------------------------------------------------------------------------
    // Destroy
    // -------------------------------------------------------------------------

    /// Enter `ShutdownRequested` and issue the first destroy.
    async fn request_destroy(&mut self, reason: &str) -> Result<(), ActorError> {
        self.transition(NodeState::ShutdownRequested, reason)?;
        self.destroy = Some(DestroyProgress {
            acked_seq: None,
            next_check_at: Instant::now(),
        });
        self.attempt_destroy().await
    }

    async fn attempt_destroy(&mut self) -> Result<(), ActorError> {
        let record = self.writer.read();
        let Some(instance_id) = record.instance_id.clone() else {
            return self.transition(NodeState::Terminated, "no instance to destroy");
        };

        let result = self
            .ctx
            .cloud
            .destroy(&instance_id, &mut self.destroy_cancel)
            .await;
        if matches!(result, Err(CloudError::Cancelled)) {
            debug!(node_id = %record.id, "Destroy cancelled by process shutdown");
            return Ok(());
        }
        self.emit_call(CloudOp::Destroy, Some(instance_id.clone()), &result);

        match result {
            Ok(()) => {
                let acked_seq = self.ctx.registry.inventory().seq;
                let recheck = self.ctx.config.inventory_poll_interval() * 2
                    + self.ctx.cloud.backoff().delay(record.failure_count);
                debug!(node_id = %record.id, instance_id = %instance_id, acked_seq, "Destroy acknowledged");
                self.destroy = Some(DestroyProgress {
                    acked_seq: Some(acked_seq),
                    next_check_at: Instant::now() + recheck,
                });
                Ok(())
            }
            Err(e) => self.escalate_destroy(&instance_id, &e.to_string()),
        }
    }

    /// Count a failed or ineffective destroy. Gives up after
    /// `max_destroy_escalations` and fails the record.
    fn escalate_destroy(&mut self, instance_id: &InstanceId, why: &str) -> Result<(), ActorError> {
        let escalations = self.writer.update(|r| {
            r.failure_count += 1;
            r.last_error = Some(why.to_string());
            r.failure_count
        })?;
        let gave_up = escalations >= self.ctx.config.daemon.max_destroy_escalations;

        error!(
            node_id = %self.writer.id(),
            instance_id = %instance_id,
            escalations,
            gave_up,
            error = why,
            "Destroy not confirmed"
        );
        self.ctx.events.emit(FleetEvent::NodeDestroyEscalated {
            node_id: self.writer.id(),
            instance_id: instance_id.clone(),
            escalations,
            gave_up,
        });

        if gave_up {
            self.destroy = None;
            return self.transition(NodeState::Failed, "destroy escalations exhausted");
        }

        self.destroy = Some(DestroyProgress {
            acked_seq: None,
            next_check_at: Instant::now() + self.ctx.cloud.backoff().delay(escalations),
        });
        Ok(())
    }

    /// Best-effort cleanup on the way to FAILED. The outcome is logged, not
    /// acted on.
    async fn destroy_and_fail(&mut self, reason: &str) -> Result<(), ActorError> {
        let record = self.writer.read();
        let instance_id = record.instance_id.clone().or_else(|| {
            self.ctx
                .registry
                .inventory()
                .find_by_node(record.id)
                .map(|instance| instance.id.clone())
        });

        if let Some(instance_id) = instance_id {
            let result = self.ctx.cloud.destroy_best_effort(&instance_id).await;
            self.emit_call(CloudOp::Destroy, Some(instance_id.clone()), &result);
            if let Err(e) = &result {
                warn!(node_id = %record.id, instance_id = %instance_id, error = %e, "Best-effort destroy failed");
            }
        }

        self.transition(NodeState::Failed, reason)
    }

    // -------------------------------------------------------------------------
    // Observations
    // -------------------------------------------------------------------------

    fn observe_inventory(&mut self) -> Result<(), ActorError> {
        let snapshot = self.ctx.registry.inventory();
        if snapshot.seq == self.inventory_seq {
            return Ok(());
        }
        self.inventory_seq = snapshot.seq;

        let record = self.writer.read();
        let listed = match &record.instance_id {
            Some(id) => snapshot.instances.get(id),
            None => snapshot
                .find_by_node(record.id)
                .filter(|instance| !instance.state.is_gone()),
        };
        let now = Instant::now();

        match record.state {
            NodeState::Booting | NodeState::UnpairedWait => {
                let Some(instance) = listed else {
                    return Ok(());
                };

                if instance.state.is_gone() {
                    return self.fail("instance terminated before pairing", None);
                }
                if record.instance_id.is_none() {
                    info!(node_id = %record.id, instance_id = %instance.id, "Found instance by node tag");
                    self.writer.set_instance_id(instance.id.clone())?;
                }
                if record.state == NodeState::Booting {
                    self.next_create_at = None;
                    self.transition(NodeState::UnpairedWait, "instance found by node tag")?;
                }
                if instance.state == InstanceState::Running {
                    self.writer.update(|r| r.last_seen = Some(now))?;
                    self.missing_polls = 0;
                    self.transition(NodeState::PairedIdle, "instance running")?;
                }
                Ok(())
            }

            NodeState::PairedIdle | NodeState::PairedBusy | NodeState::ShutdownPending => {
                match listed {
                    Some(instance) if !instance.state.is_gone() => {
                        self.missing_polls = 0;
                        self.writer.update(|r| r.last_seen = Some(now))?;
                        Ok(())
                    }
                    _ => {
                        self.missing_polls += 1;
                        if self.missing_polls >= 2 {
                            self.fail("instance disappeared", None)
                        } else {
                            Ok(())
                        }
                    }
                }
            }

            NodeState::ShutdownRequested => {
                let confirmable = self
                    .destroy
                    .and_then(|p| p.acked_seq)
                    .is_some_and(|acked| snapshot.seq > acked);
                let absent = listed.is_none_or(|i| i.state == InstanceState::Terminated);

                if confirmable && absent {
                    self.destroy = None;
                    self.transition(NodeState::Terminated, "absence confirmed by inventory")
                } else {
                    Ok(())
                }
            }

            NodeState::Terminated | NodeState::Failed => Ok(()),
        }
    }

    fn observe_demand(&mut self) -> Result<(), ActorError> {
        let demand = self.ctx.registry.demand();
        if !demand.observed {
            return Ok(());
        }

        let record = self.writer.read();
        let Some(instance_id) = &record.instance_id else {
            return Ok(());
        };
        let busy = demand.busy.contains(instance_id);

        match (record.state, busy) {
            (NodeState::PairedIdle, true) => self.transition(NodeState::PairedBusy, "job assigned"),
            (NodeState::ShutdownPending, true) => {
                self.transition(NodeState::PairedBusy, "job assigned during grace, shutdown cancelled")
            }
            // A stale busy set never releases a node.
            (NodeState::PairedBusy, false) if !demand.degraded => {
                self.transition(NodeState::PairedIdle, "job finished")
            }
            _ => Ok(()),
        }
    }

    async fn check_timers(&mut self) -> Result<(), ActorError> {
        let record = self.writer.read();
        let now = Instant::now();
        let boot_timeout = self.ctx.config.boot_timeout();

        match record.state {
            NodeState::Booting if record.age(now) >= boot_timeout => {
                self.destroy_and_fail("boot timeout").await
            }
            NodeState::Booting => match self.next_create_at {
                Some(at) if at <= now => self.attempt_create().await,
                _ => Ok(()),
            },
            NodeState::UnpairedWait if record.age(now) >= boot_timeout => {
                self.destroy_and_fail("boot timeout").await
            }
            NodeState::ShutdownPending if record.in_state_for(now) >= self.ctx.config.shutdown_grace() => {
                self.request_destroy("shutdown grace elapsed").await
            }
            NodeState::ShutdownRequested => {
                let Some(progress) = self.destroy else {
                    return self.attempt_destroy().await;
                };
                if progress.next_check_at > now {
                    return Ok(());
                }

                match progress.acked_seq {
                    // Last attempt failed outright.
                    None => self.attempt_destroy().await,
                    Some(acked) => {
                        let snapshot = self.ctx.registry.inventory();
                        let Some(instance_id) = record.instance_id.clone() else {
                            return Ok(());
                        };
                        let still_running = snapshot
                            .instances
                            .get(&instance_id)
                            .is_some_and(|i| !i.state.is_gone());

                        if snapshot.seq > acked && still_running {
                            self.escalate_destroy(&instance_id, "instance still listed after destroy")?;
                            if !self.is_done() {
                                self.attempt_destroy().await?;
                            }
                        } else {
                            // No newer data yet, or already stopping.
                            self.destroy = Some(DestroyProgress {
                                next_check_at: now + self.ctx.config.inventory_poll_interval(),
                                ..progress
                            });
                        }
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    async fn handle_shutdown(&mut self, reason: DrainPriority, tick: TickId) -> Result<(), ActorError> {
        let record = self.writer.read();
        debug!(node_id = %record.id, state = %record.state, reason = reason.as_str(), tick = %tick, "Shutdown requested");

        match record.state {
            NodeState::Booting => {
                // The create may have landed without an acknowledgement.
                let found = self
                    .ctx
                    .registry
                    .inventory()
                    .find_by_node(record.id)
                    .filter(|instance| !instance.state.is_gone())
                    .map(|instance| instance.id.clone());

                match found {
                    Some(instance_id) => {
                        self.writer.set_instance_id(instance_id)?;
                        self.request_destroy("shutdown while booting").await
                    }
                    None => {
                        self.next_create_at = None;
                        self.transition(NodeState::Terminated, "shutdown before create")
                    }
                }
            }
            NodeState::UnpairedWait => self.request_destroy("shutdown before pairing").await,
            NodeState::PairedIdle => self.transition(NodeState::ShutdownPending, reason.as_str()),
            NodeState::PairedBusy => {
                info!(node_id = %record.id, "Node is busy, shutdown ignored");
                Ok(())
            }
            NodeState::ShutdownPending | NodeState::ShutdownRequested => Ok(()),
            NodeState::Terminated | NodeState::Failed => Ok(()),
        }
    }

    fn handle_reclaim(&mut self, tick: TickId) -> Result<(), ActorError> {
        if self.writer.state() == NodeState::ShutdownPending {
            debug!(node_id = %self.writer.id(), tick = %tick, "Reclaiming node");
            self.transition(NodeState::PairedIdle, "reclaimed for demand")?;
        }
        Ok(())
    }
}

#[async_trait]
impl Actor for NodeActor {
    type Message = NodeMessage;

    fn name(&self) -> &str {
        "node"
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.ctx.config.actor_tick())
    }

    async fn on_start(&mut self, ctx: &mut ActorContext) -> Result<bool, ActorError> {
        self.create_cancel = CancelSignal::from_watch(self.boot_cancel.clone()).or(ctx.shutdown.clone());
        self.destroy_cancel = CancelSignal::from_watch(ctx.shutdown.clone());

        if self.writer.state() == NodeState::Booting {
            self.attempt_create().await?;
        }
        Ok(!self.is_done())
    }

    async fn handle(&mut self, msg: NodeMessage, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        match msg {
            NodeMessage::Shutdown { reason, tick } => self.handle_shutdown(reason, tick).await?,
            NodeMessage::Reclaim { tick } => self.handle_reclaim(tick)?,
        }
        Ok(!self.is_done())
    }

    async fn on_tick(&mut self, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        self.observe_inventory()?;
        if !self.is_done() {
            self.observe_demand()?;
        }
        if !self.is_done() {
            self.check_timers().await?;
        }
        Ok(!self.is_done())
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        let record = self.writer.read();
        debug!(node_id = %record.id, state = %record.state, "Node actor stopped");
    }

    fn on_crash(&mut self, error: &ActorError) {
        if matches!(error, ActorError::Permanent(_)) && !self.is_done() {
            let _ = self.fail("actor crashed", Some(error.to_string()));
        }
    }
}
