//! Core actor framework types and traits.
//!
//! - `Actor` trait for defining actor behavior
//! - `spawn_actor` to run an actor on its own task
//! - `ActorHandle` for sending messages to an actor
//! - `ActorRef` for stopping and observing it

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages and ticks one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext) -> Result<bool, ActorError>;

    /// Period of `on_tick`, or `None` for a purely message-driven actor.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Timer wakeup. Same return contract as `handle`.
    async fn on_tick(&mut self, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        Ok(true)
    }

    /// Called when the actor starts. Returning `Ok(false)` stops it at once.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        Ok(true)
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}

    /// Called after a failed handler, before the loop decides whether to go on.
    fn on_crash(&mut self, _error: &ActorError) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    pub actor_id: String,

    /// Shutdown signal receiver.
    pub shutdown: watch::Receiver<bool>,

    pub messages_processed: u64,
    pub ticks: u64,
    pub last_message_at: Option<Instant>,
    pub state: ActorState,
}

impl ActorContext {
    pub fn new(actor_id: String, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            actor_id,
            shutdown,
            messages_processed: 0,
            ticks: 0,
            last_message_at: None,
            state: ActorState::Starting,
        }
    }

    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Transient error; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent error; the actor stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("mailbox full")]
    MailboxFull,

    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
#[derive(Debug)]
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message, waiting for mailbox space.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Type-erased actor reference for supervision.
#[derive(Debug)]
pub struct ActorRef {
    pub actor_id: String,
    task_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop after its current message.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Abort the actor task immediately.
    pub fn abort(&self) {
        self.task_handle.abort();
    }
}

/// Run `actor` on its own task.
pub fn spawn_actor<A: Actor>(
    actor: A,
    actor_id: String,
    mailbox_size: usize,
) -> (ActorHandle<A::Message>, ActorRef) {
    let (tx, rx) = mpsc::channel(mailbox_size.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task_handle = tokio::spawn(run_actor_loop(actor, rx, shutdown_rx, actor_id.clone()));

    debug!(actor_id = %actor_id, "Spawned actor");

    (
        ActorHandle {
            tx,
            actor_id: actor_id.clone(),
        },
        ActorRef {
            actor_id,
            task_handle,
            shutdown_tx,
        },
    )
}

// =============================================================================
// Actor Loop
// =============================================================================

enum Step {
    Continue,
    Stop,
}

fn step<A: Actor>(actor: &mut A, ctx: &mut ActorContext, result: Result<bool, ActorError>) -> Step {
    match result {
        Ok(true) => Step::Continue,
        Ok(false) => {
            debug!(actor_id = %ctx.actor_id, "Actor requested stop");
            Step::Stop
        }
        Err(e) => {
            error!(actor_id = %ctx.actor_id, error = %e, "Actor error");
            actor.on_crash(&e);
            if matches!(e, ActorError::Permanent(_)) {
                ctx.state = ActorState::Failed;
                Step::Stop
            } else {
                Step::Continue
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone(), shutdown.clone());

    let started = actor.on_start(&mut ctx).await;
    if let Step::Continue = step(&mut actor, &mut ctx, started) {
        ctx.state = ActorState::Running;

        let mut ticker = actor.tick_interval().map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(actor_id = %actor_id, "Actor received shutdown signal");
                        break;
                    }
                }

                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        debug!(actor_id = %actor_id, "Actor mailbox closed");
                        break;
                    };
                    ctx.messages_processed += 1;
                    ctx.last_message_at = Some(Instant::now());

                    let result = actor.handle(msg, &mut ctx).await;
                    if let Step::Stop = step(&mut actor, &mut ctx, result) {
                        break;
                    }
                }

                _ = next_tick(&mut ticker) => {
                    ctx.ticks += 1;
                    let result = actor.on_tick(&mut ctx).await;
                    if let Step::Stop = step(&mut actor, &mut ctx, result) {
                        break;
                    }
                }
            }
        }
    }

    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopping;
    }
    actor.on_stop(&mut ctx).await;
    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopped;
    }

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        ticks = ctx.ticks,
        "Actor stopped"
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Debug)]
    enum CounterMessage {
        Add(u32),
        Stop,
        Fail,
    }

    struct Counter {
        total: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMessage;

        fn name(&self) -> &str {
            "counter"
        }

        fn tick_interval(&self) -> Option<Duration> {
            Some(Duration::from_secs(1))
        }

        async fn handle(&mut self, msg: CounterMessage, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
            match msg {
                CounterMessage::Add(n) => {
                    self.total.fetch_add(n, Ordering::SeqCst);
                    Ok(true)
                }
                CounterMessage::Stop => Ok(false),
                CounterMessage::Fail => Err(ActorError::Transient("boom".into())),
            }
        }

        async fn on_tick(&mut self, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn counter() -> (Counter, Arc<AtomicU32>, Arc<AtomicU32>) {
        let total = Arc::new(AtomicU32::new(0));
        let ticks = Arc::new(AtomicU32::new(0));
        (
            Counter {
                total: total.clone(),
                ticks: ticks.clone(),
            },
            total,
            ticks,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_and_ticks() {
        let (actor, total, ticks) = counter();
        let (handle, actor_ref) = spawn_actor(actor, "counter_1".into(), 8);

        handle.send(CounterMessage::Add(2)).await.unwrap();
        handle.send(CounterMessage::Fail).await.unwrap();
        handle.send(CounterMessage::Add(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(total.load(Ordering::SeqCst), 5);
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(actor_ref.is_running());

        handle.send(CounterMessage::Stop).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!actor_ref.is_running());
        assert!(matches!(
            handle.send(CounterMessage::Add(1)).await,
            Err(ActorError::ActorStopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal() {
        let (actor, _, _) = counter();
        let (_handle, actor_ref) = spawn_actor(actor, "counter_2".into(), 8);

        actor_ref.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!actor_ref.is_running());
    }

    #[tokio::test]
    async fn test_try_send_full_mailbox() {
        let (tx, _rx) = mpsc::channel::<u32>(1);
        let handle = ActorHandle {
            tx,
            actor_id: "test".to_string(),
        };

        handle.try_send(1).unwrap();
        assert!(matches!(handle.try_send(2), Err(ActorError::MailboxFull)));
    }
}
