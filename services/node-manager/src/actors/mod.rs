//! Node actors.
//!
//! One actor per node record. The actor owns all mutation of its record and
//! every create/destroy call for its node, so provider interaction for a
//! node is serialized without any lock spanning a network call.
//!
//! - `framework`: the generic actor loop (mailbox, tick, stop signal)
//! - `node`: the lifecycle state machine
//! - `pool`: spawning, command routing, process drain

mod framework;
mod node;
mod pool;

pub use framework::{spawn_actor, Actor, ActorContext, ActorError, ActorHandle, ActorRef, ActorState, Message};
pub use node::{NodeActor, NodeMessage};
pub use pool::{DrainReport, NodeHandle, NodePool};
