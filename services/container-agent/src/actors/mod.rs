//! Actor framework for the container agent.
//!
//! Work that must never overlap (reconciliation passes against the engine and
//! the registry) is owned by a single actor fed through a bounded mailbox.
//! Callers talk to it through an [`ActorHandle`] and await one-shot replies.

mod framework;

pub use framework::{spawn, Actor, ActorContext, ActorError, ActorHandle, Message};
