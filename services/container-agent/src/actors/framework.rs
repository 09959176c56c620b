//! Core actor types.
//!
//! An actor is a task that owns its state and consumes a bounded mailbox one
//! message at a time. Callers hold an [`ActorHandle`] and usually send a
//! request carrying a one-shot reply channel.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Message;

    fn name(&self) -> &str;

    /// Returns `Ok(true)` to keep going, `Ok(false)` to stop. An error, such
    /// as a request to another actor that went unanswered, stops the actor.
    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext) -> Result<bool, ActorError>;

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Passed to every handler call.
pub struct ActorContext {
    pub actor_id: String,
    pub shutdown: watch::Receiver<bool>,
    pub handled: u64,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("actor stopped")]
    ActorStopped,

    /// The actor dropped the reply channel without answering.
    #[error("actor dropped the request")]
    NoReply,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Sender side of an actor mailbox.
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
    /// Wait for mailbox capacity and enqueue `msg`.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::ActorStopped)
    }

    /// Send a message built around a reply channel and wait for the answer.
    pub async fn request<R, F>(&self, build: F) -> Result<R, ActorError>
    where
        R: Send + 'static,
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (reply_to, reply) = oneshot::channel();
        self.send(build(reply_to)).await?;
        reply.await.map_err(|_| ActorError::NoReply)
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Run `actor` on its own task behind a mailbox of `mailbox_size`.
///
/// The actor stops when `shutdown` turns true, every handle is dropped, or
/// its handler stops it.
pub fn spawn<A: Actor>(
    actor: A,
    mailbox_size: usize,
    shutdown: watch::Receiver<bool>,
) -> (ActorHandle<A::Message>, JoinHandle<()>) {
    let id = ACTOR_IDS.fetch_add(1, Ordering::Relaxed);
    let actor_id = format!("{}_{}", actor.name(), id);
    let (tx, rx) = mpsc::channel(mailbox_size.max(1));

    info!(actor_id = %actor_id, mailbox_size, "Spawned actor");
    let task = tokio::spawn(run(actor, rx, shutdown, actor_id.clone()));
    (ActorHandle { tx, actor_id }, task)
}

static ACTOR_IDS: AtomicU64 = AtomicU64::new(0);

async fn run<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext {
        actor_id: actor_id.clone(),
        shutdown: shutdown.clone(),
        handled: 0,
    };

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };
                ctx.handled += 1;
                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        error!(actor_id = %actor_id, error = %e, "Actor failed");
                        break;
                    }
                }
            }
        }
    }

    actor.on_stop(&mut ctx).await;
    info!(actor_id = %actor_id, handled = ctx.handled, "Actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum Tally {
        Add(u64, oneshot::Sender<u64>),
        Drop(oneshot::Sender<u64>),
        /// Ask another actor for its total and add it.
        Merge(ActorHandle<Tally>),
        Stop,
    }

    struct Counter {
        total: u64,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = Tally;

        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(&mut self, msg: Tally, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
            match msg {
                Tally::Add(n, reply_to) => {
                    self.total += n;
                    let _ = reply_to.send(self.total);
                    Ok(true)
                }
                Tally::Drop(_) => Ok(true),
                Tally::Merge(other) => {
                    self.total += other.request(|r| Tally::Add(0, r)).await?;
                    Ok(true)
                }
                Tally::Stop => Ok(false),
            }
        }
    }

    #[tokio::test]
    async fn test_requests_are_handled_in_order() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = spawn(Counter { total: 0 }, 1, shutdown_rx);

        assert_eq!(handle.request(|r| Tally::Add(2, r)).await.unwrap(), 2);
        assert_eq!(handle.request(|r| Tally::Add(3, r)).await.unwrap(), 5);
        assert!(handle.actor_id().starts_with("counter_"));
    }

    #[tokio::test]
    async fn test_dropped_reply() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = spawn(Counter { total: 0 }, 1, shutdown_rx);

        assert!(matches!(handle.request(Tally::Drop).await, Err(ActorError::NoReply)));
    }

    #[tokio::test]
    async fn test_merge() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (a, _task) = spawn(Counter { total: 0 }, 1, shutdown_rx.clone());
        let (b, _task) = spawn(Counter { total: 0 }, 1, shutdown_rx);

        b.request(|r| Tally::Add(4, r)).await.unwrap();
        a.send(Tally::Merge(b.clone())).await.unwrap();
        assert_eq!(a.request(|r| Tally::Add(1, r)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_failed_request_stops_actor() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (a, task) = spawn(Counter { total: 0 }, 1, shutdown_rx.clone());
        let (b, b_task) = spawn(Counter { total: 0 }, 1, shutdown_rx);

        b.send(Tally::Stop).await.unwrap();
        b_task.await.unwrap();

        a.send(Tally::Merge(b)).await.unwrap();
        task.await.unwrap();
        assert!(matches!(
            a.request(|r| Tally::Add(1, r)).await,
            Err(ActorError::ActorStopped)
        ));
    }

    #[tokio::test]
    async fn test_stop_and_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = spawn(Counter { total: 0 }, 1, shutdown_rx.clone());
        handle.send(Tally::Stop).await.unwrap();
        task.await.unwrap();

        let (_handle, task) = spawn(Counter { total: 0 }, 1, shutdown_rx);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
