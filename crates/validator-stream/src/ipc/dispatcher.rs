//! Inbound dispatcher.
//!
//! Every decoded envelope is either the reply to one of our calls or a call
//! from the validator. Replies settle their pending entry; anything else is
//! queued for the registered [`InboundHandler`]. The queue task starts one
//! handler task per envelope, in arrival order, with at most
//! `inbound_concurrency` running at once, so a slow handler neither stalls
//! the receive loop nor the messages behind it.

use crate::domain::Envelope;
use crate::ipc::connection::Replier;
use crate::ipc::pending::{PendingTable, Resolution, Settlement};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receives envelopes the validator sent on its own initiative.
///
/// Answer through the given [`Replier`] rather than a captured `Connection`:
/// the replier does not keep the connection alive.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope, replier: Replier);
}

#[async_trait]
impl<F, Fut> InboundHandler for F
where
    F: Fn(Envelope, Replier) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope, replier: Replier) {
        (self)(envelope, replier).await
    }
}

/// Where an inbound envelope went.
#[derive(Debug)]
pub enum Route {
    /// Resolved a live pending call.
    Reply,
    /// Reply to a call that already ended; dropped.
    Late(Envelope),
    /// Not ours: belongs to the inbound handler.
    Inbound(Envelope),
}

/// Decide the fate of one envelope against the pending table.
///
/// Must run under the same lock that guards the table.
pub fn route(table: &mut PendingTable, envelope: Envelope) -> Route {
    let correlation_id = envelope.correlation_id().clone();

    // Settlement consumes the content only on a hit; clone is a refcount bump.
    match table.settle(&correlation_id, Resolution::Reply(envelope.content().clone())) {
        Settlement::Settled => Route::Reply,
        Settlement::Retired => Route::Late(envelope),
        Settlement::Unknown => Route::Inbound(envelope),
    }
}

/// Statistics for inbound traffic
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Replies dropped because their call already ended
    pub late_replies: AtomicU64,
    /// Envelopes handed to the inbound handler
    pub forwarded: AtomicU64,
    /// Envelopes dropped because no handler was registered
    pub unhandled: AtomicU64,
    /// Frames that failed to decode
    pub malformed: AtomicU64,
}

/// Queue feeding per-envelope handler tasks.
pub struct InboundQueue {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl InboundQueue {
    /// Spawn the queue task. It ends once the queue is dropped; handler tasks
    /// already started run to completion.
    pub fn spawn(
        handler: Arc<dyn InboundHandler>,
        replier: Replier,
        concurrency: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));

        let task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };

                debug!(
                    correlation_id = %envelope.correlation_id(),
                    message_type = %envelope.message_type(),
                    "Dispatching inbound message"
                );

                let handler = Arc::clone(&handler);
                let replier = replier.clone();
                tokio::spawn(async move {
                    handler.handle(envelope, replier).await;
                    drop(permit);
                });
            }
            debug!("Inbound queue closed, dispatcher stopping");
        });

        (Self { tx }, task)
    }

    /// Hand an envelope to the dispatcher without waiting for it.
    pub fn push(&self, envelope: Envelope) -> bool {
        match self.tx.send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::SendError(envelope)) => {
                warn!(
                    correlation_id = %envelope.correlation_id(),
                    "Inbound dispatcher has stopped, dropping message"
                );
                false
            }
        }
    }
}
