//! Per-destination publish/subscribe message bus.
//!
//! Every node (agents and the coordinator alike) owns one destination named
//! after its identity. Deliveries on a destination are totally ordered and
//! addressed by offset, so a consumer that restarts from a checkpointed
//! offset sees a bounded window of redelivered messages.
//!
//! # Components
//!
//! - [`Transport`]: the publish/subscribe contract
//! - [`MemoryTransport`]: in-process log, also backing the gRPC broker
//! - [`GrpcTransport`]: client of a remote broker
//! - [`OffsetCheckpoint`]: periodic persistence of the read position
//! - [`consume`]: the subscribe/handle/resubscribe loop shared by agents and
//!   the coordinator

pub mod grpc;
pub mod memory;
pub mod offset;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use grpc::GrpcTransport;
pub use memory::MemoryTransport;
pub use offset::OffsetCheckpoint;

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// One message read from a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Ordered stream of deliveries for one destination.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { rx }
    }

    /// Next delivery, or `None` once the underlying channel is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn into_inner(self) -> mpsc::UnboundedReceiver<Delivery> {
        self.rx
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Append `payload` to `destination`, returning its offset.
    async fn publish(&self, destination: &str, payload: Vec<u8>) -> Result<u64>;

    /// Read `destination` from `from_offset` onwards, following new messages.
    async fn subscribe(&self, destination: &str, from_offset: u64) -> Result<Subscription>;
}

/// Receiver side of [`consume`].
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, delivery: &Delivery);
}

/// Consume `destination` until `shutdown` fires.
///
/// Each delivery is handled to completion before the next one is read, and
/// the checkpoint only advances past a delivery once it has been handled. A
/// closed subscription is re-opened from the current checkpoint.
pub async fn consume(
    transport: &dyn Transport,
    destination: &str,
    checkpoint: &OffsetCheckpoint,
    handler: &dyn DeliveryHandler,
    shutdown: CancellationToken,
) {
    loop {
        let from_offset = checkpoint.position();
        match transport.subscribe(destination, from_offset).await {
            Ok(mut subscription) => {
                tracing::info!(destination, from_offset, "Subscribed");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        delivery = subscription.next() => match delivery {
                            Some(delivery) => {
                                handler.on_delivery(&delivery).await;
                                checkpoint.advance(delivery.offset);
                            }
                            None => {
                                tracing::warn!(destination, "Subscription closed, resubscribing");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(destination, error = %e, "Subscribe failed");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
        }
    }
}
