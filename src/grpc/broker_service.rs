use std::pin::Pin;

use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};

use crate::proto::broker_server::Broker;
use crate::proto::{Delivery, PublishRequest, PublishResponse, SubscribeRequest};
use crate::transport::{MemoryTransport, Transport};

type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, Status>> + Send>>;

/// gRPC face of an in-memory destination log.
pub struct BrokerService {
    log: MemoryTransport,
}

impl BrokerService {
    pub fn new(log: MemoryTransport) -> Self {
        Self { log }
    }
}

#[tonic::async_trait]
impl Broker for BrokerService {
    type SubscribeStream = DeliveryStream;

    async fn publish(
        &self,
        request: Request<PublishRequest>,
    ) -> Result<Response<PublishResponse>, Status> {
        let req = request.into_inner();
        if req.destination.is_empty() {
            return Err(Status::invalid_argument("destination is required"));
        }

        let offset = self.log.publish(&req.destination, req.payload).await?;
        tracing::trace!(destination = %req.destination, offset, "Published");
        Ok(Response::new(PublishResponse { offset }))
    }

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let req = request.into_inner();
        if req.destination.is_empty() {
            return Err(Status::invalid_argument("destination is required"));
        }

        tracing::debug!(
            destination = %req.destination,
            from_offset = req.from_offset,
            "Subscriber attached"
        );
        let subscription = self.log.subscribe(&req.destination, req.from_offset).await?;
        let stream = UnboundedReceiverStream::new(subscription.into_inner()).map(|d| {
            Ok(Delivery {
                offset: d.offset,
                payload: d.payload,
            })
        });

        Ok(Response::new(Box::pin(stream) as Self::SubscribeStream))
    }
}
