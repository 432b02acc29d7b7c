use async_trait::async_trait;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};

use crate::error::{OrcaError, Result};
use crate::proto::broker_client::BrokerClient;
use crate::proto::{PublishRequest, SubscribeRequest};
use crate::transport::{Delivery, Subscription, Transport};

/// Transport backed by a remote broker speaking the `orca.Broker` service.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    client: BrokerClient<Channel>,
}

impl GrpcTransport {
    /// Connect to the broker at `addr` (`http://host:port` or `host:port`).
    pub async fn connect(addr: &str) -> Result<Self> {
        let uri = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| OrcaError::Transport(format!("Invalid broker address {}: {}", addr, e)))?;
        let channel = endpoint.connect().await?;

        Ok(Self {
            client: BrokerClient::new(channel),
        })
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn publish(&self, destination: &str, payload: Vec<u8>) -> Result<u64> {
        let mut client = self.client.clone();
        let response = client
            .publish(PublishRequest {
                destination: destination.to_string(),
                payload,
            })
            .await?;
        Ok(response.into_inner().offset)
    }

    async fn subscribe(&self, destination: &str, from_offset: u64) -> Result<Subscription> {
        let mut client = self.client.clone();
        let mut stream = client
            .subscribe(SubscribeRequest {
                destination: destination.to_string(),
                from_offset,
            })
            .await?
            .into_inner();

        let (tx, rx) = mpsc::unbounded_channel();
        let destination = destination.to_string();
        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(delivery)) => {
                        let delivery = Delivery {
                            offset: delivery.offset,
                            payload: delivery.payload,
                        };
                        if tx.send(delivery).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        tracing::warn!(destination = %destination, error = %status, "Broker stream failed");
                        break;
                    }
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}
