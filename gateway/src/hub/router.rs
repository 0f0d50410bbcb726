use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use peerview_ws_proto::ServerEvent;
use tokio::sync::mpsc::error::SendTimeoutError;

use super::registry::{Connection, Registry};
use super::HubError;

/// Who receives a broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Audience<'a> {
    Everyone,
    AllExcept(&'a str),
}

#[derive(Clone, Debug)]
pub struct Recipient {
    pub identity: String,
    pub connection: Connection,
}

/// A delivery that failed, the recipient gets unregistered.
#[derive(Debug)]
pub struct Undelivered {
    pub recipient: Recipient,
    pub error: HubError,
}

/// Fans events out to the current participants.
///
/// Every recipient is served independently, bounded by the delivery timeout: a
/// dead or slow peer shows up in the returned failures and never stalls the rest.
#[derive(Clone, Debug)]
pub struct Router {
    delivery_timeout: Duration,
}

impl Router {
    pub fn new(delivery_timeout: Duration) -> Self {
        Self { delivery_timeout }
    }

    /// Recipients registered right now, taken while the caller holds the registry.
    pub fn recipients(&self, registry: &Registry, audience: Audience<'_>) -> Vec<Recipient> {
        registry
            .participants()
            .filter(|p| match audience {
                Audience::Everyone => true,
                Audience::AllExcept(excluded) => p.identity() != excluded,
            })
            .map(|p| Recipient {
                identity: p.identity().to_owned(),
                connection: p.connection().clone(),
            })
            .collect()
    }

    pub async fn deliver(
        &self,
        recipients: Vec<Recipient>,
        event: Arc<ServerEvent>,
    ) -> Vec<Undelivered> {
        let kind: &'static str = event.as_ref().into();
        let deliveries = recipients.into_iter().map(|recipient| {
            let event = event.clone();
            async move {
                let res = recipient
                    .connection
                    .sender()
                    .send_timeout(event, self.delivery_timeout)
                    .await;
                match res {
                    Ok(()) => None,
                    Err(e) => {
                        let reason = match e {
                            SendTimeoutError::Timeout(_) => "timed out",
                            SendTimeoutError::Closed(_) => "channel closed",
                        };
                        tracing::warn!(
                            recipient = %recipient.identity,
                            event = kind,
                            "delivery failed: {}",
                            reason
                        );
                        let error = HubError::DeliveryFailure {
                            identity: recipient.identity.clone(),
                            reason,
                        };
                        Some(Undelivered { recipient, error })
                    }
                }
            }
        });
        join_all(deliveries).await.into_iter().flatten().collect()
    }
}
