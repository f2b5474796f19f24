//! A minimal blocking client for the mosaic coordinator.
//!
//! One query per call: the client sends `QUERY`, waits for the coordinator's
//! referral (or error), then connects to the referred node's delivery
//! service and streams the payload.

use std::time::Duration;

use mo_cube::QueryRect;
use mo_types::{BaseRequest, CacheType, DeliveryResponse, SemanticId};
use mo_wire::{ClientMsg, DeliveryMsg, Framed, WireError, MAGIC_CLIENT, MAGIC_DELIVERY};

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The coordinator answered with an error (producer failures arrive
    /// here verbatim).
    #[error("query failed: {0}")]
    Query(String),

    /// The referred delivery could not be fetched.
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// A connection to the coordinator's client port.
pub struct CacheClient {
    host: String,
    port: u16,
    /// How long to wait for the coordinator's answer; producing a miss can
    /// take however long the producer takes.
    pub response_timeout: Duration,
}

impl CacheClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            response_timeout: Duration::from_secs(60),
        }
    }

    /// Runs one query end to end and returns the payload bytes.
    pub fn query_bytes(
        &self,
        cache_type: CacheType,
        semantic_id: &SemanticId,
        rect: QueryRect,
    ) -> Result<Vec<u8>, ClientError> {
        let referral = self.query_referral(cache_type, semantic_id, rect)?;
        log::debug!("client: referred to {referral}");
        fetch_delivery(&referral)
    }

    /// The query half only: where the result can be picked up.
    pub fn query_referral(
        &self,
        cache_type: CacheType,
        semantic_id: &SemanticId,
        rect: QueryRect,
    ) -> Result<DeliveryResponse, ClientError> {
        let mut framed = Framed::connect((self.host.as_str(), self.port), MAGIC_CLIENT)?;
        let request = BaseRequest::new(cache_type, semantic_id.clone(), rect);
        ClientMsg::Query(request).send(&mut framed)?;

        let deadline = std::time::Instant::now() + self.response_timeout;
        loop {
            match ClientMsg::recv(&mut framed, Duration::from_millis(200)) {
                Ok(ClientMsg::Delivery(response)) => return Ok(response),
                Ok(ClientMsg::Error(message)) => return Err(ClientError::Query(message)),
                Ok(other) => {
                    return Err(ClientError::Wire(WireError::protocol(format!(
                        "unexpected response {other:?}"
                    ))));
                }
                Err(WireError::Timeout) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(ClientError::Wire(WireError::Timeout));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Streams a referred delivery from its node.
pub fn fetch_delivery(referral: &DeliveryResponse) -> Result<Vec<u8>, ClientError> {
    let mut framed = Framed::connect((referral.host.as_str(), referral.port), MAGIC_DELIVERY)?;
    DeliveryMsg::Get(referral.delivery_id).send(&mut framed)?;
    match DeliveryMsg::recv(&mut framed, mo_wire::DELIVERY_TIMEOUT)? {
        DeliveryMsg::Payload(payload) => Ok(payload),
        DeliveryMsg::Error(message) => Err(ClientError::Delivery(message)),
        other => Err(ClientError::Wire(WireError::protocol(format!(
            "unexpected delivery response {other:?}"
        )))),
    }
}
