//! Valuation oracle client
//!
//! The oracle (the trading service) owns every non-monetary leg. This bank
//! asks it for a vote on proposals containing such legs and notifies it when
//! they commit.

use crate::protocol::{Envelope, MessageType, Transaction, Vote};
use crate::transport::PeerTransport;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// External valuation service
#[async_trait]
pub trait ValuationOracle: Send + Sync {
    /// Vote on a proposal; the result is passed to the proposer as is
    async fn vote(&self, proposal: &Envelope<Transaction>) -> Result<Vote>;

    /// Tell the oracle a proposal it voted on has committed
    async fn notify_commit(&self, proposal: &Envelope<Transaction>) -> Result<()>;
}

/// Oracle reached over HTTP
pub struct HttpOracle {
    transport: Arc<dyn PeerTransport>,
    url: String,
}

impl HttpOracle {
    /// Oracle at `url`
    pub fn new(transport: Arc<dyn PeerTransport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
        }
    }

    async fn send(&self, envelope: &Envelope<Transaction>) -> Result<String> {
        let body = serde_json::to_string(envelope)?;
        let reply = self
            .transport
            .post(&self.url, None, body)
            .await
            .map_err(|e| Error::OracleUnreachable(e.to_string()))?;

        debug!(
            status = reply.status,
            message_type = %envelope.message_type,
            "Oracle replied"
        );

        if !reply.is_success() {
            return Err(Error::OracleUnreachable(format!(
                "{} returned HTTP {}",
                self.url, reply.status
            )));
        }
        Ok(reply.body)
    }
}

#[async_trait]
impl ValuationOracle for HttpOracle {
    async fn vote(&self, proposal: &Envelope<Transaction>) -> Result<Vote> {
        let body = self.send(proposal).await?;
        serde_json::from_str(&body)
            .map_err(|e| Error::OracleUnreachable(format!("unreadable vote: {}", e)))
    }

    async fn notify_commit(&self, proposal: &Envelope<Transaction>) -> Result<()> {
        let notification = Envelope {
            idempotence_key: proposal.idempotence_key.clone(),
            message_type: MessageType::CommitTx,
            message: proposal.message.clone(),
        };
        self.send(&notification).await.map(|_| ())
    }
}
