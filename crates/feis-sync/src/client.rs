//! WebSocket JSON-RPC connection to a results server.

use jsonrpsee::core::client::Error as ClientError;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use tracing::debug;

use feis_core::error::SyncError;

use crate::api::FeisRpcClient;
use crate::outbox::RemoteLedger;
use crate::protocol::{BatchItemReceipt, ScoreSubmission, SubmitReceipt};

fn transport(e: ClientError) -> SyncError {
    match e {
        ClientError::Call(obj) => SyncError::Rejected(obj.message().to_string()),
        ClientError::RequestTimeout => SyncError::Timeout,
        other => SyncError::Transport(other.to_string()),
    }
}

/// Server connection usable both as a [`RemoteLedger`] and, through
/// [`RpcRemote::client`], for queries and subscriptions.
pub struct RpcRemote {
    client: WsClient,
}

impl RpcRemote {
    /// Connect to `url` (e.g. `ws://127.0.0.1:18432`).
    pub async fn connect(url: &str) -> Result<Self, SyncError> {
        let client = WsClientBuilder::default()
            .build(url)
            .await
            .map_err(transport)?;
        debug!(url, "connected to results server");
        Ok(Self { client })
    }

    pub fn client(&self) -> &WsClient {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}

impl RemoteLedger for RpcRemote {
    async fn submit(&self, submission: ScoreSubmission) -> Result<SubmitReceipt, SyncError> {
        FeisRpcClient::submit_score(&self.client, submission)
            .await
            .map_err(transport)
    }

    async fn submit_batch(
        &self,
        batch: Vec<ScoreSubmission>,
    ) -> Result<Vec<BatchItemReceipt>, SyncError> {
        FeisRpcClient::submit_batch(&self.client, batch)
            .await
            .map_err(transport)
    }
}
