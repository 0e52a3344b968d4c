//! JSON-RPC server exposing the results server to judging devices, stage
//! displays, and the tabulation desk.
//!
//! Implements [`FeisRpcServer`] over a shared [`Node`]. Library errors map
//! to the error codes in [`feis_sync::protocol`].

use std::net::SocketAddr;
use std::sync::Arc;

use jsonrpsee::core::{SubscriptionResult, async_trait};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::{PendingSubscriptionSink, SubscriptionMessage};
use jsonrpsee::types::ErrorObjectOwned;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use feis_core::error::{FeisError, LedgerError, RecallError, RosterError};
use feis_core::types::{CompetitionId, CorrectionRecord, RoundId, SyncConflict};
use feis_sync::api::FeisRpcServer;
use feis_sync::broadcast::RoundFeed;
use feis_sync::protocol::{
    BatchItemReceipt, CorrectionRequest, ERR_INTERNAL, ERR_INVALID_SCORE, ERR_NOT_FOUND,
    ERR_RECALL_STATE, PresenceRequest, RecallRequest, RecallView, ResolveRequest,
    ScoreSubmission, SubmitReceipt,
};
use feis_tabulate::results::RoundResults;

use crate::node::Node;

/// Create a JSON-RPC error object.
fn rpc_error(code: i32, msg: &str) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, msg.to_string(), None::<()>)
}

/// Classify a library error for the wire.
fn error_code(e: &FeisError) -> i32 {
    match e {
        FeisError::Ledger(LedgerError::CellNotFound(_) | LedgerError::ConflictNotFound(_)) => {
            ERR_NOT_FOUND
        }
        FeisError::Ledger(_) => ERR_INVALID_SCORE,
        FeisError::Roster(RosterError::UnknownRound(_) | RosterError::UnknownCompetition(_)) => {
            ERR_NOT_FOUND
        }
        FeisError::Roster(_) => ERR_INVALID_SCORE,
        FeisError::Recall(RecallError::NoRounds { .. }) => ERR_NOT_FOUND,
        FeisError::Recall(_) => ERR_RECALL_STATE,
        FeisError::Tabulation(_) | FeisError::Sync(_) | FeisError::Storage(_) => ERR_INTERNAL,
    }
}

fn to_rpc(e: FeisError) -> ErrorObjectOwned {
    let code = error_code(&e);
    if code == ERR_INTERNAL {
        warn!(error = %e, "rpc call failed");
    }
    rpc_error(code, &e.to_string())
}

/// JSON-RPC server implementation backed by a [`Node`].
pub struct RpcServerImpl {
    node: Arc<Node>,
}

impl RpcServerImpl {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl FeisRpcServer for RpcServerImpl {
    async fn submit_score(
        &self,
        submission: ScoreSubmission,
    ) -> Result<SubmitReceipt, ErrorObjectOwned> {
        self.node.submit_score(submission).map_err(to_rpc)
    }

    async fn submit_batch(
        &self,
        batch: Vec<ScoreSubmission>,
    ) -> Result<Vec<BatchItemReceipt>, ErrorObjectOwned> {
        self.node.submit_batch(batch).map_err(to_rpc)
    }

    async fn get_round_results(&self, round_id: RoundId) -> Result<RoundResults, ErrorObjectOwned> {
        self.node
            .round_results(round_id)
            .map(|r| r.as_ref().clone())
            .map_err(to_rpc)
    }

    async fn get_recall(
        &self,
        competition_id: CompetitionId,
        through_round: u32,
    ) -> Result<RecallView, ErrorObjectOwned> {
        self.node
            .recall(competition_id, through_round)
            .map_err(to_rpc)
    }

    async fn publish_recall(&self, request: RecallRequest) -> Result<RecallView, ErrorObjectOwned> {
        self.node.publish_recall(&request).map_err(to_rpc)
    }

    async fn reopen_recall(&self, request: RecallRequest) -> Result<RecallView, ErrorObjectOwned> {
        self.node.reopen_recall(&request).map_err(to_rpc)
    }

    async fn correct_score(
        &self,
        request: CorrectionRequest,
    ) -> Result<CorrectionRecord, ErrorObjectOwned> {
        self.node.correct_score(request).map_err(to_rpc)
    }

    async fn list_conflicts(
        &self,
        round_id: Option<RoundId>,
    ) -> Result<Vec<SyncConflict>, ErrorObjectOwned> {
        self.node.conflicts(round_id).map_err(to_rpc)
    }

    async fn resolve_conflict(
        &self,
        request: ResolveRequest,
    ) -> Result<CorrectionRecord, ErrorObjectOwned> {
        self.node.resolve_conflict(request).map_err(to_rpc)
    }

    async fn list_corrections(
        &self,
        round_id: RoundId,
    ) -> Result<Vec<CorrectionRecord>, ErrorObjectOwned> {
        self.node.corrections(round_id).map_err(to_rpc)
    }

    async fn set_presence(&self, request: PresenceRequest) -> Result<RoundResults, ErrorObjectOwned> {
        self.node
            .set_presence(request)
            .map(|r| r.as_ref().clone())
            .map_err(to_rpc)
    }

    async fn subscribe_round(
        &self,
        pending: PendingSubscriptionSink,
        round_id: RoundId,
    ) -> SubscriptionResult {
        let (mut rx, current) = match self.node.subscribe(round_id) {
            Ok(sub) => sub,
            Err(e) => {
                pending.reject(to_rpc(e)).await;
                return Ok(());
            }
        };
        let sink = pending.accept().await?;
        debug!(round = %round_id, "results subscription opened");

        let mut feed = RoundFeed::new();
        let first = feed.snapshot(current.as_ref().clone());
        sink.send(SubscriptionMessage::from_json(&first)?).await?;

        loop {
            tokio::select! {
                _ = sink.closed() => break,
                update = rx.recv() => match update {
                    Ok(results) => {
                        if let Some(msg) = feed.changed(&results) {
                            sink.send(SubscriptionMessage::from_json(&msg)?).await?;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // Increments were lost; start the subscriber over.
                        warn!(round = %round_id, missed, "subscriber lagged, resending snapshot");
                        let fresh = self.node.round_results(round_id)?;
                        let msg = feed.snapshot(fresh.as_ref().clone());
                        sink.send(SubscriptionMessage::from_json(&msg)?).await?;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!(round = %round_id, "results subscription closed");
        Ok(())
    }
}

/// Start the JSON-RPC server (HTTP and WebSocket) on the given address.
///
/// Returns the bound address (useful with port 0) and a [`ServerHandle`]
/// that can be used to stop the server.
pub async fn start_rpc_server(
    addr: &str,
    node: Arc<Node>,
) -> Result<(SocketAddr, ServerHandle), FeisError> {
    let server = Server::builder()
        .build(addr)
        .await
        .map_err(|e| FeisError::Storage(format!("RPC server error: {e}")))?;
    let local = server
        .local_addr()
        .map_err(|e| FeisError::Storage(format!("RPC server error: {e}")))?;

    let rpc_impl = RpcServerImpl::new(node);
    let handle = server.start(rpc_impl.into_rpc());
    info!(%local, "RPC server started");
    Ok((local, handle))
}
