//! The Feis JSON-RPC interface.
//!
//! Generates `FeisRpcServer` (implemented by feis-node) and `FeisRpcClient`
//! (used by the judging device over WebSocket).

use jsonrpsee::core::SubscriptionResult;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;

use feis_core::types::{CompetitionId, CorrectionRecord, RoundId, SyncConflict};
use feis_tabulate::results::RoundResults;

use crate::protocol::{
    BatchItemReceipt, CorrectionRequest, PresenceRequest, RecallRequest, RecallView,
    ResolveRequest, ResultsMessage, ScoreSubmission, SubmitReceipt,
};

#[rpc(server, client)]
pub trait FeisRpc {
    /// Records one live score. Invalid submissions come back as a rejected
    /// receipt rather than an error.
    #[method(name = "submitscore")]
    async fn submit_score(
        &self,
        submission: ScoreSubmission,
    ) -> Result<SubmitReceipt, ErrorObjectOwned>;

    /// Reconciles a device's offline scores; one receipt per item, in order.
    #[method(name = "submitbatch")]
    async fn submit_batch(
        &self,
        batch: Vec<ScoreSubmission>,
    ) -> Result<Vec<BatchItemReceipt>, ErrorObjectOwned>;

    /// Current ranked results of a round.
    #[method(name = "getroundresults")]
    async fn get_round_results(&self, round_id: RoundId) -> Result<RoundResults, ErrorObjectOwned>;

    /// Recall for a competition through the given round sequence.
    #[method(name = "getrecall")]
    async fn get_recall(
        &self,
        competition_id: CompetitionId,
        through_round: u32,
    ) -> Result<RecallView, ErrorObjectOwned>;

    /// Freezes the current recall sheet.
    #[method(name = "publishrecall")]
    async fn publish_recall(&self, request: RecallRequest) -> Result<RecallView, ErrorObjectOwned>;

    /// Unfreezes a published recall sheet; the reopen is logged.
    #[method(name = "reopenrecall")]
    async fn reopen_recall(&self, request: RecallRequest) -> Result<RecallView, ErrorObjectOwned>;

    /// Audited administrative overwrite or removal of one score.
    #[method(name = "correctscore")]
    async fn correct_score(
        &self,
        request: CorrectionRequest,
    ) -> Result<CorrectionRecord, ErrorObjectOwned>;

    /// Open sync conflicts, optionally limited to one round.
    #[method(name = "listconflicts")]
    async fn list_conflicts(
        &self,
        round_id: Option<RoundId>,
    ) -> Result<Vec<SyncConflict>, ErrorObjectOwned>;

    #[method(name = "resolveconflict")]
    async fn resolve_conflict(
        &self,
        request: ResolveRequest,
    ) -> Result<CorrectionRecord, ErrorObjectOwned>;

    /// Correction and resolution audit trail of a round.
    #[method(name = "listcorrections")]
    async fn list_corrections(
        &self,
        round_id: RoundId,
    ) -> Result<Vec<CorrectionRecord>, ErrorObjectOwned>;

    /// Check-in: mark an entered competitor present, absent, or no-show.
    #[method(name = "setpresence")]
    async fn set_presence(&self, request: PresenceRequest) -> Result<RoundResults, ErrorObjectOwned>;

    /// Live results of a round: a snapshot first, then full replacements.
    #[subscription(name = "subscriberound" => "roundresults", unsubscribe = "unsubscriberound", item = ResultsMessage)]
    async fn subscribe_round(&self, round_id: RoundId) -> SubscriptionResult;
}
