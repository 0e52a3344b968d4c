//! # feis-sync: Moving scores and results between devices and the server.
//!
//! - **Protocol**: JSON-RPC request/response types and the [`FeisRpc`]
//!   interface shared by the server and the judging client.
//! - **Broadcast**: per-round fan-out of full results replacements; every
//!   subscriber starts from a snapshot.
//! - **Session**: the client's `Disconnected -> Connected -> Subscribed`
//!   state machine.
//! - **Outbox**: a device's local ledger of unacknowledged scores and the
//!   router that decides which ledger is authoritative.

pub mod api;
pub mod broadcast;
pub mod client;
pub mod outbox;
pub mod protocol;
pub mod session;

pub use api::{FeisRpcClient, FeisRpcServer};
pub use broadcast::{RoundBroadcaster, RoundFeed};
pub use client::RpcRemote;
pub use outbox::{
    AckStore, Authority, MemoryAckStore, Outbox, ReconcileReport, RemoteLedger, SubmitOutcome,
    SubmitRouter,
};
pub use protocol::{
    BatchItemReceipt, ItemStatus, MessageKind, RecallView, ResultsMessage, ScoreSubmission,
    SubmitReceipt,
};
pub use session::{SessionAction, SessionManager, SessionState};
