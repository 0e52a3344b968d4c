//! feis-judge: Command-line judging device for Feis.
//!
//! Records marks in a local RocksDB ledger first, forwards them to the
//! results server while it is reachable, and reconciles the backlog after
//! an outage. Also prints and follows live round results.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use feis_core::constants::DEFAULT_SUBMIT_TIMEOUT_MS;
use feis_core::types::{CompetitorId, JudgeId, Mark, OriginId, RoundId, ScoreKey, now_ms};
use feis_node_lib::logging::init_logging;
use feis_node_lib::storage::RocksLedger;
use feis_sync::api::FeisRpcClient;
use feis_sync::outbox::{Outbox, SubmitOutcome, SubmitRouter};
use feis_sync::protocol::ItemStatus;
use feis_sync::session::{SessionAction, SessionManager};
use feis_sync::RpcRemote;
use feis_tabulate::results::RoundResults;

/// Pause between reconnection attempts while watching.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Feis judging device.
#[derive(Parser)]
#[command(name = "feis-judge")]
#[command(version, about = "Record, sync, and follow Feis marks from a judging device")]
struct Cli {
    /// Device data directory (default: <data dir>/feis-judge).
    #[arg(long, env = "FEIS_JUDGE_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Results server WebSocket URL.
    #[arg(long, env = "FEIS_SERVER_URL", default_value = "ws://127.0.0.1:18432", global = true)]
    server_url: String,

    /// Name of this device; every mark it records carries it.
    #[arg(long, env = "FEIS_ORIGIN", default_value = "tablet", global = true)]
    origin: String,

    /// How long to wait for the server before keeping a mark local.
    #[arg(long, env = "FEIS_SUBMIT_TIMEOUT_MS", default_value_t = DEFAULT_SUBMIT_TIMEOUT_MS, global = true)]
    submit_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Log output format ("text" or "json").
    #[arg(long, default_value = "text", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a mark locally and send it to the server if reachable.
    Submit(SubmitArgs),
    /// Send every unacknowledged mark to the server.
    Sync,
    /// Print the current results of a round.
    Results(RoundArgs),
    /// Follow a round's results live, reconnecting as needed.
    Watch(RoundArgs),
    /// List marks the server has not acknowledged yet.
    Pending,
}

#[derive(Args)]
struct SubmitArgs {
    #[arg(short, long)]
    round: u64,

    #[arg(short, long)]
    competitor: u64,

    #[arg(short, long)]
    judge: u64,

    /// Raw mark, 0 to 100.
    #[arg(short, long)]
    mark: f64,
}

#[derive(Args)]
struct RoundArgs {
    round: u64,

    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("feis-judge")
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    fn open_outbox(&self) -> Result<Outbox> {
        let dir = self.data_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let ledger = Arc::new(
            RocksLedger::open(dir.join("ledger")).context("failed to open device ledger")?,
        );
        Ok(Outbox::new(OriginId::new(&self.origin), ledger.clone(), ledger)?)
    }

    async fn connect(&self) -> Result<RpcRemote> {
        match tokio::time::timeout(self.timeout(), RpcRemote::connect(&self.server_url)).await {
            Ok(Ok(remote)) => Ok(remote),
            Ok(Err(e)) => bail!("cannot reach {}: {e}", self.server_url),
            Err(_) => bail!("timed out connecting to {}", self.server_url),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, &cli.log_format);

    match &cli.command {
        Commands::Submit(args) => submit(&cli, args).await,
        Commands::Sync => sync(&cli).await,
        Commands::Results(args) => results(&cli, args).await,
        Commands::Watch(args) => watch(&cli, args).await,
        Commands::Pending => pending(&cli),
    }
}

async fn submit(cli: &Cli, args: &SubmitArgs) -> Result<()> {
    let key = ScoreKey::new(
        RoundId(args.round),
        CompetitorId(args.competitor),
        JudgeId(args.judge),
    );
    let outbox = cli.open_outbox()?;
    let now = now_ms();

    let remote = match cli.connect().await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(error = %e, "server unreachable, keeping mark local");
            let score = outbox.record(key, Mark::new(args.mark)?, now)?;
            println!("{key}: stored locally as #{} (pending sync)", score.sequence);
            return Ok(());
        }
    };

    let router = SubmitRouter::new(outbox, remote, cli.timeout());
    // Clear any backlog first; the server only becomes authoritative once
    // nothing older is pending.
    if let Err(e) = router.reconcile().await {
        warn!(error = %e, "backlog not reconciled");
    }

    match router.submit(key, args.mark, now).await? {
        SubmitOutcome::Confirmed(receipt) => {
            println!(
                "{key}: accepted (results revision {})",
                receipt.revision.unwrap_or_default()
            );
        }
        SubmitOutcome::Rejected(receipt) => {
            bail!(
                "{key}: rejected: {}",
                receipt.reason.unwrap_or_else(|| "no reason given".into())
            );
        }
        SubmitOutcome::Local => println!("{key}: stored locally (pending sync)"),
        SubmitOutcome::Unknown => {
            println!("{key}: server did not answer in time; stored locally (pending sync)")
        }
    }
    Ok(())
}

async fn sync(cli: &Cli) -> Result<()> {
    let outbox = cli.open_outbox()?;
    let remote = cli.connect().await?;
    let router = SubmitRouter::new(outbox, remote, cli.timeout());
    let report = router.reconcile().await.context("reconciliation failed")?;

    if report.sent == 0 {
        println!("nothing to sync");
        return Ok(());
    }
    for receipt in &report.receipts {
        let status = match receipt.status {
            ItemStatus::Applied => "applied",
            ItemStatus::Unchanged => "unchanged",
            ItemStatus::Stale => "stale",
            ItemStatus::Conflict => "conflict",
            ItemStatus::Rejected => "rejected",
        };
        match &receipt.reason {
            Some(reason) => println!("{}\t{status}\t{reason}", receipt.key),
            None => println!("{}\t{status}", receipt.key),
        }
    }
    println!(
        "sent {}: {} applied, {} unchanged, {} stale, {} conflicts, {} rejected",
        report.sent,
        report.applied,
        report.unchanged,
        report.stale,
        report.conflicts,
        report.rejected
    );
    Ok(())
}

async fn results(cli: &Cli, args: &RoundArgs) -> Result<()> {
    let remote = cli.connect().await?;
    let results = FeisRpcClient::get_round_results(remote.client(), RoundId(args.round))
        .await
        .context("getroundresults failed")?;
    render(&results, args.json)
}

async fn watch(cli: &Cli, args: &RoundArgs) -> Result<()> {
    tokio::select! {
        res = follow_forever(cli, args) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("stopped watching");
            Ok(())
        }
    }
}

/// Keep a subscription to the round alive across disconnects.
async fn follow_forever(cli: &Cli, args: &RoundArgs) -> Result<()> {
    let mut session = SessionManager::new(RoundId(args.round));
    loop {
        let remote = match cli.connect().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "reconnecting");
                session.on_disconnected();
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let mut action = session.on_connected();
        while let SessionAction::Subscribe(round) | SessionAction::Resubscribe(round) = action {
            action = follow(&remote, &mut session, round, args.json).await?;
        }
        session.on_disconnected();
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Run one subscription until it ends. Returns what the session should
/// do next.
async fn follow(
    remote: &RpcRemote,
    session: &mut SessionManager,
    round: RoundId,
    json: bool,
) -> Result<SessionAction> {
    let mut sub = match FeisRpcClient::subscribe_round(remote.client(), round).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(%round, error = %e, "subscription refused");
            return Ok(SessionAction::Connect);
        }
    };
    session.on_subscribed();

    while let Some(item) = sub.next().await {
        match item {
            Ok(msg) => match session.on_message(msg) {
                SessionAction::Render => {
                    if let Some(view) = session.view() {
                        render(view, json)?;
                    }
                }
                SessionAction::Resubscribe(round) => return Ok(SessionAction::Resubscribe(round)),
                _ => {}
            },
            Err(e) => {
                warn!(%round, error = %e, "unreadable results message");
                return Ok(SessionAction::Resubscribe(round));
            }
        }
    }
    Ok(SessionAction::Connect)
}

fn pending(cli: &Cli) -> Result<()> {
    let outbox = cli.open_outbox()?;
    let pending = outbox.pending()?;
    if pending.is_empty() {
        println!("no pending marks");
        return Ok(());
    }
    for score in &pending {
        println!(
            "{}\t{}\t#{}\t{}",
            score.key, score.mark, score.sequence, score.timestamp_ms
        );
    }
    println!("{} pending", pending.len());
    Ok(())
}

fn render(results: &RoundResults, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }
    let status = if results.provisional() {
        "PROVISIONAL"
    } else {
        "final"
    };
    println!(
        "round {} (revision {}, {} of {} judges, {status})",
        results.round,
        results.revision,
        results.judge_count,
        results.panel_size.judges()
    );
    for row in &results.rows {
        println!("{:>4}  {:>8}  {:>8.2}", row.rank, row.competitor.0, row.points.as_f64());
    }
    Ok(())
}
