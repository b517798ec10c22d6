use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use huddle_core::{
    AppAction, AppReconciler, AppUpdate, CallPhase, CallRole, CallState, FfiApp,
    HttpTokenProvider, InMemorySignalingStore, TokenProvider,
};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "huddle-cli")]
#[command(about = "Drive huddle call sessions from the command line")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Side {
    Caller,
    Callee,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a caller and a callee in-process over the loopback engine and print
    /// each milestone as a JSON line
    Simulate {
        /// How long to stay connected before hanging up
        #[arg(long, default_value_t = 3)]
        hold_secs: u64,

        /// Which side ends the call
        #[arg(long, value_enum, default_value_t = Side::Caller)]
        hangup: Side,

        /// The callee declines instead of accepting
        #[arg(long, conflicts_with = "no_answer")]
        decline: bool,

        /// The callee never answers; the call ends by ring timeout
        #[arg(long)]
        no_answer: bool,

        #[arg(long, default_value_t = 30_000)]
        ring_timeout_ms: u64,
    },

    /// Fetch a join token from a token endpoint
    Token {
        #[arg(long, env = "HUDDLE_TOKEN_ENDPOINT")]
        endpoint: String,

        #[arg(long)]
        channel: String,

        #[arg(long)]
        uid: u32,

        #[arg(long, default_value = "publisher")]
        role: String,

        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Simulate {
            hold_secs,
            hangup,
            decline,
            no_answer,
            ring_timeout_ms,
        } => {
            let answer = match (decline, no_answer) {
                (true, _) => Answer::Decline,
                (_, true) => Answer::None,
                _ => Answer::Accept,
            };
            cmd_simulate(hold_secs, hangup, answer, ring_timeout_ms).await
        }
        Command::Token {
            endpoint,
            channel,
            uid,
            role,
            timeout_ms,
        } => cmd_token(&endpoint, &channel, uid, &role, timeout_ms).await,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn print(v: serde_json::Value) {
    println!("{}", serde_json::to_string(&v).expect("json encode"));
}

struct Collector(Arc<Mutex<Vec<AppUpdate>>>);

impl AppReconciler for Collector {
    fn reconcile(&self, update: AppUpdate) {
        if let Ok(mut updates) = self.0.lock() {
            updates.push(update);
        }
    }
}

/// One in-process app with its own data dir.
struct Peer {
    app: Arc<FfiApp>,
    updates: Arc<Mutex<Vec<AppUpdate>>>,
    _dir: tempfile::TempDir,
}

impl Peer {
    fn open(ring_timeout_ms: u64) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir().context("create data dir")?;
        let config = json!({
            "disable_network": true,
            "call_audio_backend": "loopback",
            "ring_timeout_ms": ring_timeout_ms,
        });
        std::fs::write(
            dir.path().join("huddle_config.json"),
            serde_json::to_vec(&config)?,
        )
        .context("write config")?;

        let app = FfiApp::new(dir.path().to_string_lossy().to_string());
        let updates = Arc::new(Mutex::new(Vec::new()));
        app.listen_for_updates(Box::new(Collector(updates.clone())));
        Ok(Self {
            app,
            updates,
            _dir: dir,
        })
    }

    fn call(&self) -> Option<CallState> {
        self.app.state().active_call
    }

    fn closed(&self) -> Option<(String, u64)> {
        let updates = self.updates.lock().ok()?;
        updates.iter().find_map(|u| match u {
            AppUpdate::CallClosed {
                reason,
                duration_secs,
                ..
            } => Some((reason.clone(), *duration_secs)),
            _ => None,
        })
    }
}

async fn wait_for<T>(
    what: &str,
    timeout: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> anyhow::Result<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(v) = f() {
            return Ok(v);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("{what}: not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Answer {
    Accept,
    Decline,
    None,
}

async fn cmd_simulate(
    hold_secs: u64,
    hangup: Side,
    answer: Answer,
    ring_timeout_ms: u64,
) -> anyhow::Result<()> {
    let caller = Peer::open(ring_timeout_ms)?;
    let callee = Peer::open(ring_timeout_ms)?;
    let call_id = format!("call-{}", uuid::Uuid::new_v4());
    let channel_id = format!("room-{}", uuid::Uuid::new_v4());
    let step = Duration::from_secs(10);

    caller.app.dispatch(AppAction::PlaceCall {
        call_id: call_id.clone(),
        channel_id: channel_id.clone(),
        caller_name: "caller".into(),
        callee_name: "callee".into(),
    });
    let ringing = wait_for("caller ringing", step, || {
        caller.call().filter(|c| c.signaling_phase.is_some())
    })
    .await?;
    print(json!({
        "event": "ringing",
        "call_id": call_id,
        "channel_id": channel_id,
        "caller_uid": ringing.local_uid,
    }));

    if answer == Answer::None {
        let wait = Duration::from_millis(ring_timeout_ms) + step;
        let (reason, _) = wait_for("ring timeout", wait, || caller.closed()).await?;
        print(json!({ "event": "closed", "side": "caller", "reason": reason }));
        return Ok(());
    }

    callee.app.dispatch(AppAction::StartSession {
        call_id: call_id.clone(),
        channel_id: channel_id.clone(),
        role: CallRole::Callee,
    });
    wait_for("callee joined", step, || {
        callee.call().filter(|c| c.remote_uid.is_some())
    })
    .await?;

    if answer == Answer::Decline {
        callee.app.dispatch(AppAction::DeclineCall {
            call_id: call_id.clone(),
        });
    } else {
        callee.app.dispatch(AppAction::AcceptCall {
            call_id: call_id.clone(),
        });
        for (name, peer) in [("caller", &caller), ("callee", &callee)] {
            let call = wait_for("connected", step, || {
                peer.call().filter(|c| c.phase == CallPhase::Connected)
            })
            .await
            .with_context(|| format!("{name} never connected"))?;
            print(json!({
                "event": "connected",
                "side": name,
                "local_uid": call.local_uid,
                "remote_uid": call.remote_uid,
                "started_at": call.started_at,
            }));
        }

        tokio::time::sleep(Duration::from_secs(hold_secs)).await;
        let ender = match hangup {
            Side::Caller => &caller,
            Side::Callee => &callee,
        };
        ender.app.dispatch(AppAction::EndSession);
    }

    for (name, peer) in [("caller", &caller), ("callee", &callee)] {
        let (reason, duration_secs) = wait_for("closed", step, || peer.closed())
            .await
            .with_context(|| format!("{name} never closed"))?;
        print(json!({
            "event": "closed",
            "side": name,
            "reason": reason,
            "duration_secs": duration_secs,
        }));
    }

    let doc = InMemorySignalingStore::shared()
        .document(&call_id)
        .ok_or_else(|| anyhow!("call document missing"))?;
    print(json!({ "event": "document", "json": doc.to_json()? }));
    Ok(())
}

async fn cmd_token(
    endpoint: &str,
    channel: &str,
    uid: u32,
    role: &str,
    timeout_ms: u64,
) -> anyhow::Result<()> {
    let provider = HttpTokenProvider::new(endpoint, role, Duration::from_millis(timeout_ms));
    let token = provider
        .fetch_token(channel, uid)
        .await
        .with_context(|| format!("fetch token from {endpoint}"))?;
    print(json!({
        "channel": channel,
        "uid": uid,
        "token": token.token,
        "expires_in_secs": token.expires_in_secs,
    }));
    Ok(())
}
