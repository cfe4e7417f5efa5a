use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use signal_store::{MemoryStore, SharedStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use beach_pier::engine::{RtcEngineFactory, SyntheticMedia, VirtualNetwork};
use beach_pier::negotiation::SignalingChannel;
use beach_pier::{
    NegotiationState, NegotiatorDeps, PierConfig, SessionId, SessionNegotiator, SessionRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "beach-pier")]
#[command(about = "Negotiates peer sessions over a shared signaling store")]
struct Cli {
    /// Log negotiation details (same as RUST_LOG=debug for this crate)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Redis URL of the shared store; omit to keep sessions in process
    #[arg(long, env = "PIER_STORE_URL", global = true)]
    store_url: Option<String>,

    /// Key prefix for sessions in the shared store
    #[arg(long, env = "PIER_KEY_PREFIX", global = true)]
    key_prefix: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a session and print its id
    Call,

    /// Join the session with the given id
    Answer {
        session: String,
    },

    /// Run caller and answerer in this process over a virtual network
    Loopback {
        /// Seconds to wait for both sides to connect
        #[arg(long, default_value_t = 20)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = PierConfig::from_env();
    if cli.store_url.is_some() {
        config.store_url = cli.store_url.clone();
    }
    if let Some(prefix) = &cli.key_prefix {
        config.key_prefix = prefix.clone();
    }

    match cli.command {
        Command::Call => {
            let registry = registry_for(&config).await?;
            if config.store_url.is_none() {
                warn!("no PIER_STORE_URL set; the session is only reachable from this process");
            }
            let (id, negotiator) = registry.start_call().await.context("starting call")?;
            println!("{id}");
            follow(&registry, &id, &negotiator).await;
        }
        Command::Answer { session } => {
            let registry = registry_for(&config).await?;
            let id = SessionId::from(session);
            let negotiator = registry
                .answer_call(id.clone())
                .await
                .with_context(|| format!("answering session {id}"))?;
            follow(&registry, &id, &negotiator).await;
        }
        Command::Loopback { timeout_secs } => {
            loopback(Duration::from_secs(timeout_secs)).await?;
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("beach_pier=debug,signal_store=debug,warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn registry_for(config: &PierConfig) -> Result<SessionRegistry> {
    let store = config
        .connect_store()
        .await
        .context("opening shared store")?;
    Ok(SessionRegistry::new(NegotiatorDeps {
        channel: SignalingChannel::new(store),
        engines: Arc::new(RtcEngineFactory::new(config.ice_servers.clone())),
        media: Arc::new(SyntheticMedia::default()),
    }))
}

/// Logs state changes until the session ends or Ctrl-C is pressed.
async fn follow(registry: &SessionRegistry, id: &SessionId, negotiator: &SessionNegotiator) {
    let mut states = negotiator.watch_state();
    loop {
        let state = *states.borrow_and_update();
        info!(session = %id, ?state, "session state");
        if state.is_terminal() {
            break;
        }
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(session = %id, "interrupted");
                break;
            }
        }
    }
    registry.close_all().await;
}

async fn loopback(limit: Duration) -> Result<()> {
    let network = VirtualNetwork::start(&["10.0.0.2", "10.0.0.3"])
        .await
        .context("starting virtual network")?;
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let endpoint = |index: usize| -> Result<SessionRegistry> {
        let settings = network
            .settings(index)
            .ok_or_else(|| anyhow!("virtual host {index} missing"))?;
        Ok(SessionRegistry::new(NegotiatorDeps {
            channel: SignalingChannel::new(Arc::clone(&store)),
            engines: Arc::new(RtcEngineFactory::with_settings(Vec::new(), settings)),
            media: Arc::new(SyntheticMedia::new(format!("loopback-{index}"))),
        }))
    };
    let caller = endpoint(0)?;
    let answerer = endpoint(1)?;

    let (id, offer_side) = caller.start_call().await.context("starting call")?;
    info!(session = %id, "offer published");
    let answer_side = answerer
        .answer_call(id.clone())
        .await
        .context("answering call")?;

    let settled = |state: NegotiationState| state == NegotiationState::Connected || state.is_terminal();
    let outcome = tokio::time::timeout(limit, async {
        tokio::join!(
            offer_side.wait_for_state(settled),
            answer_side.wait_for_state(settled)
        )
    })
    .await;

    caller.close_all().await;
    answerer.close_all().await;

    match outcome {
        Ok((NegotiationState::Connected, NegotiationState::Connected)) => {
            println!("session {id}: both sides connected");
            Ok(())
        }
        Ok((caller_state, answerer_state)) => {
            bail!("session {id} ended as caller={caller_state:?} answerer={answerer_state:?}")
        }
        Err(_) => bail!("session {id} did not connect within {limit:?}"),
    }
}
