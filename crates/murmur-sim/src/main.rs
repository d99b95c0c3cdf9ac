//! Murmur voice simulator.
//!
//! Runs two voice sessions in one process over the loopback backend and
//! relays their signaling through the JSON wire format, so negotiation,
//! glare handling and stream mapping can be watched end to end.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use murmur_common::MurmurError;
use murmur_config::MurmurConfig;
use murmur_voice::loopback::{ChannelTransport, LoopbackCapture, LoopbackFactory};
use murmur_voice::{Envelope, VoiceBackends, VoiceEvent, VoiceSession};

#[derive(Parser, Debug)]
#[command(name = "murmur-sim", about = "Two-party voice negotiation simulator")]
struct Args {
    /// Config file to load instead of the platform default
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// Enable media on both sides at the same moment to force offer collisions
    #[arg(long)]
    glare: bool,

    /// The two participants; on collisions the greater name yields
    #[arg(long, value_delimiter = ',', default_value = "alice,bob")]
    users: Vec<String>,

    /// Voice channel both participants join
    #[arg(long, default_value = "lobby")]
    channel: String,

    /// Milliseconds to wait for signaling to settle between steps
    #[arg(long, default_value_t = 250)]
    settle_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => murmur_config::load_from_path(path),
        None => murmur_config::load_default(),
    };
    let (config, config_error) = match loaded {
        Ok(config) => (config, None),
        Err(e) => (MurmurConfig::default(), Some(e)),
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.as_directive().to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .init();

    if let Some(e) = config_error {
        warn!(error = %e, "Using default config");
    }

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Simulation failed");
            ExitCode::FAILURE
        }
    }
}

struct Participant {
    session: Arc<VoiceSession>,
    outbox: mpsc::UnboundedReceiver<Envelope>,
}

fn participant(user_id: &str, config: MurmurConfig) -> Participant {
    let (transport, outbox) = ChannelTransport::new();
    let backends = VoiceBackends {
        connections: Arc::new(LoopbackFactory::new()),
        capture: Arc::new(LoopbackCapture::new()),
        transport: Arc::new(transport),
    };
    Participant {
        session: Arc::new(VoiceSession::new(user_id, config, backends)),
        outbox,
    }
}

/// Forward everything `from` sends to `to`, through the wire encoding.
async fn relay(mut from: mpsc::UnboundedReceiver<Envelope>, to: Arc<VoiceSession>) {
    while let Some(envelope) = from.recv().await {
        let wire = match envelope.to_json() {
            Ok(wire) => wire,
            Err(e) => {
                warn!(error = %e, "Dropping unencodable envelope");
                continue;
            }
        };
        debug!(to = to.user_id(), bytes = wire.len(), "Relaying {wire}");
        match Envelope::from_json(&wire) {
            Ok(envelope) => to.handle_envelope(envelope).await,
            Err(e) => warn!(error = %e, "Dropping undecodable envelope"),
        }
    }
}

/// Log what a session publishes until its event bus closes.
async fn watch_events(session: Arc<VoiceSession>) {
    let user = session.user_id().to_string();
    let mut events = session.subscribe_events();
    drop(session);
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(user = %user, skipped, "Event watcher lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            VoiceEvent::NegotiationFailed { reason } => {
                warn!(user = %user, %reason, "Negotiation failed")
            }
            VoiceEvent::IceRestartsExhausted => warn!(user = %user, "ICE restarts exhausted"),
            VoiceEvent::RemoteStreamUpdated(stream) => {
                info!(user = %user, stream = %stream.id, mids = ?stream.mids, "Remote stream updated")
            }
            other => debug!(user = %user, event = ?other, "Voice event"),
        }
    }
}

async fn run(args: Args, config: MurmurConfig) -> Result<(), MurmurError> {
    let [first, second] = args.users.as_slice() else {
        return Err(MurmurError::Other(format!(
            "--users needs exactly two names, got {}",
            args.users.len()
        )));
    };
    if first == second {
        return Err(MurmurError::Other("--users names must differ".into()));
    }

    let a = participant(first, config.clone());
    let b = participant(second, config);
    let alice = Arc::clone(&a.session);
    let bob = Arc::clone(&b.session);

    let relays = [
        tokio::spawn(relay(a.outbox, Arc::clone(&bob))),
        tokio::spawn(relay(b.outbox, Arc::clone(&alice))),
        tokio::spawn(watch_events(Arc::clone(&alice))),
        tokio::spawn(watch_events(Arc::clone(&bob))),
    ];
    let settle = Duration::from_millis(args.settle_ms);

    info!(channel = %args.channel, glare = args.glare, "Starting simulation");
    alice.connect(&args.channel).await?;
    bob.connect(&args.channel).await?;
    tokio::time::sleep(settle).await;

    if args.glare {
        let (x, y) = tokio::join!(alice.toggle_mic(), bob.toggle_mic());
        x?;
        y?;
        let (x, y) = tokio::join!(alice.toggle_camera(), bob.toggle_screen());
        x?;
        y?;
    } else {
        alice.toggle_mic().await?;
        tokio::time::sleep(settle).await;
        bob.toggle_mic().await?;
        tokio::time::sleep(settle).await;
        alice.toggle_camera().await?;
        tokio::time::sleep(settle).await;
        bob.toggle_screen().await?;
    }
    alice.play_music().await?;
    tokio::time::sleep(settle).await;

    for session in [&alice, &bob] {
        report(session).await?;
    }

    alice.disconnect().await?;
    bob.disconnect().await?;
    tokio::time::sleep(settle).await;

    drop(alice);
    drop(bob);
    for task in relays {
        task.abort();
    }
    info!("Simulation finished");
    Ok(())
}

async fn report(session: &VoiceSession) -> Result<(), MurmurError> {
    let engine = session.engine_snapshot().await?;
    println!(
        "{} [{}] negotiation={:?} connection={:?}",
        session.user_id(),
        session.channel_id().unwrap_or_default(),
        engine.state,
        session.snapshot().connection_state,
    );
    for stream in session.remote_streams().await? {
        let mids: Vec<&str> = stream.mids.iter().map(String::as_str).collect();
        println!("  {} mids=[{}]", stream.id, mids.join(","));
    }
    Ok(())
}
