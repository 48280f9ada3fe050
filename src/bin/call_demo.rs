use chrono::Local;
use clap::{Parser, ValueEnum};
use farmcall::memory::{InMemoryPubSub, LoopbackNegotiator, SimulatedDevices};
use farmcall::records::LogRecordSink;
use farmcall::{CallConfig, CallDependencies, CallKind, CallSessionRegistry, UserId};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

// Runs a complete two-party call inside one process: both users get their own
// registry, wired together through an in-memory pub/sub bus and loopback
// peer connections.
//
// Usage:
//   cargo run --bin call_demo                                  # voice call, accepted
//   cargo run --bin call_demo -- --video --talk-secs 5
//   cargo run --bin call_demo -- --callee-action reject
//   cargo run --bin call_demo -- --callee-action ignore --ring-timeout-secs 3

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CalleeAction {
    Accept,
    Reject,
    Ignore,
}

#[derive(Debug, Parser)]
#[command(name = "call_demo", about = "Place a call between two local users")]
struct Args {
    /// Who places the call.
    #[arg(long, default_value = "grower")]
    caller: String,

    /// Who receives it.
    #[arg(long, default_value = "advisor")]
    callee: String,

    /// Make a video call instead of a voice call.
    #[arg(long)]
    video: bool,

    /// What the callee does when the call comes in.
    #[arg(long, value_enum, default_value_t = CalleeAction::Accept)]
    callee_action: CalleeAction,

    /// Seconds the caller waits for an answer.
    #[arg(long, default_value_t = 45)]
    ring_timeout_secs: u64,

    /// Seconds to stay connected before the caller hangs up.
    #[arg(long, default_value_t = 3)]
    talk_secs: u64,

    /// Deny the caller's camera permission.
    #[arg(long)]
    deny_camera: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let pubsub = Arc::new(InMemoryPubSub::new());
    let negotiator = Arc::new(LoopbackNegotiator::new());
    let config =
        CallConfig::default().with_ring_timeout(Duration::from_secs(args.ring_timeout_secs));

    let caller_devices = Arc::new(if args.deny_camera {
        SimulatedDevices::new().deny_camera()
    } else {
        SimulatedDevices::new()
    });
    let callee_devices = Arc::new(SimulatedDevices::new());

    let caller = CallSessionRegistry::start(
        UserId::new(args.caller.as_str()),
        config.clone(),
        CallDependencies {
            pubsub: pubsub.clone(),
            negotiator: negotiator.clone(),
            devices: caller_devices.clone(),
            records: Arc::new(LogRecordSink),
        },
    )
    .await?;
    let callee = CallSessionRegistry::start(
        UserId::new(args.callee.as_str()),
        config,
        CallDependencies {
            pubsub: pubsub.clone(),
            negotiator,
            devices: callee_devices.clone(),
            records: Arc::new(LogRecordSink),
        },
    )
    .await?;

    let answering = spawn_callee(callee.clone(), args.callee_action);

    let mut ended = caller.events().call_ended.subscribe();
    let mut streams = caller.events().remote_stream.subscribe();
    let mut ticks = caller.events().duration.subscribe();

    let kind = if args.video {
        CallKind::Video
    } else {
        CallKind::Voice
    };
    let identity = caller.initiate(UserId::new(args.callee.as_str()), kind).await?;
    info!(target: "Demo", "Calling {} ({kind}), call id {}", identity.callee_id, identity.call_id);

    let early_end = tokio::select! {
        end = ended.recv() => Some(end?),
        stream = streams.recv() => {
            info!(target: "Demo", "Receiving remote stream {}", stream?.stream.id);
            None
        }
    };

    let end = match early_end {
        Some(end) => end,
        None => {
            let talk = tokio::time::sleep(Duration::from_secs(args.talk_secs));
            tokio::pin!(talk);
            let mut hung_up = false;
            loop {
                tokio::select! {
                    _ = &mut talk, if !hung_up => {
                        hung_up = true;
                        info!(target: "Demo", "Hanging up after {}s", args.talk_secs);
                        caller.hang_up(&identity.call_id).await?;
                    }
                    tick = ticks.recv() => {
                        if let Ok(tick) = tick {
                            info!(target: "Demo", "On the call for {}s", tick.secs);
                        }
                    }
                    end = ended.recv() => break end?,
                }
            }
        }
    };

    match end.duration_secs {
        Some(secs) => info!(target: "Demo", "Call ended ({:?}) after {secs}s", end.reason),
        None => info!(target: "Demo", "Call ended ({:?}) without connecting", end.reason),
    }

    caller.shutdown().await;
    callee.shutdown().await;
    answering.abort();
    // Let queued record writes land before the runtime goes away.
    tokio::time::sleep(Duration::from_millis(100)).await;

    info!(
        target: "Demo",
        "Caller devices: {} acquired, {} released. Callee devices: {} acquired, {} released.",
        caller_devices.acquire_count(),
        caller_devices.release_count(),
        callee_devices.acquire_count(),
        callee_devices.release_count()
    );
    Ok(())
}

fn spawn_callee(
    registry: Arc<CallSessionRegistry>,
    action: CalleeAction,
) -> tokio::task::JoinHandle<()> {
    let mut incoming = registry.events().incoming_call.subscribe();
    tokio::spawn(async move {
        while let Ok(call) = incoming.recv().await {
            let identity = &call.identity;
            info!(
                target: "Demo",
                "{} sees an incoming {} call from {}",
                identity.callee_id, identity.kind, identity.caller_id
            );
            let result = match action {
                CalleeAction::Accept => registry.accept(&identity.call_id).await,
                CalleeAction::Reject => registry.reject(&identity.call_id).await,
                CalleeAction::Ignore => {
                    info!(target: "Demo", "{} lets it ring", identity.callee_id);
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!(target: "Demo", "Callee could not {action:?}: {e}");
            }
        }
    })
}
