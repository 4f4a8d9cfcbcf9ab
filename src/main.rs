use anyhow::{Context, anyhow, bail};
use chrono::Local;
use clap::{Parser, ValueEnum};
use log::{error, info};
use peer_call::calls::{CallManager, CallPhase, Participant, SessionSnapshot};
use peer_call::events::EventBus;
use peer_call::media::SyntheticDevices;
use peer_call::peer::LoopbackNetwork;
use peer_call::relay::MemoryRelay;
use peer_call::CallConfig;
use std::sync::Arc;
use std::time::Duration;

// Scripted two-party calls over the in-process relay and peer network.
//
// Usage:
//   cargo run                                             # alice calls bob, bob accepts
//   cargo run -- --scenario reject                        # bob declines
//   cargo run -- --scenario cancel                        # alice gives up while ringing
//   cargo run -- --scenario busy                          # carol calls bob mid-call
//   cargo run -- --scenario no-answer --ring-timeout-ms 500
//   cargo run -- --deny-media                             # alice's camera is blocked

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "peer-call", about = "Run a scripted two-party call in process")]
struct Args {
    /// What bob (or a third party) does with alice's call
    #[arg(long, value_enum, default_value_t = Scenario::Accept)]
    scenario: Scenario,

    /// Deny alice access to camera and microphone
    #[arg(long)]
    deny_media: bool,

    /// Give up ringing after this many milliseconds
    #[arg(long)]
    ring_timeout_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Accept,
    Reject,
    Cancel,
    Busy,
    NoAnswer,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    if let Err(e) = rt.block_on(run(args)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

struct Party {
    name: &'static str,
    devices: Arc<SyntheticDevices>,
    manager: CallManager,
}

impl Party {
    async fn join(
        user: &'static str,
        display_name: &str,
        config: &CallConfig,
        relay: &Arc<MemoryRelay>,
        network: &Arc<LoopbackNetwork>,
    ) -> anyhow::Result<Self> {
        let devices = SyntheticDevices::new(user);
        let manager = CallManager::builder()
            .with_config(CallConfig {
                display_name: display_name.to_string(),
                ..config.clone()
            })
            .with_media_devices(devices.clone())
            .with_loopback_peer(network.peer(user))
            .with_transport_factory(relay.factory(user))
            .build()
            .await
            .with_context(|| format!("Failed to start {user}"))?;

        log_events(user, manager.events());

        let party = Self {
            name: user,
            devices,
            manager,
        };
        let ready = party.wait(|s| s.local_identifier.is_some()).await?;
        info!(
            "{user} is reachable as {}",
            ready
                .local_identifier
                .map(|id| id.to_string())
                .unwrap_or_default()
        );
        Ok(party)
    }

    async fn wait(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> anyhow::Result<SessionSnapshot> {
        self.wait_within(STEP_TIMEOUT, predicate).await
    }

    async fn wait_within(
        &self,
        limit: Duration,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> anyhow::Result<SessionSnapshot> {
        tokio::time::timeout(limit, self.manager.wait_for(predicate))
            .await
            .map_err(|_| anyhow!("{} timed out waiting for the session", self.name))?
            .map_err(Into::into)
    }

    async fn wait_phase(&self, phase: CallPhase) -> anyhow::Result<SessionSnapshot> {
        self.wait(|s| s.phase == phase).await
    }

    async fn wait_connected(&self) -> anyhow::Result<SessionSnapshot> {
        self.wait(|s| s.phase == CallPhase::Active && s.has_remote_stream)
            .await
    }
}

fn log_events(user: &'static str, events: &EventBus) {
    let mut phases = events.phase_changed.subscribe();
    let mut notices = events.notice.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(change) = phases.recv() => {
                    info!(target: "Demo", "[{user}] session {}: {:?} -> {:?}", change.epoch, change.from, change.to);
                }
                Ok(notice) = notices.recv() => {
                    info!(target: "Demo", "[{user}] {notice:?}");
                }
                else => break,
            }
        }
    });
}

async fn run(args: Args) -> anyhow::Result<()> {
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    let config = CallConfig {
        ring_timeout: args.ring_timeout_ms.map(Duration::from_millis),
        ..CallConfig::default()
    };

    if args.scenario == Scenario::NoAnswer && config.ring_timeout.is_none() {
        bail!("--scenario no-answer needs --ring-timeout-ms");
    }

    let alice = Party::join("alice", "Alice", &config, &relay, &network).await?;
    let bob = Party::join("bob", "Bob", &config, &relay, &network).await?;
    alice.devices.set_denied(args.deny_media);

    alice.manager.start(Participant::new("bob", "Bob")).await?;

    if args.deny_media {
        alice.wait_phase(CallPhase::Idle).await?;
        info!("alice could not open her camera; bob was never rung");
    } else {
        match args.scenario {
            Scenario::Accept => {
                connect(&alice, &bob).await?;

                let muted = alice.manager.toggle_mic().await?;
                let unmuted = alice.manager.toggle_mic().await?;
                info!("alice mic: {muted} then {unmuted}");

                alice.manager.end().await?;
                bob.wait_phase(CallPhase::Idle).await?;
            }
            Scenario::Reject => {
                bob.wait_phase(CallPhase::Incoming).await?;
                bob.manager.reject().await?;
                alice.wait_phase(CallPhase::Idle).await?;
            }
            Scenario::Cancel => {
                bob.wait_phase(CallPhase::Incoming).await?;
                alice.manager.cancel().await?;
                bob.wait_phase(CallPhase::Idle).await?;
            }
            Scenario::Busy => {
                connect(&alice, &bob).await?;

                let carol = Party::join("carol", "Carol", &config, &relay, &network).await?;
                carol.manager.start(Participant::new("bob", "Bob")).await?;
                carol.wait_phase(CallPhase::Idle).await?;
                info!("carol got a busy signal; bob is still {:?}", bob.manager.snapshot().phase);

                alice.manager.hangup().await?;
                bob.wait_phase(CallPhase::Idle).await?;
                carol.manager.shutdown().await?;
            }
            Scenario::NoAnswer => {
                let ring = config.ring_timeout.unwrap_or_default();
                bob.wait_phase(CallPhase::Incoming).await?;
                alice
                    .wait_within(ring + STEP_TIMEOUT, |s| s.phase.is_idle())
                    .await?;
                bob.wait_phase(CallPhase::Idle).await?;
            }
        }
    }

    for party in [&alice, &bob] {
        party.manager.shutdown().await?;
        info!("{} media: {:?}", party.name, party.manager.media_stats());
    }
    Ok(())
}

async fn connect(alice: &Party, bob: &Party) -> anyhow::Result<()> {
    bob.wait_phase(CallPhase::Incoming).await?;
    bob.manager.accept().await?;
    let a = alice.wait_connected().await?;
    let b = bob.wait_connected().await?;
    info!(
        "connected: alice={} bob={}",
        a.remote_identifier.map(|id| id.to_string()).unwrap_or_default(),
        b.remote_identifier.map(|id| id.to_string()).unwrap_or_default()
    );
    Ok(())
}
