use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use client_core::{
    CommandOutcome, DispatchHandle, HttpMutationClient, MachineController, MachineNamespace,
    MutationTransport, NamespaceRegistry, ThrottleOptions, WsEventTransport, WsTransportOptions,
};
use machines::{
    bbm_automatik_v2::{self, SpeedPreset},
    BbmAutomatikV2Controller, MachineKind, SchneidemaschineV0Controller,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::load_settings;

const FIRST_STATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "panel", about = "Follow one machine and send it commands")]
struct Args {
    #[arg(long)]
    machine: MachineKind,
    #[arg(long)]
    serial: u16,
    /// Overrides the configured server URL.
    #[arg(long)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: PanelCommand,
}

#[derive(Subcommand, Debug)]
enum PanelCommand {
    /// Print state and live values as JSON lines until interrupted.
    Watch,
    SetOutput {
        index: usize,
        #[arg(action = ArgAction::Set)]
        on: bool,
    },
    ToggleOutput {
        index: usize,
    },
    /// Axis speed in mm/s, or rpm with `--rpm` (rotating axes).
    SetSpeed {
        axis: usize,
        #[arg(allow_negative_numbers = true)]
        value: f64,
        #[arg(long)]
        rpm: bool,
    },
    MoveTo {
        axis: usize,
        #[arg(allow_negative_numbers = true)]
        position_mm: f64,
        #[arg(long, default_value_t = 50.0)]
        speed_mm_s: f64,
    },
    /// Ramp acceleration in mm/s².
    SetAcceleration {
        axis: usize,
        accel_mm_s2: f64,
    },
    StopAll,
    Home {
        axis: usize,
    },
    Ampel {
        #[arg(long)]
        rot: bool,
        #[arg(long)]
        gelb: bool,
        #[arg(long)]
        gruen: bool,
    },
    AutoStart {
        #[arg(long, default_value = "medium")]
        preset: SpeedPreset,
        #[arg(long, default_value_t = 1)]
        sets: u32,
    },
    AutoStop,
}

impl PanelCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::Watch => "watch",
            Self::SetOutput { .. } => "set-output",
            Self::ToggleOutput { .. } => "toggle-output",
            Self::SetSpeed { .. } => "set-speed",
            Self::MoveTo { .. } => "move-to",
            Self::SetAcceleration { .. } => "set-acceleration",
            Self::StopAll => "stop-all",
            Self::Home { .. } => "home",
            Self::Ampel { .. } => "ampel",
            Self::AutoStart { .. } => "auto-start",
            Self::AutoStop => "auto-stop",
        }
    }

    fn axis(&self) -> Option<usize> {
        match *self {
            Self::SetSpeed { axis, .. }
            | Self::MoveTo { axis, .. }
            | Self::SetAcceleration { axis, .. }
            | Self::Home { axis } => Some(axis),
            _ => None,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    info!(
        server_url = %settings.server_url,
        machine = %args.machine,
        serial = args.serial,
        "starting panel"
    );

    let events = WsEventTransport::connect(
        &settings.server_url,
        WsTransportOptions {
            reconnect_delay: settings.reconnect_delay,
        },
    )
    .context("failed to open event channel")?;
    info!(url = %events.url(), "event channel opened");
    let mutations: Arc<dyn MutationTransport> = Arc::new(
        HttpMutationClient::with_timeout(&settings.server_url, settings.request_timeout)
            .context("failed to build mutation client")?,
    );
    let registry = NamespaceRegistry::new(
        events,
        ThrottleOptions {
            interval: settings.throttle_interval,
        },
    );

    match args.machine {
        MachineKind::BbmAutomatikV2 => {
            let machine = BbmAutomatikV2Controller::new(&registry, args.serial, mutations)
                .context("failed to open machine namespace")?;
            run_bbm(&machine, args.command).await
        }
        MachineKind::SchneidemaschineV0 => {
            let machine = SchneidemaschineV0Controller::new(&registry, args.serial, mutations)
                .context("failed to open machine namespace")?;
            run_schneidemaschine(&machine, args.command).await
        }
    }
}

async fn run_bbm(machine: &BbmAutomatikV2Controller, command: PanelCommand) -> Result<()> {
    if let PanelCommand::Watch = command {
        return watch(machine.controller()).await;
    }
    wait_for_state(machine.controller()).await?;
    if let Some(name) = command.axis().and_then(bbm_automatik_v2::axis_name) {
        info!(axis = name, command = command.name(), "sending axis command");
    }

    let handle = match command {
        PanelCommand::Watch => bail!("watch does not send a command"),
        PanelCommand::SetOutput { index, on } => machine.set_output(index, on)?,
        PanelCommand::ToggleOutput { index } => machine
            .toggle_output(index)?
            .context("machine state unavailable")?,
        PanelCommand::SetSpeed { axis, value, rpm } if rpm => {
            machine.set_axis_speed_rpm(axis, value)?
        }
        PanelCommand::SetSpeed { axis, value, .. } => machine.set_axis_speed_mm_s(axis, value)?,
        PanelCommand::MoveTo {
            axis,
            position_mm,
            speed_mm_s,
        } => machine.move_to_position(axis, position_mm, speed_mm_s)?,
        PanelCommand::SetAcceleration { axis, accel_mm_s2 } => {
            let limits =
                bbm_automatik_v2::MIN_ACCELERATION_MM_S2..=bbm_automatik_v2::MAX_ACCELERATION_MM_S2;
            if !limits.contains(&accel_mm_s2) {
                warn!(
                    accel_mm_s2,
                    min = limits.start(),
                    max = limits.end(),
                    "acceleration outside machine limits; the machine clamps it"
                );
            }
            machine.set_axis_acceleration(axis, accel_mm_s2)?
        }
        PanelCommand::StopAll => machine.stop_all_axes()?,
        PanelCommand::Home { axis } => machine.start_homing(axis)?,
        PanelCommand::Ampel { rot, gelb, gruen } => machine.set_ampel(rot, gelb, gruen)?,
        PanelCommand::AutoStart { preset, sets } => {
            if !machine.can_start_auto() {
                bail!(
                    "automatic sequence cannot start (running: {}, interlock: {}, alarm: {})",
                    machine.is_auto_running(),
                    machine.is_door_interlock_active(),
                    machine.is_any_alarm_active()
                );
            }
            machine.start_auto_sequence(preset, sets)?
        }
        PanelCommand::AutoStop => machine.stop_auto_sequence()?,
    };
    report(handle).await
}

async fn run_schneidemaschine(
    machine: &SchneidemaschineV0Controller,
    command: PanelCommand,
) -> Result<()> {
    if let PanelCommand::Watch = command {
        return watch(machine.controller()).await;
    }
    wait_for_state(machine.controller()).await?;

    let handle = match command {
        PanelCommand::SetOutput { index, on } => machine.set_output(index, on)?,
        PanelCommand::ToggleOutput { index } => machine
            .toggle_output(index)?
            .context("machine state unavailable")?,
        PanelCommand::SetSpeed { axis, value, rpm: false } => {
            machine.set_axis_speed_mm_s(axis, value)?
        }
        PanelCommand::MoveTo {
            axis,
            position_mm,
            speed_mm_s,
        } => machine.move_to_position(axis, position_mm, speed_mm_s)?,
        PanelCommand::SetAcceleration { axis, accel_mm_s2 } => {
            machine.set_axis_acceleration(axis, accel_mm_s2)?
        }
        PanelCommand::StopAll => machine.stop_all_axes()?,
        other => bail!(
            "{} is not available on {}",
            other.name(),
            MachineKind::SchneidemaschineV0
        ),
    };
    report(handle).await
}

async fn wait_for_state<N: MachineNamespace>(controller: &MachineController<N>) -> Result<()> {
    let mut updates = controller.namespace().store().watch();
    tokio::time::timeout(FIRST_STATE_TIMEOUT, async {
        while updates.borrow_and_update().state_data().is_none() {
            if updates.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .context("no state received from the machine")?;

    if controller.is_disabled() {
        bail!("machine {} has not reported its state", controller.namespace().id());
    }
    Ok(())
}

async fn report(handle: DispatchHandle) -> Result<()> {
    let action = handle.action();
    match handle.outcome().await {
        CommandOutcome::Accepted => {
            info!(action, "command accepted");
            Ok(())
        }
        CommandOutcome::Rejected(message) => bail!("{action} rejected by machine: {message}"),
        CommandOutcome::TransportFailed(message) => {
            bail!("{action} could not be delivered: {message}")
        }
    }
}

async fn watch<N>(controller: &MachineController<N>) -> Result<()>
where
    N: MachineNamespace,
    N::State: Serialize,
    N::LiveValues: Serialize,
{
    let mut updates = controller.namespace().store().watch();
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    warn!("machine store closed");
                    return Ok(());
                }
                let snapshot = updates.borrow_and_update().clone();
                let line = json!({
                    "revision": snapshot.state_revision,
                    "state": snapshot.state_data(),
                    "live_values": snapshot.live_values_data(),
                    "optimistic": controller.is_loading(),
                });
                println!("{line}");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
        }
    }
}
