//! open-g13: Logitech G13 driver daemon and diagnostic commands.

mod config;
mod uinput;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use open_g13_core::bus::{BusEvent, Subscription};
use open_g13_core::comm::write_with_retry;
use open_g13_core::decoder::{Decoder, InputState};
use open_g13_core::device::discover_devices;
use open_g13_core::engine::Engine;
use open_g13_core::lcd::Framebuffer;
use open_g13_core::macros::{Macro, MacroLibrary};
use open_g13_core::output::{encode_backlight, encode_lcd, Rgb};
use open_g13_core::profile::Profile;
use open_g13_core::report::{OutputReport, RawReport};
use open_g13_core::resolver::BindingState;
use open_g13_core::safety;
use open_g13_core::sink::NullSink;
use open_g13_core::store::JsonStore;
use open_g13_core::transport::{DeviceConnector, HidapiConnector};
use open_g13_core::{Controller, Error};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::uinput::UinputKeyboard;

#[derive(Parser)]
#[command(
    name = "open-g13",
    version,
    about = "Open-source Logitech G13 driver daemon"
)]
struct Cli {
    /// Config file (default: ~/.config/open-g13/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the driver until Ctrl-C.
    Run {
        /// Profile to activate instead of the configured default.
        #[arg(long)]
        profile: Option<String>,
    },
    /// List connected G13 devices.
    ListDevices,
    /// Print decoded input from the live device without injecting keys.
    Monitor,
    /// Decode captured input reports given as hex, one argument per report.
    Decode {
        /// e.g. 0180800100000000
        reports: Vec<String>,
    },
    /// Set the backlight color.
    SetColor {
        /// `#RRGGBB` or a color name such as `orange`.
        color: Rgb,
        /// Percent of full brightness.
        #[arg(long, default_value_t = 100)]
        brightness: u8,
    },
    /// Show text on the LCD (up to 5 lines).
    Lcd {
        lines: Vec<String>,
        /// Print the rendered frame instead of writing it.
        #[arg(long)]
        preview: bool,
    },
    /// List stored profiles.
    Profiles,
    /// Write the built-in default bindings as a new profile.
    InitProfile {
        name: String,
        /// Overwrite an existing profile.
        #[arg(long)]
        force: bool,
    },
    /// List stored macros.
    Macros,
}

fn init_logging(config: &DaemonConfig) {
    let fallback = config.log_filter.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load(cli.config.as_deref())?;
    init_logging(&config);

    let profiles: JsonStore<Profile> = JsonStore::new(config.profiles_dir());
    let macros: JsonStore<Macro> = JsonStore::new(config.macros_dir());

    match cli.command {
        Commands::Run { profile } => {
            let name = profile.unwrap_or_else(|| config.default_profile.clone());
            run(&config, &profiles, &macros, &name).await?;
        }
        Commands::ListDevices => {
            let devices = discover_devices()?;
            if devices.is_empty() {
                println!("No Logitech G13 found.");
                println!("Ensure the device is connected and the hidraw node is readable.");
            } else {
                for dev in &devices {
                    println!(
                        "{} (VID: 0x{:04X}, PID: 0x{:04X}, path: {})",
                        dev.model.name(),
                        dev.vid,
                        dev.pid,
                        dev.path
                    );
                }
            }
        }
        Commands::Monitor => monitor(&config).await?,
        Commands::Decode { reports } => decode(&config, &reports)?,
        Commands::SetColor { color, brightness } => {
            safety::validate_brightness(brightness)?;
            write_once(&config, &encode_backlight(color.scaled(brightness)))?;
            println!("Backlight set to {color} at {brightness}%");
        }
        Commands::Lcd { lines, preview } => {
            safety::validate_lcd_text(&lines)?;
            let fb = Framebuffer::from_text(&lines);
            if preview {
                print!("{}", fb.to_ascii());
            } else {
                write_once(&config, &encode_lcd(&fb))?;
                println!("LCD updated");
            }
        }
        Commands::Profiles => {
            let names = profiles.list()?;
            if names.is_empty() {
                println!("No profiles in {}", profiles.dir().display());
            }
            for name in names {
                let marker = if name == config.default_profile { "*" } else { " " };
                println!("{marker} {name}");
            }
        }
        Commands::InitProfile { name, force } => {
            if !force && profiles.list()?.contains(&name) {
                bail!("profile '{name}' already exists (use --force to overwrite)");
            }
            let profile = Profile {
                name,
                ..Profile::default()
            };
            let path = profiles.save(&profile)?;
            println!("Profile saved to {}", path.display());
        }
        Commands::Macros => {
            let all = macros.load_all()?;
            if all.is_empty() {
                println!("No macros in {}", macros.dir().display());
            }
            for m in all {
                println!(
                    "{:<24} {:>4} steps  {:>6} ms  {:?}",
                    m.id,
                    m.steps.len(),
                    m.pass_duration().as_millis(),
                    m.playback
                );
            }
        }
    }

    Ok(())
}

fn connector(config: &DaemonConfig) -> HidapiConnector {
    HidapiConnector::new(config.engine.model, config.device_path.clone())
}

/// Open the device, write one report, close it.
fn write_once(config: &DaemonConfig, report: &OutputReport) -> Result<()> {
    let mut link = connector(config).open()?;
    write_with_retry(link.writer.as_mut(), report)?;
    Ok(())
}

fn load_bindings(
    profiles: &JsonStore<Profile>,
    macros: &JsonStore<Macro>,
    name: &str,
) -> Result<BindingState> {
    let library: MacroLibrary = macros.load_all()?.into_iter().collect();
    let profile = match profiles.load(name) {
        Ok(p) => p,
        Err(Error::ProfileNotFound(_)) if name == "default" => {
            warn!("No stored default profile, using built-in bindings");
            Profile::default()
        }
        Err(e) => return Err(e).with_context(|| format!("loading profile '{name}'")),
    };
    for (mode, button, macro_id) in profile.macro_refs() {
        if !library.contains(macro_id) {
            warn!(%mode, %button, %macro_id, "Profile binds a missing macro");
        }
    }
    info!(profile = %profile.name, macros = library.len(), "Bindings loaded");
    Ok(BindingState::new(profile, library))
}

async fn run(
    config: &DaemonConfig,
    profiles: &JsonStore<Profile>,
    macros: &JsonStore<Macro>,
    name: &str,
) -> Result<()> {
    let state = load_bindings(profiles, macros, name)?;
    let sink = Arc::new(UinputKeyboard::new().context("creating the uinput keyboard")?);
    let mut engine = Engine::start_with(
        Box::new(connector(config)),
        sink,
        config.engine.clone(),
        state,
    )?;
    let controller = engine.controller();
    let mut events = controller.subscribe();

    info!("Running; press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => on_event(&controller, profiles, macros, &event),
                None => break,
            },
        }
    }

    info!(dropped = events.dropped(), "Shutting down");
    engine.stop();
    Ok(())
}

/// Log an event and persist recordings as they finish.
fn on_event(
    controller: &Controller,
    profiles: &JsonStore<Profile>,
    macros: &JsonStore<Macro>,
    event: &BusEvent,
) {
    match event {
        BusEvent::Transition(_) => {}
        other => match serde_json::to_string(other) {
            Ok(json) => info!(event = %json, "Bus event"),
            Err(e) => warn!(error = %e, "Unserializable bus event"),
        },
    }
    if let BusEvent::RecordingFinished {
        macro_id: Some(macro_id),
        ..
    } = event
    {
        persist_recording(controller, profiles, macros, macro_id);
    }
}

/// Save a recorded macro and the profile it was bound into.
fn persist_recording(
    controller: &Controller,
    profiles: &JsonStore<Profile>,
    macros: &JsonStore<Macro>,
    macro_id: &str,
) {
    let Some(m) = controller.macros().get(macro_id) else {
        warn!(%macro_id, "Recorded macro is gone before it could be saved");
        return;
    };
    if let Err(e) = macros.save(&m) {
        warn!(%macro_id, error = %e, "Failed to save recorded macro");
        return;
    }
    if let Err(e) = profiles.save(&controller.get_active_profile()) {
        warn!(error = %e, "Failed to save profile after recording");
    }
}

async fn monitor(config: &DaemonConfig) -> Result<()> {
    let state = BindingState::new(Profile::empty("monitor"), MacroLibrary::new());
    let mut engine = Engine::start_with(
        Box::new(connector(config)),
        Arc::new(NullSink),
        config.engine.clone(),
        state,
    )?;
    let mut events: Subscription = engine.controller().subscribe();
    println!("Monitoring input; press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(BusEvent::Transition(t)) => println!("{}", serde_json::to_string(&t)?),
                Some(BusEvent::Device { status }) => println!("device: {status:?}"),
                Some(_) => {}
                None => break,
            },
        }
    }
    engine.stop();
    Ok(())
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let digits: String = s
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        bail!("'{s}' is not an even-length hex string");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

fn decode(config: &DaemonConfig, reports: &[String]) -> Result<()> {
    let decoder = Decoder::new(config.engine.model.decode_table(), config.engine.decoder);
    let mut state = InputState::default();
    for (i, hex) in reports.iter().enumerate() {
        let bytes = parse_hex(hex)?;
        let raw = RawReport::capture(&bytes);
        match decoder.decode(&state, &raw) {
            Ok((next, transition)) => {
                println!("#{i}: {}", serde_json::to_string(&transition)?);
                state = next;
            }
            Err(e) => println!("#{i}: {e}"),
        }
    }
    let pressed: Vec<String> = state.buttons.iter().map(|b| b.to_string()).collect();
    println!(
        "pressed: [{}]  stick: ({:.2}, {:.2})",
        pressed.join(", "),
        state.joystick.x,
        state.joystick.y
    );
    Ok(())
}
