use std::io::{self, BufRead};
use std::sync::Arc;

use anyhow::Result;
use log::{error, info};

use myo_link::btle::BtleTransport;
use myo_link::config::SessionConfig;
use myo_link::event_bus::TelemetryBus;
use myo_link::session::DeviceSession;
use myo_link::types::{ChannelQuality, ConnectionStatus, EventKind, TelemetryEvent};

/// Usage: `myo-link [--json] [config.toml]`
#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=myo_link=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let mut json = false;
    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json" => json = true,
            path => config_path = Some(path.to_owned()),
        }
    }
    let config = match config_path {
        Some(path) => {
            info!("Loading config from {path}");
            SessionConfig::load(path)?
        }
        None => SessionConfig::default(),
    };

    // ── Connect ───────────────────────────────────────────────────────────────
    let transport = Arc::new(BtleTransport::new(&config).await);
    let bus = Arc::new(TelemetryBus::new());
    let session = DeviceSession::new(transport, Arc::clone(&bus), config);

    let (_, mut status_rx) = bus.subscribe_channel(EventKind::ConnectionStatus);
    let (_, mut emg_rx) = bus.subscribe_channel(EventKind::Emg);
    let (_, mut imu_rx) = bus.subscribe_channel(EventKind::Imu);

    info!("Connecting to Myo armband …");
    let device = session.connect().await?;
    info!("Streaming started from {}. Type a command + Enter:", device.name);
    info!("  q        – quit");
    info!("  p        – pause streaming");
    info!("  r        – resume streaming");
    info!("  h on|off – haptic feedback");
    info!("  s <hz>   – set sampling rate\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (StdinLock is not Send) and
    // relayed to an async task that can await session commands.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let commands = session.clone();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (None, _) => {}
                (Some("q"), _) => {
                    info!("Quit requested.");
                    if let Err(e) = commands.disconnect().await {
                        error!("Disconnect error: {e}");
                    }
                }
                (Some("p"), _) => {
                    if let Err(e) = commands.stop_streaming().await {
                        error!("Pause error: {e}");
                    }
                }
                (Some("r"), _) => {
                    if let Err(e) = commands.start_streaming().await {
                        error!("Resume error: {e}");
                    }
                }
                (Some("h"), Some(state @ ("on" | "off"))) => {
                    let ok = commands.set_haptic_feedback(state == "on").await;
                    info!("Haptic feedback {state}: {}", if ok { "ok" } else { "not applied" });
                }
                (Some("s"), Some(hz)) => match hz.parse::<u8>() {
                    Ok(hz) => {
                        if let Err(e) = commands.set_sampling_rate(hz).await {
                            error!("Sampling rate error: {e}");
                        }
                    }
                    Err(_) => error!("Sampling rate must be 0–255, got '{hz}'"),
                },
                _ => error!("Unknown command: '{line}'"),
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    loop {
        let event = tokio::select! {
            Some(e) = status_rx.recv() => e,
            Some(e) = emg_rx.recv() => e,
            Some(e) = imu_rx.recv() => e,
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received.");
                session.disconnect().await.ok();
                break;
            }
            else => break,
        };

        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
        if event == TelemetryEvent::ConnectionStatus(ConnectionStatus::Disconnected) {
            info!("❌  Disconnected from device.");
            break;
        }
    }

    info!("Event loop finished – exiting.");
    Ok(())
}

fn print_event(event: &TelemetryEvent) {
    match event {
        TelemetryEvent::ConnectionStatus(status) => println!("[STATUS] {status:?}"),

        // ── EMG ──────────────────────────────────────────────────────────────
        TelemetryEvent::Emg(sample) => {
            let values: Vec<String> = sample
                .channels
                .iter()
                .map(|c| {
                    let flag = if c.quality == ChannelQuality::Poor { "!" } else { "" };
                    format!("{:+4}{flag}", c.raw_value)
                })
                .collect();
            println!("[EMG]  ts={:.0} ms  {}", sample.timestamp, values.join(" "));
        }

        // ── IMU ──────────────────────────────────────────────────────────────
        TelemetryEvent::Imu(imu) => {
            let (a, g, q) = (imu.accelerometer, imu.gyroscope, imu.quaternion);
            println!(
                "[IMU]  acc=({:+.3},{:+.3},{:+.3})g  gyro=({:+.1},{:+.1},{:+.1})°/s  \
                 quat=({:+.3},{:+.3},{:+.3},{:+.3})",
                a.x, a.y, a.z, g.x, g.y, g.z, q.w, q.x, q.y, q.z
            );
        }
    }
}
