//! Connect to a device and print every state change
//!
//! Usage: `cargo run --example watch -- <host | config.toml>`
//!
//! Settings can also come from `OBEGRANSAD_*` environment variables, e.g.
//! `OBEGRANSAD_HOST=192.168.1.50 OBEGRANSAD_WEBSOCKET__ENABLED=true`.

use obegransad::{Obegransad, Settings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("obegransad=info")),
        )
        .init();

    let settings = match std::env::args().nth(1) {
        Some(arg) if arg.ends_with(".toml") => Settings::load(&arg)?,
        Some(host) => Settings::new(host).with_websocket(true),
        None => Settings::load("obegransad")?,
    };

    let device = Obegransad::setup(settings).await?;
    let state = device.state();
    println!(
        "Connected: {} effects, active {:?}, brightness {}%",
        state.plugin_map.len(),
        state.active_effect_name,
        state.brightness_percent()
    );

    let mut updates = device.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.changed() => {
                let Ok(state) = update else { break };
                println!(
                    "on={} brightness={} effect={:?} rotation={:?} schedule={} ({} entries) status={}",
                    state.is_on,
                    state.brightness,
                    state.active_effect_name,
                    state.rotation_degrees(),
                    state.schedule_active,
                    state.schedule_count(),
                    state.status.as_str()
                );
            }
        }
    }

    device.unload().await;
    Ok(())
}
