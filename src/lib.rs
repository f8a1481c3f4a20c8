//! Rust library for controlling IKEA OBEGRÄNSAD LED walls running custom firmware
//!
//! This library provides an async API for a 16x16 OBEGRÄNSAD matrix reachable on
//! the local network. It supports:
//!
//! - REST control: brightness, plugins, messages, schedules and storage
//! - Periodic state polling with change subscriptions
//! - A self-healing WebSocket channel for rotation, persistence and raw frames
//! - Display snapshots
//!
//! # Quick Start
//!
//! ```no_run
//! use obegransad::{Message, Obegransad, Settings, TurnOn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::new("192.168.1.50").with_websocket(true);
//!     let device = Obegransad::setup(settings).await?;
//!
//!     device.turn_on(TurnOn::effect("Snake")).await?;
//!     device.notify(Message::new("Hello").with_repeat(2)).await?;
//!
//!     // Subscribe to state updates
//!     let mut updates = device.subscribe();
//!     if let Ok(state) = updates.changed().await {
//!         println!("Brightness now {}", state.brightness);
//!     }
//!
//!     device.unload().await;
//!     Ok(())
//! }
//! ```
//!
//! # Direct Client
//!
//! The REST client can be used on its own:
//!
//! ```no_run
//! use obegransad::DeviceClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = DeviceClient::new("192.168.1.50")?;
//!     let info = client.get_info().await?;
//!     println!("{} plugins", info.plugins.len());
//!     client.set_brightness(64).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Client**: stateless REST calls against `http://<host>/api/`
//! - **Coordinator**: polls `/api/info` and publishes normalized snapshots
//! - **WebSocket**: persistent `ws://<host>/ws` channel with reconnect and callbacks
//! - **Integration**: the device facade tying the three together
//! - **Protocol**: WebSocket JSON envelopes
//! - **Types**: device payloads and value types

mod client;
mod coordinator;
mod error;
mod integration;
mod protocol;
mod settings;
mod subscription;
mod types;
mod websocket;

#[cfg(test)]
mod testing;

// Public exports
pub use client::DeviceClient;
pub use coordinator::{Coordinator, CoordinatorState, DEFAULT_SCAN_INTERVAL};
pub use error::{ObegransadError, Result};
pub use integration::{Obegransad, TurnOn};
pub use protocol::{InboundMessage, WsCommand};
pub use settings::{Settings, WebSocketSettings};
pub use subscription::StateReceiver;
pub use types::{
    Brightness, DeviceInfo, DeviceStatus, Diagnostics, DisplayFrame, Message, Plugin, PluginId,
    RotateDirection, ScheduleEntry, DEFAULT_EFFECTS, DEFAULT_MATRIX_SIZE, MAX_MATRIX_SIZE,
};
pub use websocket::{Backoff, CallbackError, CallbackId, ChannelState, WebSocketChannel};
