use crate::client::DeviceClient;
use crate::coordinator::{Coordinator, CoordinatorState};
use crate::error::{ObegransadError, Result};
use crate::protocol::InboundMessage;
use crate::settings::Settings;
use crate::subscription::StateReceiver;
use crate::types::{Brightness, DisplayFrame, Message, PluginId, RotateDirection, ScheduleEntry};
use crate::websocket::WebSocketChannel;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Options for [`Obegransad::turn_on`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOn {
    pub brightness: Option<Brightness>,
    pub effect: Option<String>,
}

impl TurnOn {
    pub fn brightness(brightness: Brightness) -> Self {
        Self {
            brightness: Some(brightness),
            effect: None,
        }
    }

    pub fn effect(effect: impl Into<String>) -> Self {
        Self {
            brightness: None,
            effect: Some(effect.into()),
        }
    }
}

/// One configured OBEGRÄNSAD device
///
/// Owns the REST client, the polling coordinator and, when enabled, the
/// WebSocket channel. Commands go out through the client or channel and are
/// followed by a coordinator refresh; device state only ever flows back
/// through the coordinator, whose last poll result also decides
/// [`is_available`](Self::is_available).
///
/// # Example
///
/// ```no_run
/// use obegransad::{Obegransad, Settings, TurnOn};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let device = Obegransad::setup(Settings::new("192.168.1.50")).await?;
///     device.turn_on(TurnOn::effect("Rain")).await?;
///     println!("Active: {:?}", device.state().active_effect_name);
///     device.unload().await;
///     Ok(())
/// }
/// ```
pub struct Obegransad {
    settings: Settings,
    coordinator: Coordinator,
    websocket: Option<Arc<WebSocketChannel>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Brightness before the last turn-off, restored by a plain turn-on
    last_brightness: Mutex<Option<Brightness>>,
}

impl Obegransad {
    /// Set up the device; fails if the first poll does not succeed
    pub async fn setup(settings: Settings) -> Result<Self> {
        settings.validate()?;
        tracing::info!("Setting up OBEGRÄNSAD LED at {}", settings.host);

        let client = DeviceClient::from_settings(&settings)?;
        let coordinator = Coordinator::setup(client, settings.scan_interval()).await?;
        coordinator.start();

        let mut tasks = Vec::new();
        let websocket = if settings.websocket.enabled {
            let channel = Arc::new(
                WebSocketChannel::new(&settings.host)
                    .with_backoff(Duration::from_secs(1), settings.max_backoff()),
            );
            let state = coordinator.state();
            channel.set_dimensions(state.rows, state.cols);

            // Push frames only trigger a poll; the coordinator stays the single writer
            let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(1);
            channel.add_callback(move |message| {
                if let InboundMessage::Json(_) = message {
                    let _ = refresh_tx.try_send(());
                }
                Ok(())
            });

            let refresher = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                while refresh_rx.recv().await.is_some() {
                    refresher.request_refresh().await;
                }
            }));

            let listener = channel.clone();
            tasks.push(tokio::spawn(async move {
                listener.listen_forever().await;
            }));

            Some(channel)
        } else {
            None
        };

        Ok(Self {
            settings,
            coordinator,
            websocket,
            tasks: Mutex::new(tasks),
            last_brightness: Mutex::new(None),
        })
    }

    /// Stop polling and close the WebSocket channel
    pub async fn unload(&self) {
        tracing::info!("Unloading OBEGRÄNSAD LED at {}", self.settings.host);
        self.coordinator.stop().await;
        if let Some(channel) = &self.websocket {
            channel.disconnect().await;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn client(&self) -> &DeviceClient {
        self.coordinator.client()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn websocket(&self) -> Option<&Arc<WebSocketChannel>> {
        self.websocket.as_ref()
    }

    /// Latest device snapshot
    pub fn state(&self) -> Arc<CoordinatorState> {
        self.coordinator.state()
    }

    pub fn subscribe(&self) -> StateReceiver {
        self.coordinator.subscribe()
    }

    /// Whether the last poll reached the device
    pub fn is_available(&self) -> bool {
        self.coordinator.last_update_success()
    }

    fn websocket_or(&self, what: &'static str) -> Result<&Arc<WebSocketChannel>> {
        self.websocket.as_ref().ok_or_else(|| {
            tracing::warn!("WebSocket not enabled for {}", what);
            ObegransadError::NotSupported(what)
        })
    }

    // ========== Light ==========

    /// Turn the light on
    ///
    /// An effect, if given, is applied first. Brightness is then the explicit
    /// value, or when none is given the brightness before the last turn-off
    /// (full brightness if there is none). With only an effect and the light
    /// already on, brightness is left alone.
    pub async fn turn_on(&self, options: TurnOn) -> Result<()> {
        let was_on = self.state().is_on;

        if let Some(effect) = &options.effect {
            self.apply_effect(effect).await?;
        }

        let restore = *self.last_brightness.lock().unwrap();
        let target = match (options.brightness, &options.effect) {
            (Some(brightness), _) => Some(brightness),
            (None, Some(_)) if was_on => None,
            (None, _) => Some(restore.unwrap_or(Brightness::MAX)),
        };

        if let Some(brightness) = target {
            self.client().set_brightness(brightness).await?;
        }

        self.coordinator.request_refresh().await;
        Ok(())
    }

    /// Turn the light off, remembering the current brightness
    pub async fn turn_off(&self) -> Result<()> {
        let current = self.state().brightness;
        if current > 0 {
            *self.last_brightness.lock().unwrap() = Some(current);
        }

        self.client().turn_off().await?;
        self.coordinator.request_refresh().await;
        Ok(())
    }

    /// Activate an effect by name using the current plugin map
    pub async fn set_effect(&self, name: &str) -> Result<PluginId> {
        let id = self.apply_effect(name).await?;
        self.coordinator.request_refresh().await;
        Ok(id)
    }

    async fn apply_effect(&self, name: &str) -> Result<PluginId> {
        let Some(id) = self.state().plugin_id(name) else {
            tracing::error!("Effect {} not found", name);
            return Err(ObegransadError::UnknownPlugin(name.to_string()));
        };
        self.client().set_plugin(id).await?;
        tracing::info!("Effect {} applied", name);
        Ok(id)
    }

    // ========== Select ==========

    /// Activate a plugin by name, resolved against fresh device info
    pub async fn select_plugin(&self, name: &str) -> Result<PluginId> {
        let id = self.client().set_plugin_by_name(name).await?;
        tracing::info!("Plugin changed to {}", name);
        self.coordinator.request_refresh().await;
        Ok(id)
    }

    // ========== Messages ==========

    /// Show a message on top of the default message effect
    ///
    /// Failing to switch effect is logged; the message is sent regardless.
    pub async fn notify(&self, message: Message) -> Result<()> {
        let effect = &self.settings.default_message_effect;
        if let Err(e) = self.client().set_plugin_by_name(effect).await {
            tracing::warn!("Could not switch to message effect {}: {}", effect, e);
        }

        self.client().send_message(&message).await?;
        tracing::info!(
            "Message sent: {} (repeat: {}, delay: {})",
            message.text,
            message.repeat,
            message.delay
        );
        self.coordinator.request_refresh().await;
        Ok(())
    }

    pub async fn remove_message(&self, message_id: &str) -> Result<()> {
        self.client().remove_message(message_id).await
    }

    // ========== Schedule ==========

    pub async fn set_schedule(&self, entries: &[ScheduleEntry]) -> Result<()> {
        self.client().set_schedule(entries).await?;
        self.coordinator.request_refresh().await;
        Ok(())
    }

    pub async fn start_schedule(&self) -> Result<()> {
        self.client().start_schedule().await?;
        tracing::info!("Schedule started");
        self.coordinator.request_refresh().await;
        Ok(())
    }

    pub async fn stop_schedule(&self) -> Result<()> {
        self.client().stop_schedule().await?;
        tracing::info!("Schedule stopped");
        self.coordinator.request_refresh().await;
        Ok(())
    }

    pub async fn clear_schedule(&self) -> Result<()> {
        self.client().clear_schedule().await?;
        tracing::info!("Schedule cleared");
        self.coordinator.request_refresh().await;
        Ok(())
    }

    pub async fn clear_storage(&self) -> Result<()> {
        self.client().clear_storage().await?;
        tracing::info!("Device storage cleared");
        self.coordinator.request_refresh().await;
        Ok(())
    }

    // ========== WebSocket commands ==========

    /// Rotate the display a quarter turn
    pub async fn rotate(&self, direction: RotateDirection) -> Result<()> {
        let channel = self.websocket_or("rotate requires the WebSocket channel")?;
        if !channel.rotate_display(direction).await {
            tracing::error!("Failed to rotate display {:?}", direction);
            return Err(ObegransadError::ConnectionClosed);
        }
        channel.request_info().await;
        tracing::info!("Display rotated {:?}", direction);
        self.coordinator.request_refresh().await;
        Ok(())
    }

    /// Keep the current plugin after a reboot
    pub async fn persist_plugin(&self) -> Result<()> {
        let channel = self.websocket_or("persist_plugin requires the WebSocket channel")?;
        if !channel.persist_plugin().await {
            tracing::error!("Failed to persist plugin");
            return Err(ObegransadError::ConnectionClosed);
        }
        channel.request_info().await;
        tracing::info!("Plugin persisted");
        self.coordinator.request_refresh().await;
        Ok(())
    }

    /// Stream one raw frame to a device in `WSBINARY` mode
    pub async fn send_frame(&self, data: &[u8]) -> Result<()> {
        let channel = self.websocket_or("send_frame requires the WebSocket channel")?;
        let state = self.state();
        channel.set_dimensions(state.rows, state.cols);
        if data.len() != state.pixel_count() {
            return Err(ObegransadError::validation(format!(
                "frame has {} bytes, display needs {}",
                data.len(),
                state.pixel_count()
            )));
        }
        if !channel.send_binary(data).await {
            return Err(ObegransadError::ConnectionClosed);
        }
        Ok(())
    }

    // ========== Display ==========

    /// Current display contents, sized to the device's matrix
    pub async fn display_frame(&self) -> Result<DisplayFrame> {
        let frame = self.client().get_display_data().await?;
        let state = self.state();
        Ok(DisplayFrame::new(state.rows, state.cols, frame.data).normalized())
    }
}

impl Drop for Obegransad {
    fn drop(&mut self) {
        self.coordinator.abort();
        if let Some(channel) = &self.websocket {
            channel.close();
        }
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, Push};
    use serde_json::json;

    fn info(brightness: u8) -> serde_json::Value {
        json!({
            "plugins": [
                {"name": "Snake", "id": 3},
                {"name": "Rain", "id": 5},
                {"name": "DDP", "id": 9}
            ],
            "plugin": 5,
            "brightness": brightness
        })
    }

    fn queries(device: &FakeDevice, path: &str) -> Vec<String> {
        device
            .requests()
            .into_iter()
            .filter(|r| r.path == path)
            .map(|r| r.query.unwrap_or_default())
            .collect()
    }

    #[tokio::test]
    async fn setup_fails_for_unreachable_device() {
        let device = FakeDevice::start(info(10)).await;
        device.set_failure(Some(500));

        let result = Obegransad::setup(Settings::new(device.host())).await;
        assert!(matches!(result, Err(ObegransadError::Setup(_))));
    }

    #[tokio::test]
    async fn setup_rejects_invalid_settings() {
        let result = Obegransad::setup(Settings::new("")).await;
        assert!(matches!(result, Err(ObegransadError::Validation(_))));
    }

    #[tokio::test]
    async fn turn_on_restores_brightness_from_before_turn_off() {
        let device = FakeDevice::start(info(128)).await;
        let lamp = Obegransad::setup(Settings::new(device.host())).await.unwrap();

        lamp.turn_off().await.unwrap();
        lamp.turn_on(TurnOn::default()).await.unwrap();

        assert_eq!(queries(&device, "/api/brightness"), vec!["value=0", "value=128"]);
        lamp.unload().await;
    }

    #[tokio::test]
    async fn plain_turn_on_defaults_to_full_brightness() {
        let device = FakeDevice::start(info(0)).await;
        let lamp = Obegransad::setup(Settings::new(device.host())).await.unwrap();

        lamp.turn_on(TurnOn::default()).await.unwrap();

        assert_eq!(queries(&device, "/api/brightness"), vec!["value=255"]);
        lamp.unload().await;
    }

    #[tokio::test]
    async fn effect_turn_on_lights_an_off_display() {
        let device = FakeDevice::start(info(0)).await;
        let lamp = Obegransad::setup(Settings::new(device.host())).await.unwrap();

        lamp.turn_on(TurnOn::effect("Snake")).await.unwrap();

        assert_eq!(queries(&device, "/api/plugin"), vec!["id=3"]);
        assert_eq!(queries(&device, "/api/brightness"), vec!["value=255"]);
        lamp.unload().await;
    }

    #[tokio::test]
    async fn effect_turn_on_keeps_brightness_when_lit() {
        let device = FakeDevice::start(info(90)).await;
        let lamp = Obegransad::setup(Settings::new(device.host())).await.unwrap();

        lamp.turn_on(TurnOn::effect("Snake")).await.unwrap();
        lamp.turn_on(TurnOn::brightness(40)).await.unwrap();

        assert_eq!(queries(&device, "/api/plugin"), vec!["id=3"]);
        assert_eq!(queries(&device, "/api/brightness"), vec!["value=40"]);
        lamp.unload().await;
    }

    #[tokio::test]
    async fn unknown_effect_is_rejected_without_request() {
        let device = FakeDevice::start(info(90)).await;
        let lamp = Obegransad::setup(Settings::new(device.host())).await.unwrap();

        let err = lamp.set_effect("Tetris").await.unwrap_err();

        assert!(matches!(err, ObegransadError::UnknownPlugin(_)));
        assert_eq!(device.count_requests("/api/plugin"), 0);
        lamp.unload().await;
    }

    #[tokio::test]
    async fn notify_switches_to_message_effect_first() {
        let device = FakeDevice::start(info(90)).await;
        let lamp = Obegransad::setup(Settings::new(device.host())).await.unwrap();

        lamp.notify(Message::new("Hello").with_id("greeting")).await.unwrap();

        let paths: Vec<_> = device
            .requests()
            .into_iter()
            .map(|r| r.path)
            .filter(|p| p != "/api/info")
            .collect();
        assert_eq!(paths, vec!["/api/plugin", "/api/message"]);
        assert_eq!(queries(&device, "/api/plugin"), vec!["id=9"]);
        lamp.unload().await;
    }

    #[tokio::test]
    async fn notify_sends_even_without_message_effect() {
        let device = FakeDevice::start(json!({"plugins": [{"name": "Rain", "id": 5}], "brightness": 9})).await;
        let lamp = Obegransad::setup(Settings::new(device.host())).await.unwrap();

        lamp.notify(Message::new("Hello")).await.unwrap();

        assert_eq!(device.count_requests("/api/plugin"), 0);
        assert_eq!(device.count_requests("/api/message"), 1);
        lamp.unload().await;
    }

    #[tokio::test]
    async fn schedule_buttons_refresh_state() {
        let device = FakeDevice::start(info(90)).await;
        let lamp = Obegransad::setup(Settings::new(device.host())).await.unwrap();
        let polls = device.count_requests("/api/info");

        lamp.start_schedule().await.unwrap();
        lamp.stop_schedule().await.unwrap();

        assert_eq!(device.count_requests("/api/startschedule"), 1);
        assert_eq!(device.count_requests("/api/stopschedule"), 1);
        assert_eq!(device.count_requests("/api/info"), polls + 2);
        lamp.unload().await;
    }

    #[tokio::test]
    async fn websocket_commands_need_enabled_channel() {
        let device = FakeDevice::start(info(90)).await;
        let lamp = Obegransad::setup(Settings::new(device.host())).await.unwrap();

        assert!(matches!(
            lamp.rotate(RotateDirection::Right).await,
            Err(ObegransadError::NotSupported(_))
        ));
        assert!(matches!(
            lamp.persist_plugin().await,
            Err(ObegransadError::NotSupported(_))
        ));
        lamp.unload().await;
    }

    #[tokio::test]
    async fn rotate_over_websocket_requests_info() {
        let device = FakeDevice::start(info(90)).await;
        let lamp = Obegransad::setup(Settings::new(device.host()).with_websocket(true))
            .await
            .unwrap();

        lamp.rotate(RotateDirection::Right).await.unwrap();

        assert!(device.wait_for(|d| d.ws_received().len() >= 2).await);
        let received = device.ws_received();
        assert_eq!(
            received[0],
            InboundMessage::Json(json!({"event": "rotate", "direction": "right"}))
        );
        assert_eq!(received[1], InboundMessage::Json(json!({"event": "info"})));
        lamp.unload().await;
    }

    #[tokio::test]
    async fn websocket_push_triggers_poll() {
        let device = FakeDevice::start(info(90)).await;
        let lamp = Obegransad::setup(Settings::new(device.host()).with_websocket(true))
            .await
            .unwrap();
        assert!(device.wait_for(|d| d.ws_connections() == 1).await);
        let polls = device.count_requests("/api/info");

        device.set_info(info(12));
        let mut refreshed = false;
        for _ in 0..100 {
            device.push(Push::Text(json!({"event": "info"}).to_string()));
            if lamp.state().brightness == 12 {
                refreshed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(refreshed);
        assert!(device.count_requests("/api/info") > polls);
        lamp.unload().await;
    }

    #[tokio::test]
    async fn send_frame_checks_matrix_size() {
        let device = FakeDevice::start(info(90)).await;
        let lamp = Obegransad::setup(Settings::new(device.host()).with_websocket(true))
            .await
            .unwrap();

        assert!(matches!(
            lamp.send_frame(&[0; 100]).await,
            Err(ObegransadError::Validation(_))
        ));
        lamp.send_frame(&[3; 256]).await.unwrap();
        assert!(device
            .wait_for(|d| d.ws_received().contains(&InboundMessage::Binary(vec![3; 256])))
            .await);
        lamp.unload().await;
    }

    #[tokio::test]
    async fn display_frame_is_normalized() {
        let device = FakeDevice::start(info(90)).await;
        device.set_display(vec![5; 100]);
        let lamp = Obegransad::setup(Settings::new(device.host())).await.unwrap();

        let frame = lamp.display_frame().await.unwrap();

        assert_eq!(frame.data.len(), 256);
        assert_eq!(frame.pixel(0, 0), Some(5));
        assert_eq!(frame.pixel(15, 15), Some(0));
        lamp.unload().await;
    }

    #[tokio::test]
    async fn dropping_device_stops_background_tasks() {
        let device = FakeDevice::start(info(90)).await;
        let settings = Settings::new(device.host())
            .with_scan_interval(1)
            .with_websocket(true);
        let lamp = Obegransad::setup(settings).await.unwrap();
        assert!(device.wait_for(|d| d.ws_connections() == 1).await);
        let channel = lamp.websocket().unwrap().clone();

        drop(lamp);
        let polls = device.count_requests("/api/info");
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(device.count_requests("/api/info"), polls);
        assert!(channel.is_closing());
        assert_eq!(Arc::strong_count(&channel), 1);
        assert_eq!(device.ws_connections(), 1);
    }

    #[tokio::test]
    async fn unload_stops_polling_and_socket() {
        let device = FakeDevice::start(info(90)).await;
        let settings = Settings::new(device.host()).with_websocket(true);
        let lamp = Obegransad::setup(settings).await.unwrap();
        assert!(device.wait_for(|d| d.ws_connections() == 1).await);

        lamp.unload().await;

        assert!(!lamp.coordinator().is_running());
        let channel = lamp.websocket().unwrap();
        assert!(channel.is_closing());
        assert!(!channel.is_connected());
        assert!(lamp.is_available());
    }
}
