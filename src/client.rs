use crate::error::{ObegransadError, Result};
use crate::settings::Settings;
use crate::types::{
    Brightness, DeviceInfo, DisplayFrame, Message, PluginId, RotateDirection, ScheduleEntry,
    DEFAULT_MATRIX_SIZE,
};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// REST client for an OBEGRÄNSAD device
///
/// Translates typed operations into requests against `http://{host}/api/{endpoint}`.
/// The client holds no device state. Every failure (transport, status code,
/// malformed body, rejected input) is logged here and returned as an
/// [`ObegransadError`], so callers only ever see a value or a reason.
#[derive(Clone)]
pub struct DeviceClient {
    host: String,
    base_url: String,
    http: reqwest::Client,
}

impl DeviceClient {
    /// Create a client for `host` with the default 10 second timeout
    pub fn new(host: impl Into<String>) -> Result<Self> {
        Self::with_timeout(host, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(host: impl Into<String>, timeout: Duration) -> Result<Self> {
        let host = host.into();
        let base_url = format!("http://{}/api", host);
        tracing::debug!("Creating REST client for {}", base_url);

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            host,
            base_url,
            http,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::with_timeout(settings.host.clone(), settings.request_timeout())
    }

    /// Host this client talks to
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    /// Perform a request and parse the JSON body, logging any failure
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let result = self.try_request(method.clone(), endpoint, query, body).await;
        if let Err(e) = &result {
            tracing::error!("{} {} failed: {}", method, self.url(endpoint), e);
        }
        result
    }

    async fn try_request(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let bytes = self.send(method, endpoint, query, body).await?;
        let value = serde_json::from_slice(&bytes).map_err(|e| {
            ObegransadError::InvalidResponse(format!(
                "non-JSON body from {}: {} ({})",
                endpoint,
                String::from_utf8_lossy(&bytes),
                e
            ))
        })?;
        tracing::debug!("Response from {}: {}", endpoint, value);
        Ok(value)
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Vec<u8>> {
        let url = self.url(endpoint);
        tracing::debug!("Making {} request to {} with params: {:?}", method, url, query);

        let mut builder = self.http.request(method, &url);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        tracing::debug!("Received response with status {} from {}", status, url);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ObegransadError::Status {
                status: status.as_u16(),
                url,
                body,
            });
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Retrieve the full device state
    pub async fn get_info(&self) -> Result<DeviceInfo> {
        let value = self.request(Method::GET, "info", &[], None).await?;
        serde_json::from_value(value).map_err(|e| {
            tracing::error!("Malformed device info: {}", e);
            ObegransadError::InvalidResponse(format!("malformed device info: {}", e))
        })
    }

    /// Set display brightness, 0 turns the display off
    pub async fn set_brightness(&self, value: Brightness) -> Result<()> {
        tracing::debug!("Setting brightness to {}", value);
        self.request(Method::PATCH, "brightness", &[("value", value.to_string())], None)
            .await?;
        Ok(())
    }

    pub async fn turn_on(&self) -> Result<()> {
        self.set_brightness(Brightness::MAX).await
    }

    pub async fn turn_off(&self) -> Result<()> {
        self.set_brightness(0).await
    }

    /// Activate the plugin with the given id
    pub async fn set_plugin(&self, id: PluginId) -> Result<()> {
        tracing::debug!("Setting plugin with id {}", id);
        self.request(Method::PATCH, "plugin", &[("id", id.to_string())], None)
            .await?;
        Ok(())
    }

    /// Resolve `name` against the device's current plugin list and activate it
    ///
    /// When the device lists the same name twice the last entry wins, matching
    /// how the coordinator builds its plugin map.
    pub async fn set_plugin_by_name(&self, name: &str) -> Result<PluginId> {
        let info = self.get_info().await?;
        let Some(id) = info.plugins.iter().rev().find(|p| p.name == name).map(|p| p.id) else {
            tracing::error!("Plugin {:?} not found on device", name);
            return Err(ObegransadError::UnknownPlugin(name.to_string()));
        };
        self.set_plugin(id).await?;
        Ok(id)
    }

    /// Scroll a message across the display
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        if let Err(e) = message.validate() {
            tracing::error!("Rejected message: {}", e);
            return Err(e);
        }
        self.request(Method::GET, "message", &message.query(), None).await?;
        Ok(())
    }

    /// Remove a previously sent message by id
    pub async fn remove_message(&self, message_id: &str) -> Result<()> {
        if message_id.trim().is_empty() {
            tracing::error!("Cannot remove message without an id");
            return Err(ObegransadError::validation("message id is required"));
        }
        self.request(Method::GET, "removemessage", &[("id", message_id.to_string())], None)
            .await?;
        Ok(())
    }

    /// Raw display buffer, one brightness byte per pixel
    ///
    /// The frame is sized for the stock 16x16 matrix and not normalized.
    pub async fn get_display_data(&self) -> Result<DisplayFrame> {
        let result = self.send(Method::GET, "data", &[], None).await;
        match result {
            Ok(data) if data.is_empty() => {
                tracing::warn!("Empty display data from {}", self.url("data"));
                Err(ObegransadError::InvalidResponse("empty display data".to_string()))
            }
            Ok(data) => Ok(DisplayFrame::new(DEFAULT_MATRIX_SIZE, DEFAULT_MATRIX_SIZE, data)),
            Err(e) => {
                tracing::error!("GET {} failed: {}", self.url("data"), e);
                Err(e)
            }
        }
    }

    /// Replace the device schedule
    pub async fn set_schedule(&self, entries: &[ScheduleEntry]) -> Result<()> {
        let body = serde_json::to_value(entries)?;
        self.request(Method::POST, "schedule", &[], Some(&body)).await?;
        Ok(())
    }

    pub async fn start_schedule(&self) -> Result<()> {
        self.request(Method::GET, "startschedule", &[], None).await?;
        Ok(())
    }

    pub async fn stop_schedule(&self) -> Result<()> {
        self.request(Method::GET, "stopschedule", &[], None).await?;
        Ok(())
    }

    pub async fn clear_schedule(&self) -> Result<()> {
        self.request(Method::GET, "clearschedule", &[], None).await?;
        Ok(())
    }

    /// Wipe persisted settings on the device
    pub async fn clear_storage(&self) -> Result<()> {
        self.request(Method::GET, "clearstorage", &[], None).await?;
        Ok(())
    }

    /// Rotation has no REST endpoint; use the WebSocket channel
    pub async fn rotate_display(&self, direction: RotateDirection) -> Result<()> {
        tracing::warn!("Rotate {:?} is only available over the WebSocket channel", direction);
        Err(ObegransadError::NotSupported("rotate_display requires the WebSocket channel"))
    }

    /// Plugin persistence has no REST endpoint; use the WebSocket channel
    pub async fn persist_plugin(&self) -> Result<()> {
        tracing::warn!("Persist plugin is only available over the WebSocket channel");
        Err(ObegransadError::NotSupported("persist_plugin requires the WebSocket channel"))
    }
}
