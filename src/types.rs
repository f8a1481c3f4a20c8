use crate::error::{ObegransadError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Plugin (effect) identifier
pub type PluginId = i64;

/// Brightness value, 0 means off
pub type Brightness = u8;

/// Default matrix edge length
pub const DEFAULT_MATRIX_SIZE: usize = 16;

/// Largest matrix edge length accepted from a device
pub const MAX_MATRIX_SIZE: usize = 64;

/// Effects shipped with the stock firmware, used when the device reports none
pub const DEFAULT_EFFECTS: &[&str] = &[
    "Draw",
    "Breakout",
    "Snake",
    "GameOfLife",
    "Stars",
    "Lines",
    "Circle",
    "Rain",
    "Firework",
    "Big Clock",
    "Clock",
    "PongClock",
    "Ticking Clock",
    "Weather",
    "Animation",
    "DDP",
];

/// A named display mode on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    pub id: PluginId,
}

/// Device-reported operating mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    /// Idle, running a plugin
    #[default]
    None,
    /// Waiting for a binary frame over the WebSocket
    WsBinary,
    /// Firmware update in progress
    Update,
    Loading,
    /// Any status this library does not know about
    #[serde(other)]
    Unknown,
}

impl DeviceStatus {
    /// Status string as reported by the firmware
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::WsBinary => "WSBINARY",
            Self::Update => "UPDATE",
            Self::Loading => "LOADING",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// One plugin-activation rule of the device schedule
///
/// The firmware owns the shape of these entries. `pluginId` and `duration`
/// are modelled; anything else is kept in `extra` so entries survive a
/// read-modify-write cycle unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(rename = "pluginId", default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<PluginId>,

    /// Seconds the plugin stays active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ScheduleEntry {
    pub fn new(plugin_id: PluginId, duration: u64) -> Self {
        Self {
            plugin_id: Some(plugin_id),
            duration: Some(duration),
            extra: BTreeMap::new(),
        }
    }
}

/// Optional diagnostic fields reported by newer firmware
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// WiFi signal strength in dBm
    #[serde(default)]
    pub wifi_rssi: Option<i32>,

    /// Uptime in seconds
    #[serde(default)]
    pub uptime: Option<u64>,

    /// Free heap in bytes
    #[serde(default)]
    pub free_memory: Option<u64>,

    #[serde(default)]
    pub ip_address: Option<String>,

    #[serde(default)]
    pub mac_address: Option<String>,

    #[serde(default)]
    pub weather_location: Option<String>,
}

/// Raw `GET /api/info` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub plugins: Vec<Plugin>,

    /// Currently active plugin
    #[serde(default)]
    pub plugin: Option<PluginId>,

    #[serde(default)]
    pub brightness: Brightness,

    /// Quarter turns, 0-3
    #[serde(default)]
    pub rotation: u8,

    #[serde(rename = "persist-plugin", default)]
    pub persist_plugin: Option<PluginId>,

    #[serde(rename = "scheduleActive", default)]
    pub schedule_active: bool,

    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,

    #[serde(default = "default_matrix_size", deserialize_with = "matrix_dimension")]
    pub rows: usize,

    #[serde(default = "default_matrix_size", deserialize_with = "matrix_dimension")]
    pub cols: usize,

    #[serde(default)]
    pub status: DeviceStatus,

    #[serde(flatten)]
    pub diagnostics: Diagnostics,
}

fn default_matrix_size() -> usize {
    DEFAULT_MATRIX_SIZE
}

/// Bound a matrix edge to `1..=MAX_MATRIX_SIZE`; zero means the default size
pub(crate) fn clamp_dimension(value: usize) -> usize {
    match value {
        0 => DEFAULT_MATRIX_SIZE,
        v if v > MAX_MATRIX_SIZE => {
            tracing::warn!("Matrix dimension {} exceeds {}, clamping", v, MAX_MATRIX_SIZE);
            MAX_MATRIX_SIZE
        }
        v => v,
    }
}

fn matrix_dimension<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u64::deserialize(deserializer)?;
    Ok(clamp_dimension(usize::try_from(value).unwrap_or(usize::MAX)))
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            plugin: None,
            brightness: 0,
            rotation: 0,
            persist_plugin: None,
            schedule_active: false,
            schedule: Vec::new(),
            rows: DEFAULT_MATRIX_SIZE,
            cols: DEFAULT_MATRIX_SIZE,
            status: DeviceStatus::None,
            diagnostics: Diagnostics::default(),
        }
    }
}

/// Display rotation direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotateDirection {
    /// 90 degrees clockwise
    Right,
    /// 90 degrees counter-clockwise
    Left,
}

/// Text (and optional graph) to scroll across the display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub text: String,

    /// Number of times the message scrolls, at least 1
    pub repeat: u32,

    /// Scroll delay in milliseconds
    pub delay: u32,

    pub graph: Option<Vec<i32>>,
    pub miny: Option<i32>,
    pub maxy: Option<i32>,

    /// Identifier used to remove the message later
    pub message_id: Option<String>,
}

impl Message {
    pub const DEFAULT_REPEAT: u32 = 1;
    pub const DEFAULT_DELAY_MS: u32 = 50;

    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            repeat: Self::DEFAULT_REPEAT,
            delay: Self::DEFAULT_DELAY_MS,
            graph: None,
            miny: None,
            maxy: None,
            message_id: None,
        }
    }

    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_delay(mut self, delay_ms: u32) -> Self {
        self.delay = delay_ms;
        self
    }

    /// Attach graph values, optionally bounded by `miny`/`maxy`
    pub fn with_graph(mut self, graph: Vec<i32>, miny: Option<i32>, maxy: Option<i32>) -> Self {
        self.graph = Some(graph);
        self.miny = miny;
        self.maxy = maxy;
        self
    }

    pub fn with_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Parse the comma separated graph notation, e.g. `"1, 2,3"`
    pub fn parse_graph(input: &str) -> Result<Vec<i32>> {
        input
            .split(',')
            .map(|part| {
                part.trim().parse::<i32>().map_err(|_| {
                    ObegransadError::validation(format!("invalid graph value {:?} in {:?}", part, input))
                })
            })
            .collect()
    }

    /// Reject messages the device cannot render
    pub fn validate(&self) -> Result<()> {
        if self.repeat == 0 {
            return Err(ObegransadError::validation("message repeat must be at least 1"));
        }
        if let (Some(miny), Some(maxy)) = (self.miny, self.maxy) {
            if miny > maxy {
                return Err(ObegransadError::validation(format!(
                    "graph bounds inverted: miny {} > maxy {}",
                    miny, maxy
                )));
            }
        }
        Ok(())
    }

    /// Query parameters for `GET /api/message`
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("text", self.text.clone()),
            ("repeat", self.repeat.to_string()),
            ("delay", self.delay.to_string()),
        ];
        if let Some(id) = &self.message_id {
            params.push(("id", id.clone()));
        }
        if let Some(graph) = &self.graph {
            let joined = graph.iter().map(i32::to_string).collect::<Vec<_>>().join(",");
            params.push(("graph", joined));
        }
        if let Some(miny) = self.miny {
            params.push(("miny", miny.to_string()));
        }
        if let Some(maxy) = self.maxy {
            params.push(("maxy", maxy.to_string()));
        }
        params
    }
}

/// Raw pixel buffer read from `GET /api/data`, one brightness byte per LED
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<u8>,
}

impl DisplayFrame {
    /// Dimensions are bounded like device-reported ones
    pub fn new(rows: usize, cols: usize, data: Vec<u8>) -> Self {
        Self {
            rows: clamp_dimension(rows),
            cols: clamp_dimension(cols),
            data,
        }
    }

    /// Number of bytes a complete frame holds
    pub fn expected_len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() == self.expected_len()
    }

    /// Pad with dark pixels or truncate so the frame is exactly rows x cols
    pub fn normalized(mut self) -> Self {
        let expected = self.expected_len();
        if self.data.len() != expected {
            tracing::warn!(
                "Display data has {} bytes, expected {}; normalizing",
                self.data.len(),
                expected
            );
            self.data.resize(expected, 0);
        }
        self
    }

    /// Brightness of the pixel at column `x`, row `y`
    pub fn pixel(&self, x: usize, y: usize) -> Option<u8> {
        if x >= self.cols || y >= self.rows {
            return None;
        }
        self.data.get(y * self.cols + x).copied()
    }

    /// Iterate over rows of the frame
    pub fn rows_iter(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks(self.cols.max(1))
    }
}
