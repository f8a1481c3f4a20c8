use crate::client::DeviceClient;
use crate::error::{ObegransadError, Result};
use crate::subscription::StateReceiver;
use crate::types::{
    clamp_dimension, Brightness, DeviceInfo, DeviceStatus, Diagnostics, PluginId, ScheduleEntry,
    DEFAULT_EFFECTS,
};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Default time between polls
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Normalized device state, rebuilt from scratch on every successful poll
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorState {
    /// Plugin name to id in device order; a repeated name keeps its first
    /// position and takes the later id
    pub plugin_map: IndexMap<String, PluginId>,
    pub brightness: Brightness,
    pub is_on: bool,
    pub active_plugin_id: Option<PluginId>,
    /// Name of the active plugin, `None` if its id is not in `plugin_map`
    pub active_effect_name: Option<String>,
    pub rotation: u8,
    pub persist_plugin: Option<PluginId>,
    pub schedule_active: bool,
    pub schedule: Vec<ScheduleEntry>,
    pub rows: usize,
    pub cols: usize,
    pub status: DeviceStatus,
    pub diagnostics: Diagnostics,
}

impl CoordinatorState {
    /// Normalize a raw payload
    pub fn from_info(info: DeviceInfo) -> Self {
        let plugin_map: IndexMap<String, PluginId> = info
            .plugins
            .into_iter()
            .map(|plugin| (plugin.name, plugin.id))
            .collect();

        let active_effect_name = info.plugin.and_then(|active| {
            plugin_map
                .iter()
                .find(|(_, id)| **id == active)
                .map(|(name, _)| name.clone())
        });

        Self {
            plugin_map,
            brightness: info.brightness,
            is_on: info.brightness > 0,
            active_plugin_id: info.plugin,
            active_effect_name,
            rotation: info.rotation,
            persist_plugin: info.persist_plugin,
            schedule_active: info.schedule_active,
            schedule: info.schedule,
            rows: clamp_dimension(info.rows),
            cols: clamp_dimension(info.cols),
            status: info.status,
            diagnostics: info.diagnostics,
        }
    }

    /// Brightness as a 0-100 percentage
    pub fn brightness_percent(&self) -> u8 {
        ((u32::from(self.brightness) * 100 + 127) / 255) as u8
    }

    /// Rotation in degrees, `None` if the device reports an unknown value
    pub fn rotation_degrees(&self) -> Option<u16> {
        match self.rotation {
            0..=3 => Some(u16::from(self.rotation) * 90),
            _ => None,
        }
    }

    pub fn schedule_count(&self) -> usize {
        self.schedule.len()
    }

    /// Selectable effect names, falling back to the stock list
    pub fn effect_list(&self) -> Vec<String> {
        if self.plugin_map.is_empty() {
            DEFAULT_EFFECTS.iter().map(|s| s.to_string()).collect()
        } else {
            self.plugin_map.keys().cloned().collect()
        }
    }

    /// Id for an effect name in this snapshot
    pub fn plugin_id(&self, name: &str) -> Option<PluginId> {
        self.plugin_map.get(name).copied()
    }

    /// Number of pixels the display holds
    pub fn pixel_count(&self) -> usize {
        self.rows * self.cols
    }
}

struct Inner {
    client: DeviceClient,
    interval: Duration,
    state_tx: watch::Sender<Arc<CoordinatorState>>,
    last_update_success: AtomicBool,
    /// Serializes polls so snapshots are published in request order
    refresh_lock: tokio::sync::Mutex<()>,
    poller: Mutex<Option<Poller>>,
}

struct Poller {
    stop_tx: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

/// Polling coordinator, the single owner of [`CoordinatorState`]
///
/// A coordinator only exists once its first poll succeeded; [`Coordinator::setup`]
/// fails otherwise. After that a failed poll keeps the last good snapshot
/// visible and only flips [`Coordinator::last_update_success`].
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Perform the first refresh and create the coordinator
    ///
    /// The poll loop is not started; call [`Coordinator::start`].
    pub async fn setup(client: DeviceClient, interval: Duration) -> Result<Self> {
        tracing::info!("Setting up coordinator for {}", client.host());

        let info = client.get_info().await.map_err(|e| {
            tracing::error!("First refresh for {} failed: {}", client.host(), e);
            ObegransadError::Setup(Box::new(e))
        })?;

        let state = CoordinatorState::from_info(info);
        tracing::debug!("Initial state: {:?}", state);
        let (state_tx, _) = watch::channel(Arc::new(state));

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                interval,
                state_tx,
                last_update_success: AtomicBool::new(true),
                refresh_lock: tokio::sync::Mutex::new(()),
                poller: Mutex::new(None),
            }),
        })
    }

    pub fn client(&self) -> &DeviceClient {
        &self.inner.client
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Latest published snapshot
    pub fn state(&self) -> Arc<CoordinatorState> {
        self.inner.state_tx.borrow().clone()
    }

    /// Subscribe to snapshot changes
    pub fn subscribe(&self) -> StateReceiver {
        StateReceiver::new(self.inner.state_tx.subscribe())
    }

    /// Whether the most recent poll reached the device
    pub fn last_update_success(&self) -> bool {
        self.inner.last_update_success.load(Ordering::SeqCst)
    }

    /// Poll the device now and publish the result
    pub async fn refresh(&self) -> Result<Arc<CoordinatorState>> {
        self.inner.refresh().await
    }

    /// Out-of-band poll after a command; failures are logged and the
    /// previous snapshot stays published
    pub async fn request_refresh(&self) {
        if let Err(e) = self.inner.refresh().await {
            tracing::debug!("Requested refresh failed: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.poller.lock().unwrap().is_some()
    }

    /// Start the interval poll loop; a no-op if already running
    pub fn start(&self) {
        let mut poller = self.inner.poller.lock().unwrap();
        if poller.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::debug!("Poll loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        let _ = inner.refresh().await;
                    }
                }
            }
        });

        tracing::info!(
            "Polling {} every {:?}",
            self.inner.client.host(),
            self.inner.interval
        );
        *poller = Some(Poller { stop_tx, handle });
    }

    /// Stop the poll loop without waiting for an in-flight poll
    pub fn abort(&self) {
        if let Some(poller) = self.inner.poller.lock().unwrap().take() {
            let _ = poller.stop_tx.send(());
            poller.handle.abort();
            tracing::debug!("Poll loop aborted");
        }
    }

    /// Stop the poll loop, waiting briefly for an in-flight poll
    pub async fn stop(&self) {
        let poller = self.inner.poller.lock().unwrap().take();
        if let Some(poller) = poller {
            let _ = poller.stop_tx.send(());
            if tokio::time::timeout(Duration::from_millis(500), poller.handle)
                .await
                .is_err()
            {
                tracing::warn!("Poll loop did not stop in time");
            }
        }
    }
}

impl Inner {
    async fn refresh(&self) -> Result<Arc<CoordinatorState>> {
        let _guard = self.refresh_lock.lock().await;

        let info = match self.client.get_info().await {
            Ok(info) => info,
            Err(e) => {
                if self.last_update_success.swap(false, Ordering::SeqCst) {
                    tracing::warn!("Device {} became unreachable: {}", self.client.host(), e);
                }
                return Err(e);
            }
        };

        if !self.last_update_success.swap(true, Ordering::SeqCst) {
            tracing::info!("Device {} is reachable again", self.client.host());
        }

        let next = CoordinatorState::from_info(info);
        self.state_tx.send_if_modified(|current| {
            if **current == next {
                false
            } else {
                tracing::debug!("Publishing new state: {:?}", next);
                *current = Arc::new(next);
                true
            }
        });

        Ok(self.state_tx.borrow().clone())
    }
}
