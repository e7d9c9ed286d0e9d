use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "tracker_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Downstream tracking server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Local address the UDP socket binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port the tracking server listens on
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Where discovery handshakes are broadcast
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
    /// Broadcast interval while no server is known; 0 disables it
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
    #[serde(default = "default_firmware_name")]
    pub firmware_name: String,
    #[serde(default = "default_firmware_build")]
    pub firmware_build: i32,
    #[serde(default = "default_board_type")]
    pub board_type: i32,
    #[serde(default = "default_mcu_type")]
    pub mcu_type: i32,
    #[serde(default)]
    pub imu_type: i32,
    #[serde(default = "default_mac_address")]
    pub mac_address: [u8; 6],
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            server_port: default_server_port(),
            broadcast_address: default_broadcast_address(),
            discovery_interval_ms: default_discovery_interval_ms(),
            firmware_name: default_firmware_name(),
            firmware_build: default_firmware_build(),
            board_type: default_board_type(),
            mcu_type: default_mcu_type(),
            imu_type: 0,
            mac_address: default_mac_address(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:0".to_string()
}
fn default_server_port() -> u16 {
    6969
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}
fn default_discovery_interval_ms() -> u64 {
    1000
}
fn default_firmware_name() -> String {
    "TrackerBridge".to_string()
}
fn default_firmware_build() -> i32 {
    1
}
fn default_board_type() -> i32 {
    // Vendor board id in the server's board table
    18
}
fn default_mcu_type() -> i32 {
    8
}
fn default_mac_address() -> [u8; 6] {
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Dongle ports opened when the bridge autostarts
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

fn default_baud_rate() -> u32 {
    500_000
}
fn default_read_timeout_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothSettings {
    /// Advertised name prefix of supported trackers
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_false")]
    pub debug_show_all_devices: bool,
    #[serde(default = "default_connect_retries")]
    pub connect_max_retries: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
}

impl Default for BluetoothSettings {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            debug_show_all_devices: false,
            connect_max_retries: default_connect_retries(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
        }
    }
}

fn default_name_prefix() -> String {
    "HaritoraX".to_string()
}
fn default_connect_retries() -> u32 {
    3
}
fn default_connect_retry_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnkleSettings {
    #[serde(default = "default_false")]
    pub enabled: bool,
    #[serde(default = "default_ankle_window")]
    pub window: usize,
    /// Appended to the physical tracker id to name the virtual foot tracker
    #[serde(default = "default_ankle_suffix")]
    pub virtual_suffix: String,
}

impl Default for AnkleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            window: default_ankle_window(),
            virtual_suffix: default_ankle_suffix(),
        }
    }
}

fn default_ankle_window() -> usize {
    crate::domain::ankle::DEFAULT_WINDOW
}
fn default_ankle_suffix() -> String {
    "-ankle".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_socket_name")]
    pub socket_name: String,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_name: default_socket_name(),
        }
    }
}

fn default_socket_name() -> String {
    "tracker_bridge.sock".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub bluetooth: BluetoothSettings,
    #[serde(default)]
    pub ankle: AnkleSettings,
    #[serde(default)]
    pub ipc: IpcSettings,

    /// Start the configured transports on launch
    #[serde(default = "default_false")]
    pub autostart_serial: bool,
    #[serde(default = "default_false")]
    pub autostart_bluetooth: bool,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path, falling back to defaults
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("TrackerBridge");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Remember the serial ports of the last successful start
    pub fn remember_serial_ports(&mut self, ports: &[String]) -> anyhow::Result<()> {
        if self.settings.serial.ports != ports {
            self.settings.serial.ports = ports.to_vec();
            self.save()?;
        }
        Ok(())
    }
}
