//! Configuration file support for avrflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (AVRFLASH_*)
//! 3. Local config file (./avrflash.toml)
//! 4. Global config file (~/.config/avrflash/config.toml)
//!
//! Remembered USB devices live next to the config in `ports.toml`
//! (or `./avrflash_ports.toml` when a local config exists).

use anyhow::Context;
use avrflash::Timeouts;
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::CliError;

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "avrflash.toml";

/// Local remembered-ports file name.
pub const LOCAL_PORTS: &str = "avrflash_ports.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashSection {
    /// Board preset name.
    pub board: Option<String>,
    /// Start of the protected bootloader region.
    pub bootloader_start: Option<u32>,
    /// Flash page size in bytes.
    pub page_size: Option<usize>,
    /// Number of sync attempts.
    pub sync_retries: Option<u32>,
    /// Pause between sync attempts, in milliseconds.
    pub sync_delay_ms: Option<u64>,
    /// Do not pulse DTR/RTS before syncing.
    #[serde(default)]
    pub no_reset: bool,
    /// Per-command acknowledgment budgets.
    #[serde(default)]
    pub timeouts: TimeoutSection,
}

/// Acknowledgment budgets in milliseconds (`[flash.timeouts]`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSection {
    /// Sync handshake, per attempt.
    pub sync_ms: Option<u64>,
    /// Enter programming mode.
    pub enter_ms: Option<u64>,
    /// Load address.
    pub load_address_ms: Option<u64>,
    /// Program page.
    pub program_page_ms: Option<u64>,
    /// Leave programming mode.
    pub leave_ms: Option<u64>,
}

impl TimeoutSection {
    /// Replace every budget set in `other`.
    fn merge(&mut self, other: Self) {
        let fields = [
            (&mut self.sync_ms, other.sync_ms),
            (&mut self.enter_ms, other.enter_ms),
            (&mut self.load_address_ms, other.load_address_ms),
            (&mut self.program_page_ms, other.program_page_ms),
            (&mut self.leave_ms, other.leave_ms),
        ];
        for (slot, value) in fields {
            if value.is_some() {
                *slot = value;
            }
        }
    }

    /// Apply the configured budgets over `base`.
    pub fn apply(&self, base: Timeouts) -> Timeouts {
        let ms = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_millis);
        Timeouts {
            sync: ms(self.sync_ms, base.sync),
            enter: ms(self.enter_ms, base.enter),
            load_address: ms(self.load_address_ms, base.load_address),
            program_page: ms(self.program_page_ms, base.program_page),
            leave: ms(self.leave_ms, base.leave),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashSection,
}

impl Config {
    /// Load configuration from all available sources.
    ///
    /// Unreadable files are reported and skipped.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        // Remembered USB devices
        if let Some(devices) = Self::load_ports_config() {
            config
                .port
                .usb_device
                .extend(devices.usb_device);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// Unlike [`Config::load`], a missing or invalid file is an error.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        let config = toml::from_str(&content).map_err(|e| {
            CliError::Config(format!("Invalid config file {}: {e}", path.display()))
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Load remembered USB devices.
    fn load_ports_config() -> Option<PortConfig> {
        let local_path = Path::new(LOCAL_PORTS);
        let global_path = Self::global_config_dir().map(|dir| dir.join("ports.toml"));

        [Some(local_path.to_path_buf()), global_path]
            .into_iter()
            .flatten()
            .filter(|path| path.exists())
            .find_map(|path| {
                let content = fs::read_to_string(&path).ok()?;
                let ports = toml::from_str(&content).ok()?;
                debug!("Loaded ports config from {}", path.display());
                Some(ports)
            })
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "avrflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Port config
        if other.port.connection.serial.is_some() {
            self.port.connection.serial = other.port.connection.serial;
        }
        if other.port.connection.baud.is_some() {
            self.port.connection.baud = other.port.connection.baud;
        }
        self.port
            .usb_device
            .extend(other.port.usb_device);

        // Flash config
        if other.flash.board.is_some() {
            self.flash.board = other.flash.board;
        }
        if other.flash.bootloader_start.is_some() {
            self.flash.bootloader_start = other.flash.bootloader_start;
        }
        if other.flash.page_size.is_some() {
            self.flash.page_size = other.flash.page_size;
        }
        if other.flash.sync_retries.is_some() {
            self.flash.sync_retries = other.flash.sync_retries;
        }
        if other.flash.sync_delay_ms.is_some() {
            self.flash.sync_delay_ms = other.flash.sync_delay_ms;
        }
        self.flash
            .timeouts
            .merge(other.flash.timeouts);
        if other.flash.no_reset {
            self.flash.no_reset = true;
        }
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };

        // Don't add duplicates
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        // Try to save to local file first, fall back to global
        let path = if Path::new(LOCAL_PORTS).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)
                .with_context(|| format!("Failed to create {}", global_dir.display()))?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        self.port
            .usb_device
            .push(device);

        let remembered = PortConfig {
            connection: ConnectionConfig::default(),
            usb_device: self
                .port
                .usb_device
                .clone(),
        };
        let content = toml::to_string_pretty(&remembered)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.port.connection.serial.is_none());
        assert!(config.port.connection.baud.is_none());
        assert!(config.port.usb_device.is_empty());
        assert!(config.flash.board.is_none());
        assert!(config.flash.bootloader_start.is_none());
        assert!(config.flash.sync_delay_ms.is_none());
        assert_eq!(config.flash.timeouts, TimeoutSection::default());
        assert!(!config.flash.no_reset);
    }

    // ---- UsbDevice ----

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x1A86,
            pid: 0x7523,
        };
        assert!(device.matches(0x1A86, 0x7523));
        assert!(!device.matches(0x1A86, 0x7522));
        assert!(!device.matches(0x2341, 0x7523));
    }

    // ---- Config merge ----

    #[test]
    fn test_config_merge_overrides() {
        let mut base = Config::default();
        base.port.connection.baud = Some(57600);

        let mut other = Config::default();
        other.port.connection.serial = Some("/dev/ttyACM0".to_string());
        other.port.connection.baud = Some(115200);
        other.flash.board = Some("uno".to_string());
        other.flash.page_size = Some(64);

        base.merge(other);

        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.port.connection.baud, Some(115200));
        assert_eq!(base.flash.board.as_deref(), Some("uno"));
        assert_eq!(base.flash.page_size, Some(64));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.port.connection.serial = Some("/dev/ttyUSB0".to_string());
        base.flash.bootloader_start = Some(0x7E00);
        base.flash.no_reset = true;
        base.flash.sync_delay_ms = Some(100);
        base.flash.timeouts.program_page_ms = Some(2000);

        base.merge(Config::default());

        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.flash.bootloader_start, Some(0x7E00));
        assert!(base.flash.no_reset);
        assert_eq!(base.flash.sync_delay_ms, Some(100));
        assert_eq!(base.flash.timeouts.program_page_ms, Some(2000));
    }

    #[test]
    fn test_config_merge_timeouts_per_field() {
        let mut base = Config::default();
        base.flash.timeouts.sync_ms = Some(300);
        base.flash.timeouts.program_page_ms = Some(1500);

        let mut other = Config::default();
        other.flash.timeouts.program_page_ms = Some(3000);
        other.flash.sync_delay_ms = Some(50);

        base.merge(other);

        assert_eq!(base.flash.timeouts.sync_ms, Some(300));
        assert_eq!(base.flash.timeouts.program_page_ms, Some(3000));
        assert_eq!(base.flash.sync_delay_ms, Some(50));
    }

    #[test]
    fn test_timeout_section_apply() {
        let section = TimeoutSection {
            program_page_ms: Some(2500),
            leave_ms: Some(100),
            ..TimeoutSection::default()
        };
        let timeouts = section.apply(Timeouts::default());
        assert_eq!(timeouts.program_page, Duration::from_millis(2500));
        assert_eq!(timeouts.leave, Duration::from_millis(100));
        assert_eq!(timeouts.sync, Timeouts::default().sync);
        assert_eq!(timeouts.load_address, Timeouts::default().load_address);
    }

    #[test]
    fn test_config_merge_usb_devices_extend() {
        let mut base = Config::default();
        base.port.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x7523 });

        let mut other = Config::default();
        other.port.usb_device.push(UsbDevice { vid: 0x2341, pid: 0x0043 });

        base.merge(other);
        assert_eq!(base.port.usb_device.len(), 2);
    }

    // ---- TOML ----

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[port.connection]
serial = "/dev/ttyACM0"
baud = 115200

[[port.usb_device]]
vid = 0x2341
pid = 0x0043

[flash]
board = "uno"
bootloader_start = 0x7E00
page_size = 128
sync_retries = 10
sync_delay_ms = 400
no_reset = true

[flash.timeouts]
sync_ms = 800
program_page_ms = 2000
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.port.connection.baud, Some(115200));
        assert_eq!(config.port.usb_device[0].vid, 0x2341);
        assert_eq!(config.flash.board.as_deref(), Some("uno"));
        assert_eq!(config.flash.bootloader_start, Some(0x7E00));
        assert_eq!(config.flash.page_size, Some(128));
        assert_eq!(config.flash.sync_retries, Some(10));
        assert!(config.flash.no_reset);
        assert_eq!(config.flash.sync_delay_ms, Some(400));
        assert_eq!(config.flash.timeouts.sync_ms, Some(800));
        assert_eq!(config.flash.timeouts.program_page_ms, Some(2000));
        assert!(config.flash.timeouts.enter_ms.is_none());
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.port.connection.serial.is_none());
        assert!(config.flash.board.is_none());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let mut config = Config::default();
        config.port.connection.serial = Some("COM3".to_string());
        config.flash.board = Some("atmega168".to_string());
        config.port.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x7523 });

        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(deserialized.port.connection.serial.as_deref(), Some("COM3"));
        assert_eq!(deserialized.flash.board.as_deref(), Some("atmega168"));
        assert_eq!(deserialized.port.usb_device.len(), 1);
    }

    // ---- load_from_path ----

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[port.connection]\nserial = \"/dev/ttyUSB1\"\n[flash]\nboard = \"nano-old\"\n")
            .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.flash.board.as_deref(), Some("nano-old"));
    }

    #[test]
    fn test_load_from_path_nonexistent_is_config_error() {
        let err = Config::load_from_path(Path::new("/nonexistent/path/config.toml")).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Config(_))));
    }

    #[test]
    fn test_load_from_path_invalid_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Config(_))));
    }

    #[test]
    fn test_load_from_file_invalid_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[flash\nboard = ").unwrap();
        assert!(Config::load_from_file(&path).is_none());
    }

    // ---- global_config_path ----

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_string_lossy().contains("avrflash"));
            assert!(p.to_string_lossy().ends_with("config.toml"));
        }
    }
}
