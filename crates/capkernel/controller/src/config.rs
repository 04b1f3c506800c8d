//! Configuration for the controller and the `capkernel` binary

use std::path::PathBuf;

use capkernel_kernel::KernelConfig;
use capkernel_store::{JournalConfig, SyncMode};
use capkernel_types::VatOptions;
use serde::{Deserialize, Serialize};

/// Main controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Kernel-wide settings
    #[serde(default)]
    pub kernel: KernelConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Vat whose root receives the bootstrap delivery
    #[serde(default)]
    pub bootstrap: Option<String>,

    /// First argument of the bootstrap delivery
    #[serde(default)]
    pub argv: Vec<String>,

    /// Genesis vats, in ID order
    #[serde(default)]
    pub vats: Vec<VatConfig>,

    /// Built-in devices to install
    #[serde(default)]
    pub devices: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            kernel: KernelConfig::default(),
            logging: LoggingConfig::default(),
            bootstrap: None,
            argv: Vec::new(),
            vats: Vec::new(),
            devices: Vec::new(),
        }
    }
}

/// One genesis vat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatConfig {
    pub name: String,

    /// Module name, resolved through a [`crate::ModuleRegistry`]
    pub module: String,

    #[serde(default)]
    pub options: VatOptions,
}

impl VatConfig {
    pub fn new(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            options: VatOptions::default(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    Memory,

    /// Crash-recoverable journal directory
    Journal {
        dir: PathBuf,

        #[serde(default)]
        sync_mode: SyncMode,

        /// Segment size that triggers rotation
        #[serde(default = "default_max_segment_size")]
        max_segment_size: u64,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

impl StorageConfig {
    pub fn journal(dir: impl Into<PathBuf>) -> Self {
        StorageConfig::Journal {
            dir: dir.into(),
            sync_mode: SyncMode::default(),
            max_segment_size: default_max_segment_size(),
        }
    }

    /// Journal settings, if this is a journal backend.
    pub fn journal_config(&self) -> Option<JournalConfig> {
        match self {
            StorageConfig::Memory => None,
            StorageConfig::Journal {
                sync_mode,
                max_segment_size,
                ..
            } => Some(JournalConfig {
                sync_mode: *sync_mode,
                max_segment_size: *max_segment_size,
                ..JournalConfig::default()
            }),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, or any `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_segment_size() -> u64 {
    JournalConfig::default().max_segment_size
}

impl ControllerConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `CAPKERNEL_` environment variables (`CAPKERNEL_LOGGING__LEVEL=debug`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&ControllerConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CAPKERNEL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Install the built-in demo genesis: a bootstrap vat wired to a
    /// counter, an echo vat and both built-in devices.
    pub fn with_demo_genesis(mut self) -> Self {
        self.bootstrap = Some("bootstrap".to_string());
        self.vats = vec![
            VatConfig::new("bootstrap", "demo-bootstrap"),
            VatConfig::new("counter", "demo-counter"),
            VatConfig::new("echo", "demo-echo"),
        ];
        self.devices = vec!["bridge".to_string(), "clock".to_string()];
        self
    }
}
