use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReplayConfig {
    pub recording: RecordingConfig,
    pub storage: StorageConfig,
    pub export: ExportConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecordingConfig {
    /// Frames per second delivered by the camera
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Length of the viewing delay in seconds
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: u32,

    /// Length of the replay clip window in seconds
    #[serde(default = "default_replay_seconds")]
    pub replay_seconds: u32,

    /// Rotation applied to every incoming frame, in degrees (0, 90, 180, 270)
    #[serde(default = "default_orientation_degrees")]
    pub orientation_degrees: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Root working directory for buffered frames. Ephemeral: rebuilt on
    /// every reconfiguration and cleared on teardown.
    #[serde(default = "default_storage_root")]
    pub root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExportConfig {
    /// Directory where finished video clips and still images are written
    #[serde(default = "default_export_path")]
    pub path: String,

    /// Target bit rate handed to the external video encoder
    #[serde(default = "default_bit_rate")]
    pub bit_rate: u32,

    /// Write a JSON metadata sidecar next to each exported video
    #[serde(default = "default_save_metadata")]
    pub save_metadata: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Maximum number of frames allowed in the transform/persist stage at
    /// once. Exhaustion is the backpressure signal to the capture layer.
    #[serde(default = "default_max_frames_in_flight")]
    pub max_frames_in_flight: usize,

    /// Capacity of the channel feeding the window mutation task
    #[serde(default = "default_mutation_queue_capacity")]
    pub mutation_queue_capacity: usize,
}

impl ReplayConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("replaycam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("recording.frame_rate", default_frame_rate())?
            .set_default("recording.delay_seconds", default_delay_seconds())?
            .set_default("recording.replay_seconds", default_replay_seconds())?
            .set_default(
                "recording.orientation_degrees",
                default_orientation_degrees() as i64,
            )?
            .set_default("storage.root", default_storage_root())?
            .set_default("export.path", default_export_path())?
            .set_default("export.bit_rate", default_bit_rate())?
            .set_default("export.save_metadata", default_save_metadata())?
            .set_default(
                "system.max_frames_in_flight",
                default_max_frames_in_flight() as i64,
            )?
            .set_default(
                "system.mutation_queue_capacity",
                default_mutation_queue_capacity() as i64,
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with REPLAYCAM_ prefix
            .add_source(Environment::with_prefix("REPLAYCAM").separator("_"))
            .build()?;

        let config: ReplayConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recording.frame_rate == 0 {
            return Err(ConfigError::Message(
                "Recording frame_rate must be greater than 0".to_string(),
            ));
        }

        if self.recording.delay_seconds == 0 {
            return Err(ConfigError::Message(
                "Recording delay_seconds must be greater than 0".to_string(),
            ));
        }

        if self.recording.replay_seconds == 0 {
            return Err(ConfigError::Message(
                "Recording replay_seconds must be greater than 0".to_string(),
            ));
        }

        if !matches!(self.recording.orientation_degrees, 0 | 90 | 180 | 270) {
            return Err(ConfigError::Message(
                "Recording orientation_degrees must be one of 0, 90, 180, 270".to_string(),
            ));
        }

        if self.system.max_frames_in_flight == 0 {
            return Err(ConfigError::Message(
                "System max_frames_in_flight must be greater than 0".to_string(),
            ));
        }

        if self.system.mutation_queue_capacity == 0 {
            return Err(ConfigError::Message(
                "System mutation_queue_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Save the configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> crate::error::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), contents)?;
        info!("Configuration saved to: {}", path.as_ref().display());
        Ok(())
    }

    /// Number of frames the delay window holds when full
    pub fn delay_capacity(&self) -> usize {
        (self.recording.frame_rate * self.recording.delay_seconds) as usize
    }

    /// Number of frames the replay window holds when full
    pub fn replay_capacity(&self) -> usize {
        (self.recording.frame_rate * self.recording.replay_seconds) as usize
    }

    /// Working directory for buffered frame files
    pub fn frame_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.root).join("frames")
    }

    /// Staging directory for in-progress exports
    pub fn export_staging_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.root).join("export")
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            recording: RecordingConfig {
                frame_rate: default_frame_rate(),
                delay_seconds: default_delay_seconds(),
                replay_seconds: default_replay_seconds(),
                orientation_degrees: default_orientation_degrees(),
            },
            storage: StorageConfig {
                root: default_storage_root(),
            },
            export: ExportConfig {
                path: default_export_path(),
                bit_rate: default_bit_rate(),
                save_metadata: default_save_metadata(),
            },
            system: SystemConfig {
                max_frames_in_flight: default_max_frames_in_flight(),
                mutation_queue_capacity: default_mutation_queue_capacity(),
            },
        }
    }
}

// Default value functions
fn default_frame_rate() -> u32 {
    30
}
fn default_delay_seconds() -> u32 {
    10
}
fn default_replay_seconds() -> u32 {
    5
}
fn default_orientation_degrees() -> u16 {
    0
}
fn default_storage_root() -> String {
    "./replaycam_work".to_string()
}
fn default_export_path() -> String {
    "./exports".to_string()
}
fn default_bit_rate() -> u32 {
    6_000_000
}
fn default_save_metadata() -> bool {
    true
}
fn default_max_frames_in_flight() -> usize {
    16
}
fn default_mutation_queue_capacity() -> usize {
    256
}
