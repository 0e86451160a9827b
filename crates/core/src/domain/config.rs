//! Configuration management for Minstrel
//!
//! This module provides:
//! - Application settings for the control plane and the simulated adapters
//! - The domain topology (domains, endpoints, gateways) with TOML serialization
//! - Validation of ids, conversion matrices and gateway endpoints
//! - A manager that only persists validated topologies and sets unusable files aside

use crate::domain::audio::{
    ClassId, ConnectionFormat, Domain, DomainId, DomainState, Gateway, GatewayId, MainVolume,
    Sink, SinkId, SoundProperty, Source, SourceId, Volume,
};
use crate::domain::format::ConversionMatrix;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Worker threads per simulated adapter
    pub worker_threads: usize,

    /// Simulated hardware latency for connect, disconnect, state and property jobs
    pub job_latency_ms: u64,

    /// Interval between volume ramp steps
    pub ramp_tick_ms: u64,

    /// Ramp time used for user volume and mute requests
    pub default_ramp_time_ms: u16,

    /// Ignore gateways that already carry a connection when resolving
    pub only_free_gateways: bool,

    /// Connection formats from most to least preferred
    pub format_priority: Vec<ConnectionFormat>,

    /// Propagation delay reported for every connected hop (None = unknown)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_delay_ms: Option<i16>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker_threads: 10,
            job_latency_ms: 50,
            ramp_tick_ms: 10,
            default_ramp_time_ms: 200,
            only_free_gateways: true,
            format_priority: vec![
                ConnectionFormat::Pcm,
                ConnectionFormat::Stereo,
                ConnectionFormat::Mono,
                ConnectionFormat::Compressed,
                ConnectionFormat::Analog,
                ConnectionFormat::Auto,
            ],
            connection_delay_ms: None,
        }
    }
}

fn default_class() -> u16 {
    1
}

/// Source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: u16,
    pub name: String,
    #[serde(default = "default_class")]
    pub class_id: u16,
    #[serde(default)]
    pub volume: Volume,
    pub formats: Vec<ConnectionFormat>,
    #[serde(default)]
    pub sound_properties: Vec<SoundProperty>,
}

impl SourceConfig {
    pub fn to_source(&self, domain: DomainId) -> Source {
        let mut source = Source::new(SourceId::new(self.id), domain, self.name.clone())
            .with_formats(self.formats.iter().copied());
        source.class_id = ClassId::new(self.class_id);
        source.volume = self.volume;
        for property in &self.sound_properties {
            source.sound_properties.insert(property.kind, property.value);
            source.main_sound_properties.insert(property.kind, property.value);
        }
        source
    }
}

/// Sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub id: u16,
    pub name: String,
    #[serde(default = "default_class")]
    pub class_id: u16,
    #[serde(default)]
    pub volume: Volume,
    #[serde(default)]
    pub main_volume: MainVolume,
    pub formats: Vec<ConnectionFormat>,
    #[serde(default)]
    pub sound_properties: Vec<SoundProperty>,
}

impl SinkConfig {
    pub fn to_sink(&self, domain: DomainId) -> Sink {
        let mut sink = Sink::new(SinkId::new(self.id), domain, self.name.clone())
            .with_formats(self.formats.iter().copied());
        sink.class_id = ClassId::new(self.class_id);
        sink.volume = self.volume;
        sink.main_volume = self.main_volume;
        for property in &self.sound_properties {
            sink.sound_properties.insert(property.kind, property.value);
            sink.main_sound_properties.insert(property.kind, property.value);
        }
        sink
    }
}

/// Gateway configuration
///
/// The gateway's sink lives in `sink_domain` and its source in `source_domain`.
/// `conversion` has one row per sink format and one column per source format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub id: u16,
    pub name: String,
    pub sink_id: u16,
    pub source_id: u16,
    pub sink_domain: u16,
    pub source_domain: u16,
    pub sink_formats: Vec<ConnectionFormat>,
    pub source_formats: Vec<ConnectionFormat>,
    pub conversion: ConversionMatrix,
}

impl GatewayConfig {
    pub fn to_gateway(&self, control_domain: DomainId) -> Gateway {
        Gateway {
            id: GatewayId::new(self.id),
            name: self.name.clone(),
            sink_id: SinkId::new(self.sink_id),
            source_id: SourceId::new(self.source_id),
            domain_sink_id: DomainId::new(self.sink_domain),
            domain_source_id: DomainId::new(self.source_domain),
            control_domain_id: control_domain,
            sink_formats: self.sink_formats.clone(),
            source_formats: self.source_formats.clone(),
            conversion: self.conversion.clone(),
        }
    }
}

/// One audio domain and everything it owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub id: u16,
    pub name: String,
    #[serde(default)]
    pub bus_name: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub early: bool,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
    /// Gateways controlled by this domain
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,
}

impl DomainConfig {
    pub fn domain_id(&self) -> DomainId {
        DomainId::new(self.id)
    }

    pub fn to_domain(&self) -> Domain {
        Domain {
            id: self.domain_id(),
            name: self.name.clone(),
            bus_name: self.bus_name.clone(),
            node_name: self.node_name.clone(),
            early: self.early,
            complete: true,
            state: DomainState::Controlled,
        }
    }
}

/// Domain topology
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
}

/// Complete Minstrel configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinstrelConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
}

impl MinstrelConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!(domains = config.topology.domains.len(), "Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Check identifiers, matrix shapes and gateway endpoints
    pub fn validate(&self) -> Result<()> {
        if self.app.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".to_string()));
        }
        if self.app.ramp_tick_ms == 0 {
            return Err(ConfigError::Invalid("ramp_tick_ms must be at least 1".to_string()));
        }

        let mut domains = HashSet::new();
        let mut sources = HashSet::new();
        let mut sinks = HashSet::new();
        let mut gateways = HashSet::new();

        for domain in &self.topology.domains {
            if !domains.insert(domain.id) {
                return Err(ConfigError::Invalid(format!("duplicate domain id {}", domain.id)));
            }
            for source in &domain.sources {
                if !sources.insert(source.id) {
                    return Err(ConfigError::Invalid(format!("duplicate source id {}", source.id)));
                }
            }
            for sink in &domain.sinks {
                if !sinks.insert(sink.id) {
                    return Err(ConfigError::Invalid(format!("duplicate sink id {}", sink.id)));
                }
            }
        }

        for gateway in self.topology.domains.iter().flat_map(|d| d.gateways.iter()) {
            if !gateways.insert(gateway.id) {
                return Err(ConfigError::Invalid(format!("duplicate gateway id {}", gateway.id)));
            }
            if gateway.sink_domain == gateway.source_domain {
                return Err(ConfigError::Invalid(format!(
                    "gateway {} bridges domain {} to itself",
                    gateway.id, gateway.sink_domain
                )));
            }
            if !gateway
                .conversion
                .has_shape(gateway.sink_formats.len(), gateway.source_formats.len())
            {
                return Err(ConfigError::Invalid(format!(
                    "gateway {} conversion matrix must be {}x{}",
                    gateway.id,
                    gateway.sink_formats.len(),
                    gateway.source_formats.len()
                )));
            }
            if !self.domain_has_sink(gateway.sink_domain, gateway.sink_id) {
                return Err(ConfigError::Invalid(format!(
                    "gateway {} sink {} is not declared in domain {}",
                    gateway.id, gateway.sink_id, gateway.sink_domain
                )));
            }
            if !self.domain_has_source(gateway.source_domain, gateway.source_id) {
                return Err(ConfigError::Invalid(format!(
                    "gateway {} source {} is not declared in domain {}",
                    gateway.id, gateway.source_id, gateway.source_domain
                )));
            }
        }

        Ok(())
    }

    fn domain_has_sink(&self, domain: u16, sink: u16) -> bool {
        self.topology
            .domains
            .iter()
            .any(|d| d.id == domain && d.sinks.iter().any(|s| s.id == sink))
    }

    fn domain_has_source(&self, domain: u16, source: u16) -> bool {
        self.topology
            .domains
            .iter()
            .any(|d| d.id == domain && d.sources.iter().any(|s| s.id == source))
    }

    /// Create factory default configuration
    ///
    /// An infotainment domain with a radio source, bridged by one gateway to
    /// an amplifier domain with a speaker sink.
    pub fn factory_default() -> Self {
        let mut config = Self::default();

        config.topology.domains.push(DomainConfig {
            id: 1,
            name: "infotainment".to_string(),
            bus_name: "minstrel.infotainment".to_string(),
            node_name: "head-unit".to_string(),
            early: false,
            sources: vec![SourceConfig {
                id: 1,
                name: "radio".to_string(),
                class_id: 1,
                volume: 0,
                formats: vec![ConnectionFormat::Pcm, ConnectionFormat::Stereo],
                sound_properties: Vec::new(),
            }],
            sinks: vec![SinkConfig {
                id: 100,
                name: "amplifier-link-in".to_string(),
                class_id: 1,
                volume: 0,
                main_volume: 0,
                formats: vec![ConnectionFormat::Pcm, ConnectionFormat::Stereo],
                sound_properties: Vec::new(),
            }],
            gateways: vec![GatewayConfig {
                id: 1,
                name: "amplifier-link".to_string(),
                sink_id: 100,
                source_id: 101,
                sink_domain: 1,
                source_domain: 2,
                sink_formats: vec![ConnectionFormat::Pcm, ConnectionFormat::Stereo],
                source_formats: vec![ConnectionFormat::Pcm],
                conversion: ConversionMatrix::full(2, 1),
            }],
        });

        config.topology.domains.push(DomainConfig {
            id: 2,
            name: "amplifier".to_string(),
            bus_name: "minstrel.amplifier".to_string(),
            node_name: "amplifier".to_string(),
            early: true,
            sources: vec![SourceConfig {
                id: 101,
                name: "amplifier-link-out".to_string(),
                class_id: 1,
                volume: 0,
                formats: vec![ConnectionFormat::Pcm],
                sound_properties: Vec::new(),
            }],
            sinks: vec![SinkConfig {
                id: 1,
                name: "speakers".to_string(),
                class_id: 1,
                volume: 0,
                main_volume: 0,
                formats: vec![ConnectionFormat::Pcm],
                sound_properties: vec![SoundProperty::new(1, 0)],
            }],
            gateways: Vec::new(),
        });

        config
    }
}

/// Where a loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Read from the stored file
    Stored,
    /// No file existed, the factory topology was written in its place
    Seeded,
    /// The stored file was unusable and has been moved to `rejected`
    Recovered { rejected: PathBuf },
}

/// A configuration together with its origin
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: MinstrelConfig,
    pub origin: ConfigOrigin,
}

/// Owns `config.toml` in the Minstrel config directory
///
/// Only validated configurations are ever written, and writes go through a
/// sibling file that is renamed into place, so a reader sees either the old
/// topology or the new one.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// `~/.config/minstrel` on Linux, the platform equivalent elsewhere
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("minstrel"))
            .ok_or_else(|| ConfigError::Invalid("no config directory on this platform".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Read the stored configuration
    ///
    /// A missing file is seeded with the factory topology. A file that does
    /// not parse or fails validation is moved aside and the factory topology
    /// is used instead. Any other I/O failure is returned.
    #[instrument(skip(self), fields(path = %self.config_path.display()))]
    pub async fn load(&self) -> Result<LoadedConfig> {
        let contents = match fs::read_to_string(&self.config_path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = MinstrelConfig::factory_default();
                self.save(&config).await?;
                info!(domains = config.topology.domains.len(), "Seeded factory topology");
                return Ok(LoadedConfig {
                    config,
                    origin: ConfigOrigin::Seeded,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let parsed = toml::from_str::<MinstrelConfig>(&contents)
            .map_err(ConfigError::from)
            .and_then(|config| config.validate().map(|()| config));

        match parsed {
            Ok(config) => {
                debug!(domains = config.topology.domains.len(), "Stored topology accepted");
                Ok(LoadedConfig {
                    config,
                    origin: ConfigOrigin::Stored,
                })
            }
            Err(err) => {
                let rejected = self.config_path.with_extension("toml.rejected");
                fs::rename(&self.config_path, &rejected).await?;
                error!(error = %err, rejected = %rejected.display(), "Stored topology unusable, falling back to factory");
                Ok(LoadedConfig {
                    config: MinstrelConfig::factory_default(),
                    origin: ConfigOrigin::Recovered { rejected },
                })
            }
        }
    }

    /// Validate `config` and replace the stored file with it
    #[instrument(skip(self, config), fields(path = %self.config_path.display()))]
    pub async fn save(&self, config: &MinstrelConfig) -> Result<()> {
        config.validate()?;
        fs::create_dir_all(&self.config_dir).await?;

        let staged = self.config_path.with_extension("toml.staged");
        fs::write(&staged, toml::to_string_pretty(config)?).await?;
        fs::rename(&staged, &self.config_path).await?;

        debug!(domains = config.topology.domains.len(), "Topology persisted");
        Ok(())
    }

    /// Swap in a new topology, keeping the stored application settings
    ///
    /// Nothing is written when the combined configuration is invalid.
    pub async fn save_topology(&self, topology: TopologyConfig) -> Result<MinstrelConfig> {
        let app = match fs::read_to_string(&self.config_path).await {
            Ok(contents) => toml::from_str::<MinstrelConfig>(&contents)?.app,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(err) => return Err(err.into()),
        };
        let config = MinstrelConfig { app, topology };
        self.save(&config).await?;
        Ok(config)
    }
}
