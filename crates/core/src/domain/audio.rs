//! Audio routing domain model
//!
//! This module defines the entities the control plane reasons about:
//! domains, sources, sinks, gateways, connections and main connections.
//! All of them are plain data owned by the registry; routes and handles
//! only ever reference them by identifier.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors surfaced by the routing control plane
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// Unknown source, sink, domain, gateway, connection or handle
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate connection or registration
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The requested value equals the current one, nothing was dispatched
    #[error("No change")]
    NoChange,

    /// Resource exhaustion, no route or no format agreement
    #[error("Not possible: {0}")]
    NotPossible(String),

    /// An adapter rejected a format outside its declared set
    #[error("Wrong format: {0}")]
    WrongFormat(String),

    /// The action was cancelled before it completed
    #[error("Aborted")]
    Aborted,

    /// Registry I/O failure
    #[error("Database error: {0}")]
    Database(String),

    /// Reserved feature that the adapter does not implement
    #[error("Not used: {0}")]
    NotUsed(String),
}

pub type Result<T> = std::result::Result<T, RoutingError>;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u16);

        impl $name {
            pub const fn new(id: u16) -> Self {
                Self(id)
            }

            pub const fn get(&self) -> u16 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of an audio domain
    DomainId
);
id_type!(
    /// Identifier of a source
    SourceId
);
id_type!(
    /// Identifier of a sink
    SinkId
);
id_type!(
    /// Identifier of a gateway
    GatewayId
);
id_type!(
    /// Identifier of a committed or provisional single-hop connection
    ConnectionId
);
id_type!(
    /// Identifier of a user-visible end-to-end connection
    MainConnectionId
);
id_type!(
    /// Identifier of a crossfader
    CrossfaderId
);
id_type!(
    /// Class of a source or sink (e.g. "entertainment", "navigation")
    ClassId
);

/// Wire format negotiated on every hop of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionFormat {
    Mono,
    Stereo,
    Analog,
    Auto,
    Pcm,
    Compressed,
    Custom(u16),
}

impl fmt::Display for ConnectionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionFormat::Custom(code) => write!(f, "custom({code})"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// Volume in the adapter's internal units
pub type Volume = i16;

/// User-facing sink volume
pub type MainVolume = i16;

/// Volume limits shared by all adapters
pub mod volume {
    use super::Volume;

    pub const MIN: Volume = -3000;
    pub const MAX: Volume = 3000;

    /// Volume used while a sink is muted
    pub const MUTED: Volume = MIN;

    pub fn clamp(volume: Volume) -> Volume {
        volume.clamp(MIN, MAX)
    }
}

/// Shape of a volume change over time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampType {
    /// Jump straight to the target value
    #[default]
    Direct,
    /// Interpolate linearly over the ramp time
    Linear,
}

/// Lifecycle state of a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    #[default]
    Controlled,
    Running,
    Rundown,
}

/// Playback state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    On,
    #[default]
    Off,
    Paused,
}

/// Whether a source or sink can currently be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    #[default]
    Available,
    Unavailable,
    Unknown,
}

/// Interrupt state reported by a source (e.g. a traffic announcement)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptState {
    #[default]
    Off,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuteState {
    Muted,
    #[default]
    Unmuted,
}

/// Which sink of a crossfader is currently audible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotSink {
    #[default]
    SinkA,
    SinkB,
}

/// State of a user-visible end-to-end connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Suspended,
}

/// Sound property type code (bass, treble, loudness, ...)
pub type SoundPropertyKind = u16;

/// One sound property value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundProperty {
    pub kind: SoundPropertyKind,
    pub value: i16,
}

impl SoundProperty {
    pub fn new(kind: SoundPropertyKind, value: i16) -> Self {
        Self { kind, value }
    }
}

/// Sound property map keyed by type
pub type SoundProperties = BTreeMap<SoundPropertyKind, i16>;

/// An independently managed audio subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub name: String,
    pub bus_name: String,
    pub node_name: String,
    pub early: bool,
    pub complete: bool,
    pub state: DomainState,
}

/// A producer of audio inside one domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub domain_id: DomainId,
    pub name: String,
    pub class_id: ClassId,
    pub state: SourceState,
    pub volume: Volume,
    pub visible: bool,
    pub availability: Availability,
    pub interrupt_state: InterruptState,
    /// Supported formats, ordered as declared by the owning adapter
    pub connection_formats: Vec<ConnectionFormat>,
    pub sound_properties: SoundProperties,
    pub main_sound_properties: SoundProperties,
}

impl Source {
    pub fn new(id: SourceId, domain_id: DomainId, name: impl Into<String>) -> Self {
        Self {
            id,
            domain_id,
            name: name.into(),
            class_id: ClassId::new(1),
            state: SourceState::Off,
            volume: 0,
            visible: true,
            availability: Availability::Available,
            interrupt_state: InterruptState::Off,
            connection_formats: Vec::new(),
            sound_properties: SoundProperties::new(),
            main_sound_properties: SoundProperties::new(),
        }
    }

    pub fn with_formats(mut self, formats: impl IntoIterator<Item = ConnectionFormat>) -> Self {
        self.connection_formats = formats.into_iter().collect();
        self
    }

    pub fn supports(&self, format: ConnectionFormat) -> bool {
        self.connection_formats.contains(&format)
    }
}

/// A consumer of audio inside one domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sink {
    pub id: SinkId,
    pub domain_id: DomainId,
    pub name: String,
    pub class_id: ClassId,
    /// Internal volume, moved incrementally during ramps
    pub volume: Volume,
    /// User-facing volume
    pub main_volume: MainVolume,
    pub mute_state: MuteState,
    pub visible: bool,
    pub availability: Availability,
    pub connection_formats: Vec<ConnectionFormat>,
    pub sound_properties: SoundProperties,
    pub main_sound_properties: SoundProperties,
}

impl Sink {
    pub fn new(id: SinkId, domain_id: DomainId, name: impl Into<String>) -> Self {
        Self {
            id,
            domain_id,
            name: name.into(),
            class_id: ClassId::new(1),
            volume: 0,
            main_volume: 0,
            mute_state: MuteState::Unmuted,
            visible: true,
            availability: Availability::Available,
            connection_formats: Vec::new(),
            sound_properties: SoundProperties::new(),
            main_sound_properties: SoundProperties::new(),
        }
    }

    pub fn with_formats(mut self, formats: impl IntoIterator<Item = ConnectionFormat>) -> Self {
        self.connection_formats = formats.into_iter().collect();
        self
    }

    pub fn supports(&self, format: ConnectionFormat) -> bool {
        self.connection_formats.contains(&format)
    }
}

/// Bridge between two domains with a restricted conversion capability
///
/// The gateway consumes audio through `sink_id` (living in `domain_sink_id`)
/// and emits it again through `source_id` (living in `domain_source_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gateway {
    pub id: GatewayId,
    pub name: String,
    pub sink_id: SinkId,
    pub source_id: SourceId,
    pub domain_sink_id: DomainId,
    pub domain_source_id: DomainId,
    pub control_domain_id: DomainId,
    pub sink_formats: Vec<ConnectionFormat>,
    pub source_formats: Vec<ConnectionFormat>,
    pub conversion: crate::domain::format::ConversionMatrix,
}

/// A single-hop link between one source and one sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub source_id: SourceId,
    pub sink_id: SinkId,
    pub format: ConnectionFormat,
    /// Propagation delay in milliseconds, `None` while unknown
    pub delay: Option<i16>,
    /// `false` while the connect action is still in flight
    pub committed: bool,
}

/// User-visible aggregate of one end-to-end route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainConnection {
    pub id: MainConnectionId,
    pub source_id: SourceId,
    pub sink_id: SinkId,
    pub state: ConnectionState,
    /// Sum of hop delays, `None` if any hop delay is unknown
    pub delay: Option<i16>,
    pub connections: Vec<ConnectionId>,
}

/// Reserved crossfader entity; fading is not implemented by any shipped adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crossfader {
    pub id: CrossfaderId,
    pub name: String,
    pub sink_a: SinkId,
    pub sink_b: SinkId,
    pub source_id: SourceId,
    pub hot_sink: HotSink,
}
