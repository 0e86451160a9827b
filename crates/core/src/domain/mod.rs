//! Domain entities and business rules

pub mod adapter;
pub mod audio;
pub mod config;
pub mod controller;
pub mod format;
pub mod handle;
pub mod registry;
pub mod router;

// Re-export specific items to avoid ambiguous glob imports
pub use adapter::{AdapterKey, AdapterRegistry, DomainAdapter, Registrar};
pub use audio::{
    Availability, ClassId, Connection, ConnectionFormat, ConnectionId, ConnectionState, Crossfader,
    CrossfaderId, Domain, DomainId, DomainState, Gateway, GatewayId, HotSink, InterruptState,
    MainConnection, MainConnectionId, MainVolume, MuteState, RampType, RoutingError, Sink, SinkId,
    SoundProperty, SoundPropertyKind, Source, SourceId, SourceState, Volume,
};
pub use config::{ConfigError, ConfigManager, ConfigOrigin, LoadedConfig, MinstrelConfig};
pub use controller::{Controller, FormatPrioritizer, PriorityController};
pub use format::ConversionMatrix;
pub use handle::{Handle, HandleData, HandleKind, HandleTracker};
pub use registry::{InMemoryRegistry, Registry};
pub use router::{Hop, ResolveError, Route};
