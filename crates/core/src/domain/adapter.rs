//! Domain adapter interface and ownership map
//!
//! Each audio domain is driven by one compiled-in adapter. Adapters announce
//! what they own through a [`Registrar`] at startup, then receive actions
//! tagged with a [`Handle`] and acknowledge them later through the
//! completion queue.

use crate::control::completion::CompletionSender;
use crate::domain::audio::{
    ConnectionFormat, ConnectionId, Crossfader, CrossfaderId, Domain, DomainId, DomainState,
    Gateway, GatewayId, HotSink, RampType, Result, RoutingError, Sink, SinkId, SoundProperty,
    Source, SourceId, SourceState, Volume,
};
use crate::domain::handle::Handle;
use std::collections::HashMap;

/// Startup registration surface handed to adapters
pub trait Registrar {
    fn register_domain(&mut self, domain: Domain) -> Result<DomainId>;
    fn register_source(&mut self, source: Source) -> Result<SourceId>;
    fn register_sink(&mut self, sink: Sink) -> Result<SinkId>;
    fn register_gateway(&mut self, gateway: Gateway) -> Result<GatewayId>;
    fn register_crossfader(&mut self, crossfader: Crossfader) -> Result<CrossfaderId>;
}

/// Capability interface every domain adapter implements
///
/// Every `async_*` call returns the result of local validation right away.
/// `Ok` means the action was accepted and exactly one terminal
/// acknowledgment for `handle` will follow on the completion queue.
pub trait DomainAdapter: Send {
    fn name(&self) -> &str;

    /// Register the adapter's domain, endpoints and gateways
    ///
    /// `completions` is where acknowledgments and events go from now on.
    fn register(&mut self, registrar: &mut dyn Registrar, completions: CompletionSender) -> Result<()>;

    fn async_connect(
        &mut self,
        handle: Handle,
        connection: ConnectionId,
        source: SourceId,
        sink: SinkId,
        format: ConnectionFormat,
    ) -> Result<()>;

    fn async_disconnect(&mut self, handle: Handle, connection: ConnectionId) -> Result<()>;

    fn async_set_sink_volume(
        &mut self,
        handle: Handle,
        sink: SinkId,
        volume: Volume,
        ramp: RampType,
        time_ms: u16,
    ) -> Result<()>;

    fn async_set_source_volume(
        &mut self,
        handle: Handle,
        source: SourceId,
        volume: Volume,
        ramp: RampType,
        time_ms: u16,
    ) -> Result<()>;

    fn async_set_source_state(&mut self, handle: Handle, source: SourceId, state: SourceState) -> Result<()>;

    fn async_set_sink_sound_property(
        &mut self,
        handle: Handle,
        sink: SinkId,
        property: SoundProperty,
    ) -> Result<()>;

    fn async_set_source_sound_property(
        &mut self,
        handle: Handle,
        source: SourceId,
        property: SoundProperty,
    ) -> Result<()>;

    /// Reserved; no shipped adapter implements crossfading
    fn async_cross_fade(
        &mut self,
        _handle: Handle,
        crossfader: CrossfaderId,
        _hot_sink: HotSink,
        _ramp: RampType,
        _time_ms: u16,
    ) -> Result<()> {
        Err(RoutingError::NotUsed(format!("crossfader {crossfader}")))
    }

    /// Ask the job behind `handle` to stop early
    fn abort(&mut self, handle: Handle) -> Result<()>;

    fn set_domain_state(&mut self, domain: DomainId, state: DomainState) -> Result<()>;
}

/// Index of an adapter inside the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterKey(pub usize);

/// Maps every identifier to the adapter that owns it
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    domains: HashMap<DomainId, AdapterKey>,
    sources: HashMap<SourceId, AdapterKey>,
    sinks: HashMap<SinkId, AdapterKey>,
    crossfaders: HashMap<CrossfaderId, AdapterKey>,
    connections: HashMap<ConnectionId, AdapterKey>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_domain(&mut self, id: DomainId, key: AdapterKey) {
        self.domains.insert(id, key);
    }

    pub fn add_source(&mut self, id: SourceId, key: AdapterKey) {
        self.sources.insert(id, key);
    }

    pub fn add_sink(&mut self, id: SinkId, key: AdapterKey) {
        self.sinks.insert(id, key);
    }

    pub fn add_crossfader(&mut self, id: CrossfaderId, key: AdapterKey) {
        self.crossfaders.insert(id, key);
    }

    pub fn add_connection(&mut self, id: ConnectionId, key: AdapterKey) {
        self.connections.insert(id, key);
    }

    pub fn remove_connection(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    pub fn for_domain(&self, id: DomainId) -> Result<AdapterKey> {
        self.domains
            .get(&id)
            .copied()
            .ok_or_else(|| RoutingError::NotFound(format!("no adapter for domain {id}")))
    }

    pub fn for_source(&self, id: SourceId) -> Result<AdapterKey> {
        self.sources
            .get(&id)
            .copied()
            .ok_or_else(|| RoutingError::NotFound(format!("no adapter for source {id}")))
    }

    pub fn for_sink(&self, id: SinkId) -> Result<AdapterKey> {
        self.sinks
            .get(&id)
            .copied()
            .ok_or_else(|| RoutingError::NotFound(format!("no adapter for sink {id}")))
    }

    pub fn for_crossfader(&self, id: CrossfaderId) -> Result<AdapterKey> {
        self.crossfaders
            .get(&id)
            .copied()
            .ok_or_else(|| RoutingError::NotFound(format!("no adapter for crossfader {id}")))
    }

    pub fn for_connection(&self, id: ConnectionId) -> Result<AdapterKey> {
        self.connections
            .get(&id)
            .copied()
            .ok_or_else(|| RoutingError::NotFound(format!("no adapter for connection {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_lookup() {
        let mut adapters = AdapterRegistry::new();
        adapters.add_domain(DomainId::new(1), AdapterKey(0));
        adapters.add_sink(SinkId::new(5), AdapterKey(0));
        adapters.add_connection(ConnectionId::new(3), AdapterKey(1));

        assert_eq!(adapters.for_domain(DomainId::new(1)).unwrap(), AdapterKey(0));
        assert_eq!(adapters.for_sink(SinkId::new(5)).unwrap(), AdapterKey(0));
        assert_eq!(adapters.for_connection(ConnectionId::new(3)).unwrap(), AdapterKey(1));
        assert!(matches!(
            adapters.for_source(SourceId::new(5)),
            Err(RoutingError::NotFound(_))
        ));

        adapters.remove_connection(ConnectionId::new(3));
        assert!(adapters.for_connection(ConnectionId::new(3)).is_err());
    }
}
