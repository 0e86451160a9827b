//! Registry of domains, endpoints, gateways and connections
//!
//! The control plane treats the registry as a CRUD store with existence
//! checks. [`InMemoryRegistry`] is the store shipped with the workspace;
//! other backends only need to implement [`Registry`].

use crate::domain::audio::{
    Availability, Connection, ConnectionFormat, ConnectionId, ConnectionState, Crossfader,
    CrossfaderId, Domain, DomainId, DomainState, Gateway, GatewayId, HotSink, InterruptState,
    MainConnection, MainConnectionId, MainVolume, MuteState, Result, RoutingError, Sink, SinkId,
    SoundProperty, SoundPropertyKind, Source, SourceId, SourceState, Volume,
};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Persistence collaborator consumed by the resolver and the control plane
pub trait Registry: Send {
    fn enter_domain(&mut self, domain: Domain) -> Result<DomainId>;
    fn enter_source(&mut self, source: Source) -> Result<SourceId>;
    fn enter_sink(&mut self, sink: Sink) -> Result<SinkId>;
    fn enter_gateway(&mut self, gateway: Gateway) -> Result<GatewayId>;
    fn enter_crossfader(&mut self, crossfader: Crossfader) -> Result<CrossfaderId>;

    /// Insert a provisional connection
    ///
    /// Fails with `AlreadyExists` if a connection with the same source, sink
    /// and format is already present, provisional or committed.
    fn enter_connection(
        &mut self,
        source: SourceId,
        sink: SinkId,
        format: ConnectionFormat,
    ) -> Result<ConnectionId>;
    fn change_connection_final(&mut self, id: ConnectionId) -> Result<()>;
    fn change_connection_delay(&mut self, id: ConnectionId, delay: Option<i16>) -> Result<()>;
    fn remove_connection(&mut self, id: ConnectionId) -> Result<()>;

    fn enter_main_connection(&mut self, source: SourceId, sink: SinkId) -> Result<MainConnectionId>;
    fn change_main_connection_route(
        &mut self,
        id: MainConnectionId,
        connections: Vec<ConnectionId>,
    ) -> Result<()>;
    fn change_main_connection_state(&mut self, id: MainConnectionId, state: ConnectionState) -> Result<()>;
    fn change_main_connection_delay(&mut self, id: MainConnectionId, delay: Option<i16>) -> Result<()>;
    fn remove_main_connection(&mut self, id: MainConnectionId) -> Result<()>;

    fn change_sink_volume(&mut self, id: SinkId, volume: Volume) -> Result<()>;
    fn change_sink_main_volume(&mut self, id: SinkId, volume: MainVolume) -> Result<()>;
    fn change_sink_mute_state(&mut self, id: SinkId, state: MuteState) -> Result<()>;
    fn change_sink_sound_property(&mut self, id: SinkId, property: SoundProperty) -> Result<()>;
    fn change_sink_main_sound_property(&mut self, id: SinkId, property: SoundProperty) -> Result<()>;
    fn change_sink_availability(&mut self, id: SinkId, availability: Availability) -> Result<()>;

    fn change_source_volume(&mut self, id: SourceId, volume: Volume) -> Result<()>;
    fn change_source_state(&mut self, id: SourceId, state: SourceState) -> Result<()>;
    fn change_source_sound_property(&mut self, id: SourceId, property: SoundProperty) -> Result<()>;
    fn change_source_main_sound_property(&mut self, id: SourceId, property: SoundProperty) -> Result<()>;
    fn change_source_availability(&mut self, id: SourceId, availability: Availability) -> Result<()>;
    fn change_source_interrupt_state(&mut self, id: SourceId, state: InterruptState) -> Result<()>;

    fn change_domain_state(&mut self, id: DomainId, state: DomainState) -> Result<()>;
    fn change_crossfader_hot_sink(&mut self, id: CrossfaderId, hot_sink: HotSink) -> Result<()>;

    fn domain(&self, id: DomainId) -> Option<&Domain>;
    fn source(&self, id: SourceId) -> Option<&Source>;
    fn sink(&self, id: SinkId) -> Option<&Sink>;
    fn gateway(&self, id: GatewayId) -> Option<&Gateway>;
    fn crossfader(&self, id: CrossfaderId) -> Option<&Crossfader>;
    fn connection(&self, id: ConnectionId) -> Option<&Connection>;
    fn main_connection(&self, id: MainConnectionId) -> Option<&MainConnection>;

    fn domains(&self) -> Vec<&Domain>;
    fn sources(&self) -> Vec<&Source>;
    fn sinks(&self) -> Vec<&Sink>;
    fn gateways(&self) -> Vec<&Gateway>;
    fn connections(&self) -> Vec<&Connection>;
    fn main_connections(&self) -> Vec<&MainConnection>;

    fn domain_exists(&self, id: DomainId) -> bool {
        self.domain(id).is_some()
    }

    fn source_exists(&self, id: SourceId) -> bool {
        self.source(id).is_some()
    }

    fn sink_exists(&self, id: SinkId) -> bool {
        self.sink(id).is_some()
    }

    fn gateway_exists(&self, id: GatewayId) -> bool {
        self.gateway(id).is_some()
    }

    fn connection_exists(&self, id: ConnectionId) -> bool {
        self.connection(id).is_some()
    }

    fn sink_volume(&self, id: SinkId) -> Result<Volume> {
        self.sink(id)
            .map(|sink| sink.volume)
            .ok_or_else(|| RoutingError::NotFound(format!("sink {id}")))
    }

    fn source_volume(&self, id: SourceId) -> Result<Volume> {
        self.source(id)
            .map(|source| source.volume)
            .ok_or_else(|| RoutingError::NotFound(format!("source {id}")))
    }

    fn source_state(&self, id: SourceId) -> Result<SourceState> {
        self.source(id)
            .map(|source| source.state)
            .ok_or_else(|| RoutingError::NotFound(format!("source {id}")))
    }

    /// Current sink sound property value, `None` if the property was never set
    fn sink_sound_property_value(&self, id: SinkId, kind: SoundPropertyKind) -> Result<Option<i16>> {
        self.sink(id)
            .map(|sink| sink.sound_properties.get(&kind).copied())
            .ok_or_else(|| RoutingError::NotFound(format!("sink {id}")))
    }

    fn source_sound_property_value(&self, id: SourceId, kind: SoundPropertyKind) -> Result<Option<i16>> {
        self.source(id)
            .map(|source| source.sound_properties.get(&kind).copied())
            .ok_or_else(|| RoutingError::NotFound(format!("source {id}")))
    }

    /// Main connection between a source and a sink, if one exists
    fn main_connection_between(&self, source: SourceId, sink: SinkId) -> Option<&MainConnection> {
        self.main_connections()
            .into_iter()
            .find(|main| main.source_id == source && main.sink_id == sink)
    }

    /// A gateway is in use when any connection touches its sink or its source
    fn gateway_in_use(&self, gateway: &Gateway) -> bool {
        self.connections()
            .iter()
            .any(|c| c.sink_id == gateway.sink_id || c.source_id == gateway.source_id)
    }
}

/// In-memory registry backed by ordered maps
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    domains: BTreeMap<DomainId, Domain>,
    sources: BTreeMap<SourceId, Source>,
    sinks: BTreeMap<SinkId, Sink>,
    gateways: BTreeMap<GatewayId, Gateway>,
    crossfaders: BTreeMap<CrossfaderId, Crossfader>,
    connections: BTreeMap<ConnectionId, Connection>,
    main_connections: BTreeMap<MainConnectionId, MainConnection>,
    next_connection: u16,
    next_main_connection: u16,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sink_mut(&mut self, id: SinkId) -> Result<&mut Sink> {
        self.sinks
            .get_mut(&id)
            .ok_or_else(|| RoutingError::NotFound(format!("sink {id}")))
    }

    fn source_mut(&mut self, id: SourceId) -> Result<&mut Source> {
        self.sources
            .get_mut(&id)
            .ok_or_else(|| RoutingError::NotFound(format!("source {id}")))
    }

    fn main_connection_mut(&mut self, id: MainConnectionId) -> Result<&mut MainConnection> {
        self.main_connections
            .get_mut(&id)
            .ok_or_else(|| RoutingError::NotFound(format!("main connection {id}")))
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut Connection> {
        self.connections
            .get_mut(&id)
            .ok_or_else(|| RoutingError::NotFound(format!("connection {id}")))
    }

    /// Next free identifier, skipping zero and identifiers still in use
    fn allocate<K: Ord, V>(counter: &mut u16, table: &BTreeMap<K, V>, make: fn(u16) -> K) -> Result<K> {
        for _ in 0..=u16::MAX {
            *counter = counter.wrapping_add(1);
            if *counter == 0 {
                continue;
            }
            let id = make(*counter);
            if !table.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(RoutingError::Database("identifier space exhausted".to_string()))
    }
}

impl Registry for InMemoryRegistry {
    fn enter_domain(&mut self, domain: Domain) -> Result<DomainId> {
        if self.domains.contains_key(&domain.id) {
            return Err(RoutingError::AlreadyExists(format!("domain {}", domain.id)));
        }
        debug!(domain = %domain.id, name = %domain.name, "Domain entered");
        let id = domain.id;
        self.domains.insert(id, domain);
        Ok(id)
    }

    fn enter_source(&mut self, source: Source) -> Result<SourceId> {
        if self.sources.contains_key(&source.id) {
            return Err(RoutingError::AlreadyExists(format!("source {}", source.id)));
        }
        if !self.domains.contains_key(&source.domain_id) {
            return Err(RoutingError::NotFound(format!("domain {}", source.domain_id)));
        }
        debug!(source = %source.id, name = %source.name, "Source entered");
        let id = source.id;
        self.sources.insert(id, source);
        Ok(id)
    }

    fn enter_sink(&mut self, sink: Sink) -> Result<SinkId> {
        if self.sinks.contains_key(&sink.id) {
            return Err(RoutingError::AlreadyExists(format!("sink {}", sink.id)));
        }
        if !self.domains.contains_key(&sink.domain_id) {
            return Err(RoutingError::NotFound(format!("domain {}", sink.domain_id)));
        }
        debug!(sink = %sink.id, name = %sink.name, "Sink entered");
        let id = sink.id;
        self.sinks.insert(id, sink);
        Ok(id)
    }

    fn enter_gateway(&mut self, gateway: Gateway) -> Result<GatewayId> {
        if self.gateways.contains_key(&gateway.id) {
            return Err(RoutingError::AlreadyExists(format!("gateway {}", gateway.id)));
        }
        if !gateway
            .conversion
            .has_shape(gateway.sink_formats.len(), gateway.source_formats.len())
        {
            return Err(RoutingError::WrongFormat(format!(
                "gateway {} conversion matrix does not match its formats",
                gateway.id
            )));
        }
        debug!(gateway = %gateway.id, name = %gateway.name, "Gateway entered");
        let id = gateway.id;
        self.gateways.insert(id, gateway);
        Ok(id)
    }

    fn enter_crossfader(&mut self, crossfader: Crossfader) -> Result<CrossfaderId> {
        if self.crossfaders.contains_key(&crossfader.id) {
            return Err(RoutingError::AlreadyExists(format!("crossfader {}", crossfader.id)));
        }
        let id = crossfader.id;
        self.crossfaders.insert(id, crossfader);
        Ok(id)
    }

    fn enter_connection(
        &mut self,
        source: SourceId,
        sink: SinkId,
        format: ConnectionFormat,
    ) -> Result<ConnectionId> {
        let duplicate = self
            .connections
            .values()
            .any(|c| c.source_id == source && c.sink_id == sink && c.format == format);
        if duplicate {
            return Err(RoutingError::AlreadyExists(format!(
                "connection {source} -> {sink} ({format})"
            )));
        }

        let id = Self::allocate(&mut self.next_connection, &self.connections, ConnectionId::new)?;
        self.connections.insert(
            id,
            Connection {
                id,
                source_id: source,
                sink_id: sink,
                format,
                delay: None,
                committed: false,
            },
        );
        trace!(connection = %id, %source, %sink, %format, "Provisional connection entered");
        Ok(id)
    }

    fn change_connection_final(&mut self, id: ConnectionId) -> Result<()> {
        self.connection_mut(id)?.committed = true;
        Ok(())
    }

    fn change_connection_delay(&mut self, id: ConnectionId, delay: Option<i16>) -> Result<()> {
        self.connection_mut(id)?.delay = delay;
        Ok(())
    }

    fn remove_connection(&mut self, id: ConnectionId) -> Result<()> {
        self.connections
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RoutingError::NotFound(format!("connection {id}")))
    }

    fn enter_main_connection(&mut self, source: SourceId, sink: SinkId) -> Result<MainConnectionId> {
        if self.main_connection_between(source, sink).is_some() {
            return Err(RoutingError::AlreadyExists(format!("main connection {source} -> {sink}")));
        }
        let id = Self::allocate(
            &mut self.next_main_connection,
            &self.main_connections,
            MainConnectionId::new,
        )?;
        self.main_connections.insert(
            id,
            MainConnection {
                id,
                source_id: source,
                sink_id: sink,
                state: ConnectionState::Connecting,
                delay: None,
                connections: Vec::new(),
            },
        );
        Ok(id)
    }

    fn change_main_connection_route(
        &mut self,
        id: MainConnectionId,
        connections: Vec<ConnectionId>,
    ) -> Result<()> {
        self.main_connection_mut(id)?.connections = connections;
        Ok(())
    }

    fn change_main_connection_state(&mut self, id: MainConnectionId, state: ConnectionState) -> Result<()> {
        self.main_connection_mut(id)?.state = state;
        Ok(())
    }

    fn change_main_connection_delay(&mut self, id: MainConnectionId, delay: Option<i16>) -> Result<()> {
        self.main_connection_mut(id)?.delay = delay;
        Ok(())
    }

    fn remove_main_connection(&mut self, id: MainConnectionId) -> Result<()> {
        self.main_connections
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RoutingError::NotFound(format!("main connection {id}")))
    }

    fn change_sink_volume(&mut self, id: SinkId, volume: Volume) -> Result<()> {
        self.sink_mut(id)?.volume = volume;
        Ok(())
    }

    fn change_sink_main_volume(&mut self, id: SinkId, volume: MainVolume) -> Result<()> {
        self.sink_mut(id)?.main_volume = volume;
        Ok(())
    }

    fn change_sink_mute_state(&mut self, id: SinkId, state: MuteState) -> Result<()> {
        self.sink_mut(id)?.mute_state = state;
        Ok(())
    }

    fn change_sink_sound_property(&mut self, id: SinkId, property: SoundProperty) -> Result<()> {
        self.sink_mut(id)?
            .sound_properties
            .insert(property.kind, property.value);
        Ok(())
    }

    fn change_sink_main_sound_property(&mut self, id: SinkId, property: SoundProperty) -> Result<()> {
        self.sink_mut(id)?
            .main_sound_properties
            .insert(property.kind, property.value);
        Ok(())
    }

    fn change_sink_availability(&mut self, id: SinkId, availability: Availability) -> Result<()> {
        self.sink_mut(id)?.availability = availability;
        Ok(())
    }

    fn change_source_volume(&mut self, id: SourceId, volume: Volume) -> Result<()> {
        self.source_mut(id)?.volume = volume;
        Ok(())
    }

    fn change_source_state(&mut self, id: SourceId, state: SourceState) -> Result<()> {
        self.source_mut(id)?.state = state;
        Ok(())
    }

    fn change_source_sound_property(&mut self, id: SourceId, property: SoundProperty) -> Result<()> {
        self.source_mut(id)?
            .sound_properties
            .insert(property.kind, property.value);
        Ok(())
    }

    fn change_source_main_sound_property(&mut self, id: SourceId, property: SoundProperty) -> Result<()> {
        self.source_mut(id)?
            .main_sound_properties
            .insert(property.kind, property.value);
        Ok(())
    }

    fn change_source_availability(&mut self, id: SourceId, availability: Availability) -> Result<()> {
        self.source_mut(id)?.availability = availability;
        Ok(())
    }

    fn change_source_interrupt_state(&mut self, id: SourceId, state: InterruptState) -> Result<()> {
        self.source_mut(id)?.interrupt_state = state;
        Ok(())
    }

    fn change_domain_state(&mut self, id: DomainId, state: DomainState) -> Result<()> {
        self.domains
            .get_mut(&id)
            .ok_or_else(|| RoutingError::NotFound(format!("domain {id}")))?
            .state = state;
        Ok(())
    }

    fn change_crossfader_hot_sink(&mut self, id: CrossfaderId, hot_sink: HotSink) -> Result<()> {
        self.crossfaders
            .get_mut(&id)
            .ok_or_else(|| RoutingError::NotFound(format!("crossfader {id}")))?
            .hot_sink = hot_sink;
        Ok(())
    }

    fn domain(&self, id: DomainId) -> Option<&Domain> {
        self.domains.get(&id)
    }

    fn source(&self, id: SourceId) -> Option<&Source> {
        self.sources.get(&id)
    }

    fn sink(&self, id: SinkId) -> Option<&Sink> {
        self.sinks.get(&id)
    }

    fn gateway(&self, id: GatewayId) -> Option<&Gateway> {
        self.gateways.get(&id)
    }

    fn crossfader(&self, id: CrossfaderId) -> Option<&Crossfader> {
        self.crossfaders.get(&id)
    }

    fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    fn main_connection(&self, id: MainConnectionId) -> Option<&MainConnection> {
        self.main_connections.get(&id)
    }

    fn domains(&self) -> Vec<&Domain> {
        self.domains.values().collect()
    }

    fn sources(&self) -> Vec<&Source> {
        self.sources.values().collect()
    }

    fn sinks(&self) -> Vec<&Sink> {
        self.sinks.values().collect()
    }

    fn gateways(&self) -> Vec<&Gateway> {
        self.gateways.values().collect()
    }

    fn connections(&self) -> Vec<&Connection> {
        self.connections.values().collect()
    }

    fn main_connections(&self) -> Vec<&MainConnection> {
        self.main_connections.values().collect()
    }
}
