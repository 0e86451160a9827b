//! Connection state machine
//!
//! [`ControlPlane`] owns the registry, the handle tracker and every domain
//! adapter. It validates requests, dispatches actions through the handle
//! tracker and, once acknowledgments come back through the completion queue,
//! commits or rolls them back. It is only ever driven from the control loop.

use crate::control::completion::CompletionSender;
use crate::control::notification::{Notification, NOTIFICATION_CAPACITY};
use crate::domain::adapter::{AdapterKey, AdapterRegistry, DomainAdapter, Registrar};
use crate::domain::audio::{
    volume, ConnectionId, ConnectionState, Crossfader, CrossfaderId, Domain, DomainId, DomainState,
    Gateway, GatewayId, HotSink, MainConnectionId, RampType, Result, RoutingError, Sink, SinkId,
    SoundProperty, Source, SourceId, SourceState, Volume,
};
use crate::domain::config::AppConfig;
use crate::domain::controller::Controller;
use crate::domain::handle::{Handle, HandleData, HandleTracker, MainSinkChange, PendingAction};
use crate::domain::registry::Registry;
use crate::domain::router::{self, Hop, Route};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Control plane settings taken from [`AppConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSettings {
    pub only_free_gateways: bool,
    pub default_ramp_time_ms: u16,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ControlSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            only_free_gateways: config.only_free_gateways,
            default_ramp_time_ms: config.default_ramp_time_ms,
        }
    }
}

/// What a main connection is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MainOp {
    Connect,
    Disconnect,
    /// Releasing hops of a connect that failed
    TearDown,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct MainProgress {
    pub(crate) op: MainOp,
    pub(crate) pending: usize,
    pub(crate) failed: bool,
}

pub struct ControlPlane {
    pub(crate) registry: Box<dyn Registry>,
    pub(crate) controller: Box<dyn Controller>,
    pub(crate) adapters: Vec<Box<dyn DomainAdapter>>,
    pub(crate) owners: AdapterRegistry,
    pub(crate) handles: HandleTracker,
    pub(crate) progress: HashMap<MainConnectionId, MainProgress>,
    /// Last acknowledged volume per endpoint, seeded on first dispatch
    pub(crate) committed_sink_volumes: HashMap<SinkId, Volume>,
    pub(crate) committed_source_volumes: HashMap<SourceId, Volume>,
    pub(crate) settings: ControlSettings,
    completions: CompletionSender,
    notifications: broadcast::Sender<Notification>,
}

impl ControlPlane {
    pub fn new(
        registry: Box<dyn Registry>,
        controller: Box<dyn Controller>,
        completions: CompletionSender,
        settings: ControlSettings,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            registry,
            controller,
            adapters: Vec::new(),
            owners: AdapterRegistry::new(),
            handles: HandleTracker::new(),
            progress: HashMap::new(),
            committed_sink_volumes: HashMap::new(),
            committed_source_volumes: HashMap::new(),
            settings,
            completions,
            notifications,
        }
    }

    /// Add an adapter and let it register everything it owns
    pub fn add_adapter(&mut self, mut adapter: Box<dyn DomainAdapter>) -> Result<AdapterKey> {
        let key = AdapterKey(self.adapters.len());
        let mut registrar = PlaneRegistrar {
            registry: self.registry.as_mut(),
            owners: &mut self.owners,
            key,
        };
        adapter.register(&mut registrar, self.completions.clone())?;

        info!(adapter = adapter.name(), key = key.0, "Domain adapter registered");
        self.adapters.push(adapter);
        Ok(key)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub(crate) fn notifier(&self) -> broadcast::Sender<Notification> {
        self.notifications.clone()
    }

    pub(crate) fn notify(&self, notification: Notification) {
        trace!(?notification, "Notify observers");
        // Nobody listening is fine
        let _ = self.notifications.send(notification);
    }

    pub fn registry(&self) -> &dyn Registry {
        self.registry.as_ref()
    }

    pub fn settings(&self) -> ControlSettings {
        self.settings
    }

    /// Candidate routes between a source and a sink, best first
    pub fn resolve(&self, source: SourceId, sink: SinkId, only_free: bool) -> Result<Vec<Route>> {
        Ok(router::resolve(
            self.registry.as_ref(),
            self.controller.as_ref(),
            only_free,
            source,
            sink,
        )?)
    }

    /// Outstanding handles in id order
    pub fn list_handles(&self) -> Vec<Handle> {
        self.handles.list()
    }

    pub fn pending(&self, handle: Handle) -> Option<&PendingAction> {
        self.handles.get(handle)
    }

    /// Connect one hop
    ///
    /// A provisional connection is entered before the adapter is contacted,
    /// so a second request for the same source, sink and format fails with
    /// `AlreadyExists` until the first one is rolled back.
    pub fn connect(&mut self, hop: &Hop) -> Result<Handle> {
        self.dispatch_connect(hop, None).map(|(handle, _)| handle)
    }

    /// Disconnect one committed connection
    pub fn disconnect(&mut self, connection: ConnectionId) -> Result<Handle> {
        self.dispatch_disconnect(connection, None)
    }

    pub fn set_sink_volume(
        &mut self,
        sink: SinkId,
        volume: Volume,
        ramp: RampType,
        time_ms: u16,
    ) -> Result<Handle> {
        self.dispatch_sink_volume(sink, volume, ramp, time_ms, None)
    }

    pub fn set_source_volume(
        &mut self,
        source: SourceId,
        target: Volume,
        ramp: RampType,
        time_ms: u16,
    ) -> Result<Handle> {
        check_volume(target)?;
        let previous = self.registry.source_volume(source)?;
        if previous == target {
            return Err(RoutingError::NoChange);
        }

        let domain = self.source_domain(source)?;
        let key = self.owners.for_source(source)?;
        self.committed_source_volumes.entry(source).or_insert(previous);
        self.dispatch(
            key,
            domain,
            HandleData::SourceVolume {
                source,
                target,
                previous,
            },
            |adapter, handle| adapter.async_set_source_volume(handle, source, target, ramp, time_ms),
        )
    }

    pub fn set_source_state(&mut self, source: SourceId, state: SourceState) -> Result<Handle> {
        if self.registry.source_state(source)? == state {
            return Err(RoutingError::NoChange);
        }

        let domain = self.source_domain(source)?;
        let key = self.owners.for_source(source)?;
        self.dispatch(
            key,
            domain,
            HandleData::SourceState {
                source,
                target: state,
            },
            |adapter, handle| adapter.async_set_source_state(handle, source, state),
        )
    }

    pub fn set_sink_sound_property(&mut self, sink: SinkId, property: SoundProperty) -> Result<Handle> {
        self.dispatch_sink_sound_property(sink, property, false)
    }

    pub fn set_source_sound_property(&mut self, source: SourceId, property: SoundProperty) -> Result<Handle> {
        self.dispatch_source_sound_property(source, property, false)
    }

    /// Switch the audible sink of a crossfader
    pub fn cross_fade(
        &mut self,
        crossfader: CrossfaderId,
        hot_sink: HotSink,
        ramp: RampType,
        time_ms: u16,
    ) -> Result<Handle> {
        let record = self
            .registry
            .crossfader(crossfader)
            .ok_or_else(|| RoutingError::NotFound(format!("crossfader {crossfader}")))?;
        if record.hot_sink == hot_sink {
            return Err(RoutingError::NoChange);
        }

        let domain = self.sink_domain(record.sink_a)?;
        let key = self.owners.for_crossfader(crossfader)?;
        self.dispatch(
            key,
            domain,
            HandleData::CrossFade {
                crossfader,
                hot_sink,
            },
            |adapter, handle| adapter.async_cross_fade(handle, crossfader, hot_sink, ramp, time_ms),
        )
    }

    /// Ask the adapter running `handle` to cancel it
    ///
    /// The handle stays outstanding until the adapter's `Aborted`
    /// acknowledgment is processed.
    pub fn abort(&mut self, handle: Handle) -> Result<()> {
        let domain = self
            .handles
            .get(handle)
            .ok_or_else(|| RoutingError::NotFound(format!("handle {handle}")))?
            .domain;
        let key = self.owners.for_domain(domain)?;
        debug!(%handle, %domain, "Abort requested");
        self.adapter_mut(key)?.abort(handle)
    }

    pub fn set_domain_state(&mut self, domain: DomainId, state: DomainState) -> Result<()> {
        let current = self
            .registry
            .domain(domain)
            .ok_or_else(|| RoutingError::NotFound(format!("domain {domain}")))?
            .state;
        if current == state {
            return Err(RoutingError::NoChange);
        }

        let key = self.owners.for_domain(domain)?;
        self.adapter_mut(key)?.set_domain_state(domain, state)
    }

    pub(crate) fn dispatch_connect(
        &mut self,
        hop: &Hop,
        main: Option<MainConnectionId>,
    ) -> Result<(Handle, ConnectionId)> {
        let (source, sink, format) = (hop.source_id, hop.sink_id, hop.format);
        if !self.registry.source_exists(source) {
            return Err(RoutingError::NotFound(format!("source {source}")));
        }
        if !self.registry.sink_exists(sink) {
            return Err(RoutingError::NotFound(format!("sink {sink}")));
        }

        let key = self.owners.for_domain(hop.domain_id)?;
        let connection = self.registry.enter_connection(source, sink, format)?;
        self.owners.add_connection(connection, key);

        let dispatched = self.dispatch(
            key,
            hop.domain_id,
            HandleData::Connect { connection, main },
            |adapter, handle| adapter.async_connect(handle, connection, source, sink, format),
        );

        match dispatched {
            Ok(handle) => Ok((handle, connection)),
            Err(err) => {
                self.discard_connection(connection);
                Err(err)
            }
        }
    }

    pub(crate) fn dispatch_disconnect(
        &mut self,
        connection: ConnectionId,
        main: Option<MainConnectionId>,
    ) -> Result<Handle> {
        let record = self
            .registry
            .connection(connection)
            .ok_or_else(|| RoutingError::NotFound(format!("connection {connection}")))?;
        if !record.committed {
            return Err(RoutingError::NotPossible(format!(
                "connection {connection} is still being connected"
            )));
        }
        let in_flight = self.handles.iter().any(|action| {
            matches!(action.data, HandleData::Disconnect { connection: c, .. } if c == connection)
        });
        if in_flight {
            return Err(RoutingError::NotPossible(format!(
                "connection {connection} is already being disconnected"
            )));
        }

        let domain = self.sink_domain(record.sink_id)?;
        let key = self.owners.for_connection(connection)?;
        self.dispatch(
            key,
            domain,
            HandleData::Disconnect { connection, main },
            |adapter, handle| adapter.async_disconnect(handle, connection),
        )
    }

    pub(crate) fn dispatch_sink_volume(
        &mut self,
        sink: SinkId,
        target: Volume,
        ramp: RampType,
        time_ms: u16,
        main: Option<MainSinkChange>,
    ) -> Result<Handle> {
        check_volume(target)?;
        let previous = self.registry.sink_volume(sink)?;
        if previous == target {
            return Err(RoutingError::NoChange);
        }

        let domain = self.sink_domain(sink)?;
        let key = self.owners.for_sink(sink)?;
        self.committed_sink_volumes.entry(sink).or_insert(previous);
        self.dispatch(
            key,
            domain,
            HandleData::SinkVolume {
                sink,
                target,
                previous,
                main,
            },
            |adapter, handle| adapter.async_set_sink_volume(handle, sink, target, ramp, time_ms),
        )
    }

    pub(crate) fn dispatch_sink_sound_property(
        &mut self,
        sink: SinkId,
        property: SoundProperty,
        main: bool,
    ) -> Result<Handle> {
        let record = self
            .registry
            .sink(sink)
            .ok_or_else(|| RoutingError::NotFound(format!("sink {sink}")))?;
        let properties = if main {
            &record.main_sound_properties
        } else {
            &record.sound_properties
        };
        if properties.get(&property.kind) == Some(&property.value) {
            return Err(RoutingError::NoChange);
        }

        let domain = record.domain_id;
        let key = self.owners.for_sink(sink)?;
        self.dispatch(
            key,
            domain,
            HandleData::SinkSoundProperty { sink, property, main },
            |adapter, handle| adapter.async_set_sink_sound_property(handle, sink, property),
        )
    }

    pub(crate) fn dispatch_source_sound_property(
        &mut self,
        source: SourceId,
        property: SoundProperty,
        main: bool,
    ) -> Result<Handle> {
        let record = self
            .registry
            .source(source)
            .ok_or_else(|| RoutingError::NotFound(format!("source {source}")))?;
        let properties = if main {
            &record.main_sound_properties
        } else {
            &record.sound_properties
        };
        if properties.get(&property.kind) == Some(&property.value) {
            return Err(RoutingError::NoChange);
        }

        let domain = record.domain_id;
        let key = self.owners.for_source(source)?;
        self.dispatch(
            key,
            domain,
            HandleData::SourceSoundProperty {
                source,
                property,
                main,
            },
            |adapter, handle| adapter.async_set_source_sound_property(handle, source, property),
        )
    }

    /// Allocate a handle and hand the action to its adapter
    ///
    /// The handle is released again if the adapter rejects the action.
    fn dispatch<F>(&mut self, key: AdapterKey, domain: DomainId, data: HandleData, call: F) -> Result<Handle>
    where
        F: FnOnce(&mut dyn DomainAdapter, Handle) -> Result<()>,
    {
        let handle = self.handles.create(domain, data);
        let Some(adapter) = self.adapters.get_mut(key.0) else {
            self.handles.remove(handle);
            return Err(RoutingError::NotFound(format!("adapter {}", key.0)));
        };

        if let Err(err) = call(adapter.as_mut(), handle) {
            warn!(%handle, %domain, error = %err, "Adapter rejected action");
            self.handles.remove(handle);
            return Err(err);
        }

        debug!(%handle, %domain, "Action dispatched");
        Ok(handle)
    }

    fn adapter_mut(&mut self, key: AdapterKey) -> Result<&mut (dyn DomainAdapter + 'static)> {
        self.adapters
            .get_mut(key.0)
            .map(|adapter| adapter.as_mut())
            .ok_or_else(|| RoutingError::NotFound(format!("adapter {}", key.0)))
    }

    /// Drop a provisional or released connection from the registry and ownership map
    pub(crate) fn discard_connection(&mut self, connection: ConnectionId) {
        self.owners.remove_connection(connection);
        if let Err(err) = self.registry.remove_connection(connection) {
            warn!(%connection, error = %err, "Failed to remove connection");
        }
    }

    pub(crate) fn sink_domain(&self, sink: SinkId) -> Result<DomainId> {
        self.registry
            .sink(sink)
            .map(|s| s.domain_id)
            .ok_or_else(|| RoutingError::NotFound(format!("sink {sink}")))
    }

    pub(crate) fn source_domain(&self, source: SourceId) -> Result<DomainId> {
        self.registry
            .source(source)
            .map(|s| s.domain_id)
            .ok_or_else(|| RoutingError::NotFound(format!("source {source}")))
    }

    pub(crate) fn set_main_state(&mut self, id: MainConnectionId, state: ConnectionState) {
        if let Err(err) = self.registry.change_main_connection_state(id, state) {
            warn!(main_connection = %id, error = %err, "Failed to change main connection state");
            return;
        }
        info!(main_connection = %id, ?state, "Main connection state");
        self.controller.on_main_connection_state(id, state);
        self.notify(Notification::MainConnectionState { id, state });
    }

    pub(crate) fn remove_main(&mut self, id: MainConnectionId) {
        self.progress.remove(&id);
        if let Err(err) = self.registry.remove_main_connection(id) {
            warn!(main_connection = %id, error = %err, "Failed to remove main connection");
            return;
        }
        debug!(main_connection = %id, "Main connection removed");
        self.notify(Notification::MainConnectionRemoved { id });
    }

    /// Recompute the aggregate delay of a main connection
    pub(crate) fn refresh_main_delay(&mut self, id: MainConnectionId) {
        let Some(main) = self.registry.main_connection(id) else {
            return;
        };

        let mut total: Option<i16> = Some(0);
        for connection in &main.connections {
            let delay = self.registry.connection(*connection).and_then(|c| c.delay);
            total = match (total, delay) {
                (Some(sum), Some(hop)) => Some(sum.saturating_add(hop)),
                _ => None,
            };
        }

        if main.delay == total {
            return;
        }
        if let Err(err) = self.registry.change_main_connection_delay(id, total) {
            warn!(main_connection = %id, error = %err, "Failed to change main connection delay");
            return;
        }
        self.notify(Notification::MainConnectionDelay { id, delay: total });
    }
}

fn check_volume(target: Volume) -> Result<()> {
    if volume::clamp(target) != target {
        return Err(RoutingError::NotPossible(format!(
            "volume {target} outside {}..={}",
            volume::MIN,
            volume::MAX
        )));
    }
    Ok(())
}

/// Registration surface scoped to one adapter
///
/// Endpoints may only be registered into domains the adapter itself owns.
struct PlaneRegistrar<'a> {
    registry: &'a mut dyn Registry,
    owners: &'a mut AdapterRegistry,
    key: AdapterKey,
}

impl PlaneRegistrar<'_> {
    fn check_owner(&self, domain: DomainId) -> Result<()> {
        if self.owners.for_domain(domain)? != self.key {
            return Err(RoutingError::NotPossible(format!(
                "domain {domain} belongs to another adapter"
            )));
        }
        Ok(())
    }
}

impl Registrar for PlaneRegistrar<'_> {
    fn register_domain(&mut self, domain: Domain) -> Result<DomainId> {
        let id = self.registry.enter_domain(domain)?;
        self.owners.add_domain(id, self.key);
        Ok(id)
    }

    fn register_source(&mut self, source: Source) -> Result<SourceId> {
        self.check_owner(source.domain_id)?;
        let id = self.registry.enter_source(source)?;
        self.owners.add_source(id, self.key);
        Ok(id)
    }

    fn register_sink(&mut self, sink: Sink) -> Result<SinkId> {
        self.check_owner(sink.domain_id)?;
        let id = self.registry.enter_sink(sink)?;
        self.owners.add_sink(id, self.key);
        Ok(id)
    }

    fn register_gateway(&mut self, gateway: Gateway) -> Result<GatewayId> {
        self.check_owner(gateway.control_domain_id)?;
        self.registry.enter_gateway(gateway)
    }

    fn register_crossfader(&mut self, crossfader: Crossfader) -> Result<CrossfaderId> {
        let domain = self
            .registry
            .sink(crossfader.sink_a)
            .map(|sink| sink.domain_id)
            .ok_or_else(|| RoutingError::NotFound(format!("sink {}", crossfader.sink_a)))?;
        self.check_owner(domain)?;
        let id = self.registry.enter_crossfader(crossfader)?;
        self.owners.add_crossfader(id, self.key);
        Ok(id)
    }
}
