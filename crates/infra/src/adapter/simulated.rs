//! Simulated domain adapter
//!
//! Stands in for real domain hardware. Each accepted action becomes a job on
//! the adapter's [`WorkerPool`]: it waits the configured latency (or walks a
//! volume ramp tick by tick), updates the adapter's own endpoint tables and
//! reports through the completion queue. Registry state is never touched
//! from here.

use crate::worker::{CancelToken, JobTicket, PoolError, WorkerPool};
use minstrel_core::control::{Completion, CompletionSender};
use minstrel_core::domain::config::{AppConfig, DomainConfig};
use minstrel_core::domain::{
    Availability, Connection, ConnectionFormat, ConnectionId, DomainAdapter, DomainId, DomainState,
    Handle, InterruptState, RampType, Registrar, RoutingError, Sink, SinkId, SoundProperty, Source,
    SourceId, SourceState, Volume,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

type Result<T> = minstrel_core::domain::audio::Result<T>;

/// Pacing of simulated jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedTiming {
    pub job_latency: Duration,
    pub ramp_tick: Duration,
    /// Delay reported for each connected hop
    pub connection_delay_ms: Option<i16>,
}

impl Default for SimulatedTiming {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SimulatedTiming {
    fn from(config: &AppConfig) -> Self {
        Self {
            job_latency: Duration::from_millis(config.job_latency_ms),
            ramp_tick: Duration::from_millis(config.ramp_tick_ms.max(1)),
            connection_delay_ms: config.connection_delay_ms,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the adapter and its running jobs
///
/// One coarse lock per table, never held across a wait.
struct Shared {
    domain: DomainId,
    completions: OnceLock<CompletionSender>,
    sources: Mutex<HashMap<SourceId, Source>>,
    sinks: Mutex<HashMap<SinkId, Sink>>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    jobs: Mutex<HashMap<u32, JobTicket>>,
}

impl Shared {
    fn send(&self, completion: Completion) -> bool {
        match self.completions.get() {
            Some(completions) => completions.send(completion),
            None => {
                warn!(domain = %self.domain, "Adapter not registered, completion dropped");
                false
            }
        }
    }

    /// Forget the job and deliver its terminal acknowledgment
    fn finish(&self, handle: Handle, completion: Completion) {
        lock(&self.jobs).remove(&handle.id);
        trace!(%handle, "Job finished");
        self.send(completion);
    }
}

/// Reports a failed acknowledgment when a job unwinds before finishing
struct UnwindAck {
    shared: Arc<Shared>,
    handle: Handle,
    failure: Option<Box<dyn FnOnce(Result<()>) -> Completion + Send>>,
}

impl Drop for UnwindAck {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        if let Some(failure) = self.failure.take() {
            warn!(handle = %self.handle, "Job panicked, reporting failure");
            let result = Err(RoutingError::NotPossible("simulated job panicked".to_string()));
            self.shared.finish(self.handle, failure(result));
        }
    }
}

pub struct SimulatedDomainAdapter {
    config: DomainConfig,
    timing: SimulatedTiming,
    pool: WorkerPool,
    shared: Arc<Shared>,
}

impl SimulatedDomainAdapter {
    pub fn new(config: DomainConfig, timing: SimulatedTiming, workers: usize) -> std::result::Result<Self, PoolError> {
        let pool = WorkerPool::new(&format!("minstrel-d{}", config.id), workers)?;
        let shared = Arc::new(Shared {
            domain: config.domain_id(),
            completions: OnceLock::new(),
            sources: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
        });

        Ok(Self {
            config,
            timing,
            pool,
            shared,
        })
    }

    pub fn from_app_config(config: DomainConfig, app: &AppConfig) -> std::result::Result<Self, PoolError> {
        Self::new(config, SimulatedTiming::from(app), app.worker_threads)
    }

    /// Side channel for hardware-originated events and inspection
    pub fn events(&self) -> DomainEvents {
        DomainEvents {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Hand a job to the pool and remember its ticket under `handle`
    ///
    /// The job table stays locked until the ticket is stored so a job that
    /// finishes immediately cannot race its own registration. If the job
    /// panics, `failure` builds the acknowledgment that closes the handle.
    fn submit<F, E>(&self, handle: Handle, failure: E, job: F) -> Result<()>
    where
        F: FnOnce(&CancelToken) + Send + 'static,
        E: FnOnce(Result<()>) -> Completion + Send + 'static,
    {
        let guard = UnwindAck {
            shared: Arc::clone(&self.shared),
            handle,
            failure: Some(Box::new(failure)),
        };
        let mut jobs = lock(&self.shared.jobs);
        let ticket = self.pool.submit(move |cancel: &CancelToken| {
            let _guard = guard;
            job(cancel);
        })?;
        jobs.insert(handle.id, ticket);
        debug!(%handle, slot = ticket.slot, domain = %self.shared.domain, "Job accepted");
        Ok(())
    }

    fn sink(&self, sink: SinkId) -> Result<Sink> {
        lock(&self.shared.sinks)
            .get(&sink)
            .cloned()
            .ok_or_else(|| RoutingError::NotFound(format!("sink {sink} in domain {}", self.shared.domain)))
    }

    fn source(&self, source: SourceId) -> Result<Source> {
        lock(&self.shared.sources)
            .get(&source)
            .cloned()
            .ok_or_else(|| RoutingError::NotFound(format!("source {source} in domain {}", self.shared.domain)))
    }

    /// Wait out the job latency, then apply `commit` unless cancelled
    fn submit_timed<C>(&self, handle: Handle, commit: C, ack: fn(Handle, Result<()>) -> Completion) -> Result<()>
    where
        C: FnOnce(&Shared) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let latency = self.timing.job_latency;
        self.submit(handle, move |result| ack(handle, result), move |cancel: &CancelToken| {
            if cancel.wait(latency) {
                debug!(%handle, "Job aborted");
                shared.finish(handle, ack(handle, Err(RoutingError::Aborted)));
                return;
            }
            commit(&shared);
            shared.finish(handle, ack(handle, Ok(())));
        })
    }
}

impl DomainAdapter for SimulatedDomainAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn register(&mut self, registrar: &mut dyn Registrar, completions: CompletionSender) -> Result<()> {
        if self.shared.completions.set(completions).is_err() {
            return Err(RoutingError::AlreadyExists(format!("adapter {}", self.config.name)));
        }

        let domain = registrar.register_domain(self.config.to_domain())?;

        for config in &self.config.sources {
            let source = config.to_source(domain);
            registrar.register_source(source.clone())?;
            lock(&self.shared.sources).insert(source.id, source);
        }
        for config in &self.config.sinks {
            let sink = config.to_sink(domain);
            registrar.register_sink(sink.clone())?;
            lock(&self.shared.sinks).insert(sink.id, sink);
        }
        for config in &self.config.gateways {
            registrar.register_gateway(config.to_gateway(domain))?;
        }

        info!(
            %domain,
            name = %self.config.name,
            sources = self.config.sources.len(),
            sinks = self.config.sinks.len(),
            gateways = self.config.gateways.len(),
            "Simulated domain registered"
        );
        Ok(())
    }

    fn async_connect(
        &mut self,
        handle: Handle,
        connection: ConnectionId,
        source: SourceId,
        sink: SinkId,
        format: ConnectionFormat,
    ) -> Result<()> {
        let source_record = self.source(source)?;
        let sink_record = self.sink(sink)?;
        if !source_record.supports(format) || !sink_record.supports(format) {
            return Err(RoutingError::WrongFormat(format!("{format} for {source} -> {sink}")));
        }

        let delay = self.timing.connection_delay_ms;
        self.submit_timed(
            handle,
            move |shared| {
                lock(&shared.connections).insert(
                    connection,
                    Connection {
                        id: connection,
                        source_id: source,
                        sink_id: sink,
                        format,
                        delay,
                        committed: true,
                    },
                );
                if let Some(delay) = delay {
                    shared.send(Completion::ConnectionDelay { connection, delay });
                }
            },
            |handle, result| Completion::ConnectAck { handle, result },
        )
    }

    fn async_disconnect(&mut self, handle: Handle, connection: ConnectionId) -> Result<()> {
        if !lock(&self.shared.connections).contains_key(&connection) {
            return Err(RoutingError::NotFound(format!("connection {connection}")));
        }

        self.submit_timed(
            handle,
            move |shared| {
                lock(&shared.connections).remove(&connection);
            },
            |handle, result| Completion::DisconnectAck { handle, result },
        )
    }

    fn async_set_sink_volume(
        &mut self,
        handle: Handle,
        sink: SinkId,
        volume: Volume,
        ramp: RampType,
        time_ms: u16,
    ) -> Result<()> {
        let from = self.sink(sink)?.volume;
        let shared = Arc::clone(&self.shared);
        let timing = self.timing;

        let failure = move |result| Completion::SinkVolumeAck {
            handle,
            volume: from,
            result,
        };
        self.submit(handle, failure, move |cancel: &CancelToken| {
            let (settled, result) = run_ramp(cancel, &timing, from, volume, ramp, time_ms, |current| {
                if let Some(record) = lock(&shared.sinks).get_mut(&sink) {
                    record.volume = current;
                }
                shared.send(Completion::SinkVolumeTick {
                    handle,
                    sink,
                    volume: current,
                });
            });
            if let Some(record) = lock(&shared.sinks).get_mut(&sink) {
                record.volume = settled;
            }
            shared.finish(
                handle,
                Completion::SinkVolumeAck {
                    handle,
                    volume: settled,
                    result,
                },
            );
        })
    }

    fn async_set_source_volume(
        &mut self,
        handle: Handle,
        source: SourceId,
        volume: Volume,
        ramp: RampType,
        time_ms: u16,
    ) -> Result<()> {
        let from = self.source(source)?.volume;
        let shared = Arc::clone(&self.shared);
        let timing = self.timing;

        let failure = move |result| Completion::SourceVolumeAck {
            handle,
            volume: from,
            result,
        };
        self.submit(handle, failure, move |cancel: &CancelToken| {
            let (settled, result) = run_ramp(cancel, &timing, from, volume, ramp, time_ms, |current| {
                if let Some(record) = lock(&shared.sources).get_mut(&source) {
                    record.volume = current;
                }
                shared.send(Completion::SourceVolumeTick {
                    handle,
                    source,
                    volume: current,
                });
            });
            if let Some(record) = lock(&shared.sources).get_mut(&source) {
                record.volume = settled;
            }
            shared.finish(
                handle,
                Completion::SourceVolumeAck {
                    handle,
                    volume: settled,
                    result,
                },
            );
        })
    }

    fn async_set_source_state(&mut self, handle: Handle, source: SourceId, state: SourceState) -> Result<()> {
        self.source(source)?;
        self.submit_timed(
            handle,
            move |shared| {
                if let Some(record) = lock(&shared.sources).get_mut(&source) {
                    record.state = state;
                }
            },
            |handle, result| Completion::SourceStateAck { handle, result },
        )
    }

    fn async_set_sink_sound_property(
        &mut self,
        handle: Handle,
        sink: SinkId,
        property: SoundProperty,
    ) -> Result<()> {
        self.sink(sink)?;
        self.submit_timed(
            handle,
            move |shared| {
                if let Some(record) = lock(&shared.sinks).get_mut(&sink) {
                    record.sound_properties.insert(property.kind, property.value);
                }
            },
            |handle, result| Completion::SinkSoundPropertyAck { handle, result },
        )
    }

    fn async_set_source_sound_property(
        &mut self,
        handle: Handle,
        source: SourceId,
        property: SoundProperty,
    ) -> Result<()> {
        self.source(source)?;
        self.submit_timed(
            handle,
            move |shared| {
                if let Some(record) = lock(&shared.sources).get_mut(&source) {
                    record.sound_properties.insert(property.kind, property.value);
                }
            },
            |handle, result| Completion::SourceSoundPropertyAck { handle, result },
        )
    }

    fn abort(&mut self, handle: Handle) -> Result<()> {
        let ticket = lock(&self.shared.jobs)
            .get(&handle.id)
            .copied()
            .ok_or_else(|| RoutingError::NotFound(format!("job for {handle}")))?;
        if !self.pool.cancel(ticket) {
            debug!(%handle, "Job already finishing, abort has no effect");
        }
        Ok(())
    }

    fn set_domain_state(&mut self, domain: DomainId, state: DomainState) -> Result<()> {
        if domain != self.shared.domain {
            return Err(RoutingError::NotFound(format!("domain {domain}")));
        }
        info!(%domain, ?state, "Domain state change requested");
        if !self.shared.send(Completion::DomainState { domain, state }) {
            return Err(RoutingError::NotPossible("completion queue closed".to_string()));
        }
        Ok(())
    }
}

/// Walk a volume from `from` to `to`
///
/// `tick` sees every intermediate value. Returns the value reached and the
/// terminal result, `Aborted` if the token fired first.
fn run_ramp(
    cancel: &CancelToken,
    timing: &SimulatedTiming,
    from: Volume,
    to: Volume,
    ramp: RampType,
    time_ms: u16,
    mut tick: impl FnMut(Volume),
) -> (Volume, Result<()>) {
    match ramp {
        RampType::Direct => {
            if cancel.wait(timing.job_latency) {
                return (from, Err(RoutingError::Aborted));
            }
            (to, Ok(()))
        }
        RampType::Linear => {
            let tick_ms = (timing.ramp_tick.as_millis() as u64).max(1);
            let steps = (u64::from(time_ms) / tick_ms).max(1) as i32;
            let mut current = from;
            for step in 1..=steps {
                if cancel.wait(timing.ramp_tick) {
                    return (current, Err(RoutingError::Aborted));
                }
                current = interpolate(from, to, step, steps);
                if step < steps {
                    tick(current);
                }
            }
            (to, Ok(()))
        }
    }
}

fn interpolate(from: Volume, to: Volume, step: i32, steps: i32) -> Volume {
    let from = i32::from(from);
    let delta = (i32::from(to) - from) * step / steps;
    (from + delta) as Volume
}

/// Cloneable view into a simulated adapter after it was handed to the plane
#[derive(Clone)]
pub struct DomainEvents {
    shared: Arc<Shared>,
}

impl DomainEvents {
    pub fn domain(&self) -> DomainId {
        self.shared.domain
    }

    pub fn sink_availability(&self, sink: SinkId, availability: Availability) -> Result<()> {
        match lock(&self.shared.sinks).get_mut(&sink) {
            Some(record) => record.availability = availability,
            None => return Err(RoutingError::NotFound(format!("sink {sink}"))),
        }
        self.report(Completion::SinkAvailability { sink, availability })
    }

    pub fn source_availability(&self, source: SourceId, availability: Availability) -> Result<()> {
        match lock(&self.shared.sources).get_mut(&source) {
            Some(record) => record.availability = availability,
            None => return Err(RoutingError::NotFound(format!("source {source}"))),
        }
        self.report(Completion::SourceAvailability { source, availability })
    }

    pub fn interrupt_state(&self, source: SourceId, state: InterruptState) -> Result<()> {
        match lock(&self.shared.sources).get_mut(&source) {
            Some(record) => record.interrupt_state = state,
            None => return Err(RoutingError::NotFound(format!("source {source}"))),
        }
        self.report(Completion::InterruptState { source, state })
    }

    fn report(&self, completion: Completion) -> Result<()> {
        if self.shared.send(completion) {
            Ok(())
        } else {
            Err(RoutingError::NotPossible(format!(
                "domain {} cannot report events",
                self.shared.domain
            )))
        }
    }

    /// Connections the simulated hardware currently carries
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = lock(&self.shared.connections).keys().copied().collect();
        ids.sort_by_key(|id| id.get());
        ids
    }

    pub fn sink_volume(&self, sink: SinkId) -> Option<Volume> {
        lock(&self.shared.sinks).get(&sink).map(|record| record.volume)
    }

    pub fn running_jobs(&self) -> usize {
        lock(&self.shared.jobs).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minstrel_core::control::{completion_channel, CompletionReceiver};
    use minstrel_core::domain::config::MinstrelConfig;
    use minstrel_core::domain::{
        Crossfader, CrossfaderId, Domain, Gateway, GatewayId, HandleKind, HotSink,
    };

    #[derive(Default)]
    struct Recorded {
        domains: Vec<Domain>,
        sources: Vec<Source>,
        sinks: Vec<Sink>,
        gateways: Vec<Gateway>,
    }

    impl Registrar for Recorded {
        fn register_domain(&mut self, domain: Domain) -> Result<DomainId> {
            let id = domain.id;
            self.domains.push(domain);
            Ok(id)
        }

        fn register_source(&mut self, source: Source) -> Result<SourceId> {
            let id = source.id;
            self.sources.push(source);
            Ok(id)
        }

        fn register_sink(&mut self, sink: Sink) -> Result<SinkId> {
            let id = sink.id;
            self.sinks.push(sink);
            Ok(id)
        }

        fn register_gateway(&mut self, gateway: Gateway) -> Result<GatewayId> {
            let id = gateway.id;
            self.gateways.push(gateway);
            Ok(id)
        }

        fn register_crossfader(&mut self, crossfader: Crossfader) -> Result<CrossfaderId> {
            Ok(crossfader.id)
        }
    }

    fn fast() -> SimulatedTiming {
        SimulatedTiming {
            job_latency: Duration::from_millis(5),
            ramp_tick: Duration::from_millis(2),
            connection_delay_ms: Some(3),
        }
    }

    fn slow() -> SimulatedTiming {
        SimulatedTiming {
            job_latency: Duration::from_secs(10),
            ramp_tick: Duration::from_secs(10),
            connection_delay_ms: None,
        }
    }

    /// Infotainment domain of the factory topology, registered
    fn infotainment(timing: SimulatedTiming, workers: usize) -> (SimulatedDomainAdapter, CompletionReceiver) {
        let config = MinstrelConfig::factory_default().topology.domains[0].clone();
        let mut adapter = SimulatedDomainAdapter::new(config, timing, workers).unwrap();
        let (tx, rx) = completion_channel();
        adapter.register(&mut Recorded::default(), tx).unwrap();
        (adapter, rx)
    }

    fn handle(id: u32, kind: HandleKind) -> Handle {
        Handle { id, kind }
    }

    async fn next(rx: &mut CompletionReceiver) -> Completion {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("completion timed out")
            .expect("queue closed")
    }

    #[test]
    fn test_register_announces_topology() {
        let config = MinstrelConfig::factory_default().topology.domains[0].clone();
        let mut adapter = SimulatedDomainAdapter::new(config, fast(), 1).unwrap();
        let mut recorded = Recorded::default();
        let (tx, _rx) = completion_channel();

        adapter.register(&mut recorded, tx.clone()).unwrap();
        assert_eq!(recorded.domains.len(), 1);
        assert_eq!(recorded.sources.len(), 1);
        assert_eq!(recorded.sinks.len(), 1);
        assert_eq!(recorded.gateways.len(), 1);
        assert_eq!(recorded.gateways[0].control_domain_id, DomainId::new(1));

        let err = adapter.register(&mut Recorded::default(), tx).unwrap_err();
        assert!(matches!(err, RoutingError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_connect_reports_delay_then_ack() {
        let (mut adapter, mut rx) = infotainment(fast(), 2);
        let h = handle(1, HandleKind::Connect);
        let connection = ConnectionId::new(1);

        adapter
            .async_connect(h, connection, SourceId::new(1), SinkId::new(100), ConnectionFormat::Pcm)
            .unwrap();

        assert_eq!(next(&mut rx).await, Completion::ConnectionDelay { connection, delay: 3 });
        assert_eq!(next(&mut rx).await, Completion::ConnectAck { handle: h, result: Ok(()) });
        assert_eq!(adapter.events().connections(), vec![connection]);

        let h = handle(2, HandleKind::Disconnect);
        adapter.async_disconnect(h, connection).unwrap();
        assert_eq!(next(&mut rx).await, Completion::DisconnectAck { handle: h, result: Ok(()) });
        assert!(adapter.events().connections().is_empty());
    }

    #[test]
    fn test_connect_validates_locally() {
        let (mut adapter, _rx) = infotainment(fast(), 1);
        let h = handle(1, HandleKind::Connect);

        let err = adapter
            .async_connect(h, ConnectionId::new(1), SourceId::new(1), SinkId::new(100), ConnectionFormat::Analog)
            .unwrap_err();
        assert!(matches!(err, RoutingError::WrongFormat(_)));

        let err = adapter
            .async_connect(h, ConnectionId::new(1), SourceId::new(1), SinkId::new(1), ConnectionFormat::Pcm)
            .unwrap_err();
        assert!(matches!(err, RoutingError::NotFound(_)));

        let err = adapter.async_disconnect(h, ConnectionId::new(9)).unwrap_err();
        assert!(matches!(err, RoutingError::NotFound(_)));
        assert_eq!(adapter.events().running_jobs(), 0);
    }

    #[tokio::test]
    async fn test_abort_produces_aborted_ack() {
        let (mut adapter, mut rx) = infotainment(slow(), 1);
        let h = handle(7, HandleKind::Connect);

        adapter
            .async_connect(h, ConnectionId::new(1), SourceId::new(1), SinkId::new(100), ConnectionFormat::Pcm)
            .unwrap();
        assert_eq!(adapter.events().running_jobs(), 1);

        adapter.abort(h).unwrap();
        assert_eq!(
            next(&mut rx).await,
            Completion::ConnectAck {
                handle: h,
                result: Err(RoutingError::Aborted),
            }
        );
        assert!(adapter.events().connections().is_empty());
        assert_eq!(adapter.events().running_jobs(), 0);
        assert!(matches!(adapter.abort(h), Err(RoutingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_panicking_job_still_acknowledges() {
        let (adapter, mut rx) = infotainment(fast(), 1);
        let h = handle(4, HandleKind::SetSourceState);

        adapter
            .submit(
                h,
                move |result| Completion::SourceStateAck { handle: h, result },
                |_: &CancelToken| panic!("amplifier fault"),
            )
            .unwrap();

        match next(&mut rx).await {
            Completion::SourceStateAck { handle, result } => {
                assert_eq!(handle, h);
                assert!(matches!(result, Err(RoutingError::NotPossible(_))));
            }
            other => panic!("unexpected completion {other:?}"),
        }
        assert_eq!(adapter.events().running_jobs(), 0);
    }

    #[tokio::test]
    async fn test_saturated_pool_is_not_possible() {
        let (mut adapter, _rx) = infotainment(slow(), 1);
        adapter
            .async_set_source_state(handle(1, HandleKind::SetSourceState), SourceId::new(1), SourceState::On)
            .unwrap();

        let err = adapter
            .async_set_sink_volume(handle(2, HandleKind::SetSinkVolume), SinkId::new(100), 10, RampType::Direct, 0)
            .unwrap_err();
        assert!(matches!(err, RoutingError::NotPossible(_)));
        assert_eq!(adapter.events().running_jobs(), 1);
    }

    #[tokio::test]
    async fn test_linear_ramp_ticks_towards_target() {
        let (mut adapter, mut rx) = infotainment(fast(), 1);
        let h = handle(3, HandleKind::SetSinkVolume);
        let sink = SinkId::new(100);

        // 20 ms at 2 ms per tick: nine ticks then the final ack
        adapter
            .async_set_sink_volume(h, sink, 100, RampType::Linear, 20)
            .unwrap();

        let mut ticks = Vec::new();
        loop {
            match next(&mut rx).await {
                Completion::SinkVolumeTick { volume, .. } => ticks.push(volume),
                Completion::SinkVolumeAck { volume, result, .. } => {
                    assert_eq!(result, Ok(()));
                    assert_eq!(volume, 100);
                    break;
                }
                other => panic!("unexpected completion {other:?}"),
            }
        }

        assert_eq!(ticks.len(), 9);
        assert!(ticks.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ticks[0], 10);
        assert_eq!(adapter.events().sink_volume(sink), Some(100));
    }

    #[tokio::test]
    async fn test_aborted_ramp_settles_midway() {
        let timing = SimulatedTiming {
            ramp_tick: Duration::from_millis(20),
            ..fast()
        };
        let (mut adapter, mut rx) = infotainment(timing, 1);
        let h = handle(4, HandleKind::SetSinkVolume);
        let sink = SinkId::new(100);

        adapter
            .async_set_sink_volume(h, sink, 3000, RampType::Linear, 6000)
            .unwrap();

        let first = next(&mut rx).await;
        assert!(matches!(first, Completion::SinkVolumeTick { .. }));
        adapter.abort(h).unwrap();

        let settled = loop {
            match next(&mut rx).await {
                Completion::SinkVolumeTick { .. } => continue,
                Completion::SinkVolumeAck { volume, result, .. } => {
                    assert_eq!(result, Err(RoutingError::Aborted));
                    break volume;
                }
                other => panic!("unexpected completion {other:?}"),
            }
        };
        assert!(settled >= 10 && settled < 3000);
        assert_eq!(adapter.events().sink_volume(sink), Some(settled));
    }

    #[tokio::test]
    async fn test_events_are_reported() {
        let (mut adapter, mut rx) = infotainment(fast(), 1);
        let events = adapter.events();

        events
            .sink_availability(SinkId::new(100), Availability::Unavailable)
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            Completion::SinkAvailability {
                sink: SinkId::new(100),
                availability: Availability::Unavailable,
            }
        );
        assert!(events
            .interrupt_state(SourceId::new(42), InterruptState::Interrupted)
            .is_err());

        adapter
            .set_domain_state(DomainId::new(1), DomainState::Running)
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            Completion::DomainState {
                domain: DomainId::new(1),
                state: DomainState::Running,
            }
        );
        assert!(adapter
            .set_domain_state(DomainId::new(2), DomainState::Running)
            .is_err());
    }

    #[test]
    fn test_cross_fade_not_used() {
        let (mut adapter, _rx) = infotainment(fast(), 1);
        let err = adapter
            .async_cross_fade(
                handle(1, HandleKind::CrossFade),
                CrossfaderId::new(1),
                HotSink::SinkB,
                RampType::Linear,
                100,
            )
            .unwrap_err();
        assert!(matches!(err, RoutingError::NotUsed(_)));
    }

    #[test]
    fn test_interpolate_is_exact_at_ends() {
        assert_eq!(interpolate(0, 100, 0, 10), 0);
        assert_eq!(interpolate(0, 100, 10, 10), 100);
        assert_eq!(interpolate(-3000, 0, 5, 10), -1500);
        assert_eq!(interpolate(100, -100, 1, 4), 50);
    }

    proptest::proptest! {
        #[test]
        fn prop_ramp_stays_between_endpoints(
            from in -3000i16..=3000,
            to in -3000i16..=3000,
            steps in 1i32..500,
        ) {
            let (low, high) = (from.min(to), from.max(to));
            let mut last = from;
            for step in 0..=steps {
                let value = interpolate(from, to, step, steps);
                proptest::prop_assert!(value >= low && value <= high);
                if to >= from {
                    proptest::prop_assert!(value >= last);
                } else {
                    proptest::prop_assert!(value <= last);
                }
                last = value;
            }
            proptest::prop_assert_eq!(last, to);
        }
    }
}
