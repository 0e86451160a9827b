//! End-to-end routing scenarios
//!
//! These tests run the real control loop against simulated domain adapters
//! backed by worker pools, covering route resolution, the handle lifecycle
//! and cancellation across threads.

use minstrel_app::{assemble, settle_main_connection, spawn};
use minstrel_core::control::{Command, CommandExecutor, CommandResult, ControlHandle, Notification};
use minstrel_core::domain::{
    Availability, ConnectionFormat, ConnectionState, DomainId, DomainState, Handle, Hop, MuteState,
    RampType, RoutingError, SinkId, SourceId, SourceState,
};
use minstrel_tests::{fast_config, single_domain_config, stalled_config, wait_for, SETTLE};
use std::collections::HashMap;
use std::time::Duration;

fn radio_to_link() -> Hop {
    Hop {
        source_id: SourceId::new(1),
        sink_id: SinkId::new(100),
        domain_id: DomainId::new(1),
        format: ConnectionFormat::Pcm,
    }
}

async fn dispatched(handle: &ControlHandle, command: Command) -> Handle {
    match handle.execute(command).await {
        CommandResult::Dispatched(Some(h)) => h,
        other => panic!("expected a handle, got {other:?}"),
    }
}

async fn connections(handle: &ControlHandle) -> Vec<minstrel_core::domain::Connection> {
    match handle.execute(Command::ListConnections).await {
        CommandResult::Connections(all) => all,
        other => panic!("unexpected result {other:?}"),
    }
}

async fn handles(handle: &ControlHandle) -> Vec<Handle> {
    match handle.execute(Command::ListHandles).await {
        CommandResult::Handles(all) => all,
        other => panic!("unexpected result {other:?}"),
    }
}

fn acknowledged(target: Handle) -> impl FnMut(&Notification) -> Option<Result<(), RoutingError>> {
    move |notification| match notification {
        Notification::Acknowledged { handle, result } if *handle == target => Some(result.clone()),
        _ => None,
    }
}

// ============================================================================
// ROUTE RESOLUTION
// ============================================================================

#[test]
fn test_two_domain_route_through_gateway() {
    let assembly = assemble(&fast_config()).unwrap();

    let routes = assembly
        .plane
        .resolve(SourceId::new(1), SinkId::new(1), true)
        .unwrap();

    assert_eq!(routes.len(), 1);
    assert_eq!(
        routes[0].hops,
        vec![
            radio_to_link(),
            Hop {
                source_id: SourceId::new(101),
                sink_id: SinkId::new(1),
                domain_id: DomainId::new(2),
                format: ConnectionFormat::Pcm,
            },
        ]
    );
}

#[test]
fn test_same_domain_route_negotiates_common_format() {
    let assembly = assemble(&single_domain_config()).unwrap();

    let routes = assembly
        .plane
        .resolve(SourceId::new(1), SinkId::new(1), true)
        .unwrap();

    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].hops.len(), 1);
    assert_eq!(routes[0].hops[0].format, ConnectionFormat::Compressed);
}

#[test]
fn test_unknown_endpoint_is_not_found() {
    let assembly = assemble(&fast_config()).unwrap();
    let err = assembly
        .plane
        .resolve(SourceId::new(77), SinkId::new(1), true)
        .unwrap_err();
    assert!(matches!(err, RoutingError::NotFound(_)));
}

// ============================================================================
// HANDLE LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_aborted_connect_rolls_back() {
    let runtime = spawn(assemble(&stalled_config(2)).unwrap());
    let client = runtime.handle.clone();
    let mut notifications = client.subscribe();

    let handle = dispatched(&client, Command::ConnectHop { hop: radio_to_link() }).await;
    let provisional = connections(&client).await;
    assert_eq!(provisional.len(), 1);
    assert!(!provisional[0].committed);

    assert_eq!(client.execute(Command::Abort { handle }).await, CommandResult::Ok);
    let result = wait_for(&mut notifications, acknowledged(handle)).await;
    assert_eq!(result, Err(RoutingError::Aborted));

    assert!(connections(&client).await.is_empty());
    assert!(handles(&client).await.is_empty());
    assert!(runtime.domains[0].connections().is_empty());

    client.execute(Command::Shutdown).await;
    runtime.task.await.unwrap();
}

#[tokio::test]
async fn test_aborting_every_hop_removes_main_connection() {
    let runtime = spawn(assemble(&stalled_config(2)).unwrap());
    let client = runtime.handle.clone();
    let mut notifications = client.subscribe();

    let main = match client
        .execute(Command::Connect {
            source: SourceId::new(1),
            sink: SinkId::new(1),
        })
        .await
    {
        CommandResult::MainConnection(main) => main,
        other => panic!("unexpected result {other:?}"),
    };

    let in_flight = handles(&client).await;
    assert_eq!(in_flight.len(), 2);
    for handle in in_flight {
        assert_eq!(client.execute(Command::Abort { handle }).await, CommandResult::Ok);
    }

    let mut states = Vec::new();
    wait_for(&mut notifications, |notification| match notification {
        Notification::MainConnectionState { id, state } if *id == main => {
            states.push(*state);
            None
        }
        Notification::MainConnectionRemoved { id } if *id == main => Some(()),
        _ => None,
    })
    .await;

    assert!(!states.contains(&ConnectionState::Connected));
    assert!(connections(&client).await.is_empty());

    client.execute(Command::Shutdown).await;
    runtime.task.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_connect_already_exists() {
    let runtime = spawn(assemble(&stalled_config(2)).unwrap());
    let client = runtime.handle.clone();
    let mut notifications = client.subscribe();

    let first = dispatched(&client, Command::ConnectHop { hop: radio_to_link() }).await;
    let second = client.execute(Command::ConnectHop { hop: radio_to_link() }).await;
    assert!(matches!(second, CommandResult::Error(RoutingError::AlreadyExists(_))));
    assert_eq!(handles(&client).await, vec![first]);

    // Once the first attempt is rolled back the hop can be requested again
    client.execute(Command::Abort { handle: first }).await;
    wait_for(&mut notifications, acknowledged(first)).await.unwrap_err();
    dispatched(&client, Command::ConnectHop { hop: radio_to_link() }).await;

    client.execute(Command::Shutdown).await;
    runtime.task.await.unwrap();
}

#[test]
fn test_same_volume_touches_no_adapter() {
    let mut assembly = assemble(&fast_config()).unwrap();

    let err = assembly
        .plane
        .set_sink_volume(SinkId::new(1), 0, RampType::Linear, 100)
        .unwrap_err();
    assert_eq!(err, RoutingError::NoChange);
    assert!(assembly.plane.list_handles().is_empty());
    assert!(assembly.domains.iter().all(|d| d.running_jobs() == 0));
    assert!(assembly.completions.try_recv().is_none());
}

#[tokio::test]
async fn test_saturated_pool_rejects_action() {
    let runtime = spawn(assemble(&stalled_config(1)).unwrap());
    let client = runtime.handle.clone();
    let mut notifications = client.subscribe();

    let busy = dispatched(
        &client,
        Command::SetSourceState {
            source: SourceId::new(1),
            state: SourceState::On,
        },
    )
    .await;

    let rejected = client.execute(Command::ConnectHop { hop: radio_to_link() }).await;
    assert!(matches!(rejected, CommandResult::Error(RoutingError::NotPossible(_))));
    assert!(connections(&client).await.is_empty());
    assert_eq!(handles(&client).await, vec![busy]);

    client.execute(Command::Abort { handle: busy }).await;
    assert_eq!(
        wait_for(&mut notifications, acknowledged(busy)).await,
        Err(RoutingError::Aborted)
    );

    let plane = {
        client.execute(Command::Shutdown).await;
        runtime.task.await.unwrap()
    };
    assert_eq!(
        plane.registry().source_state(SourceId::new(1)).unwrap(),
        SourceState::Off
    );
}

#[tokio::test]
async fn test_every_handle_acknowledged_exactly_once() {
    let runtime = spawn(assemble(&fast_config()).unwrap());
    let client = runtime.handle.clone();
    let mut notifications = client.subscribe();

    let mut outstanding = Vec::new();
    for step in 1..=12i16 {
        let result = client
            .execute(Command::SetSourceVolume {
                source: SourceId::new(1),
                volume: step * 10,
                ramp: RampType::Direct,
                time_ms: 0,
            })
            .await;
        match result {
            CommandResult::Dispatched(Some(handle)) => {
                if step % 2 == 0 {
                    // Best effort: the job may already be done
                    client.execute(Command::Abort { handle }).await;
                }
                outstanding.push(handle);
            }
            CommandResult::Error(RoutingError::NotPossible(_)) => {}
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert!(!outstanding.is_empty());

    let mut seen: HashMap<Handle, usize> = HashMap::new();
    let expected = outstanding.len();
    wait_for(&mut notifications, |notification| {
        if let Notification::Acknowledged { handle, .. } = notification {
            *seen.entry(*handle).or_default() += 1;
        }
        (seen.len() == expected).then_some(())
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(notification) = notifications.try_recv() {
        if let Notification::Acknowledged { handle, .. } = notification {
            *seen.entry(handle).or_default() += 1;
        }
    }

    for handle in &outstanding {
        assert_eq!(seen.get(handle), Some(&1), "{handle} acknowledged more than once");
    }
    assert!(handles(&client).await.is_empty());

    client.execute(Command::Shutdown).await;
    runtime.task.await.unwrap();
}

// ============================================================================
// MAIN CONNECTIONS
// ============================================================================

#[tokio::test]
async fn test_connect_and_disconnect_main_connection() {
    let runtime = spawn(assemble(&fast_config()).unwrap());
    let client = runtime.handle.clone();
    let mut notifications = client.subscribe();

    let main = match client
        .execute(Command::Connect {
            source: SourceId::new(1),
            sink: SinkId::new(1),
        })
        .await
    {
        CommandResult::MainConnection(main) => main,
        other => panic!("unexpected result {other:?}"),
    };

    let settled = settle_main_connection(&client, &mut notifications, main, SETTLE)
        .await
        .unwrap();
    assert_eq!(settled.state, ConnectionState::Connected);
    assert_eq!(settled.connections.len(), 2);
    assert_eq!(settled.delay, Some(8));
    assert!(connections(&client).await.iter().all(|c| c.committed));
    assert_eq!(runtime.domains[0].connections().len(), 1);
    assert_eq!(runtime.domains[1].connections().len(), 1);

    let again = client
        .execute(Command::Connect {
            source: SourceId::new(1),
            sink: SinkId::new(1),
        })
        .await;
    assert!(matches!(again, CommandResult::Error(RoutingError::AlreadyExists(_))));

    assert_eq!(client.execute(Command::Disconnect { main }).await, CommandResult::Ok);
    wait_for(&mut notifications, |notification| match notification {
        Notification::MainConnectionRemoved { id } if *id == main => Some(()),
        _ => None,
    })
    .await;

    assert!(connections(&client).await.is_empty());
    assert!(runtime.domains.iter().all(|d| d.connections().is_empty()));

    client.execute(Command::Shutdown).await;
    runtime.task.await.unwrap();
}

// ============================================================================
// VOLUME AND EVENTS
// ============================================================================

#[tokio::test]
async fn test_volume_ramp_ticks_and_commits() {
    let runtime = spawn(assemble(&fast_config()).unwrap());
    let client = runtime.handle.clone();
    let mut notifications = client.subscribe();
    let sink = SinkId::new(1);

    dispatched(&client, Command::SetVolume { sink, volume: 500 }).await;

    let mut ticks = Vec::new();
    wait_for(&mut notifications, |notification| match notification {
        Notification::SinkVolumeTick { volume, .. } => {
            ticks.push(*volume);
            None
        }
        Notification::SinkMainVolume { sink: s, volume } if *s == sink => Some(*volume),
        _ => None,
    })
    .await;

    assert!(!ticks.is_empty());
    assert!(ticks.windows(2).all(|w| w[0] < w[1]));
    assert!(ticks.iter().all(|v| (0..500).contains(v)));
    assert_eq!(runtime.domains[1].sink_volume(sink), Some(500));

    dispatched(
        &client,
        Command::SetMute {
            sink,
            state: MuteState::Muted,
        },
    )
    .await;
    wait_for(&mut notifications, |notification| match notification {
        Notification::SinkMute { state, .. } => Some(*state),
        _ => None,
    })
    .await;

    // Muted sinks only remember the requested volume
    assert_eq!(
        client.execute(Command::SetVolume { sink, volume: 200 }).await,
        CommandResult::Dispatched(None)
    );

    client.execute(Command::Shutdown).await;
    let plane = runtime.task.await.unwrap();
    let record = plane.registry().sink(sink).unwrap();
    assert_eq!(record.mute_state, MuteState::Muted);
    assert_eq!(record.main_volume, 200);
    assert_eq!(record.volume, minstrel_core::domain::audio::volume::MUTED);
}

#[tokio::test]
async fn test_adapter_events_reach_registry() {
    let runtime = spawn(assemble(&fast_config()).unwrap());
    let client = runtime.handle.clone();
    let mut notifications = client.subscribe();

    runtime.domains[1]
        .sink_availability(SinkId::new(1), Availability::Unavailable)
        .unwrap();
    wait_for(&mut notifications, |notification| match notification {
        Notification::SinkAvailability { availability, .. } => Some(*availability),
        _ => None,
    })
    .await;

    assert_eq!(
        client
            .execute(Command::SetDomainState {
                domain: DomainId::new(2),
                state: DomainState::Rundown,
            })
            .await,
        CommandResult::Ok
    );
    wait_for(&mut notifications, |notification| match notification {
        Notification::DomainState { domain, state } if *domain == DomainId::new(2) => Some(*state),
        _ => None,
    })
    .await;

    let topology = match client.execute(Command::Topology).await {
        CommandResult::Topology(topology) => topology,
        other => panic!("unexpected result {other:?}"),
    };
    let speakers = topology.sinks.iter().find(|s| s.id == SinkId::new(1)).unwrap();
    assert_eq!(speakers.availability, Availability::Unavailable);
    let amplifier = topology.domains.iter().find(|d| d.id == DomainId::new(2)).unwrap();
    assert_eq!(amplifier.state, DomainState::Rundown);

    client.execute(Command::Shutdown).await;
    runtime.task.await.unwrap();
}
