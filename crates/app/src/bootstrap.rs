//! Wiring of configuration, adapters and the control loop

use minstrel_core::control::{
    completion_channel, Command, CommandExecutor, CommandResult, CompletionReceiver, ControlHandle,
    ControlLoop, ControlPlane, ControlSettings, Notification,
};
use minstrel_core::domain::{
    ConnectionState, InMemoryRegistry, MainConnection, MainConnectionId, MinstrelConfig,
    PriorityController, RoutingError,
};
use minstrel_infra::adapter::{DomainEvents, SimulatedDomainAdapter};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SettleError {
    #[error("Main connection {0} did not settle in time")]
    Timeout(MainConnectionId),

    #[error("Main connection {0} was removed")]
    Removed(MainConnectionId),

    #[error("Control loop stopped")]
    Closed,

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

/// Control plane with its adapters registered, not yet running
pub struct Assembly {
    pub plane: ControlPlane,
    pub completions: CompletionReceiver,
    /// One entry per configured domain, in configuration order
    pub domains: Vec<DomainEvents>,
}

/// Build the registry, the priority controller and one simulated adapter per domain
pub fn assemble(config: &MinstrelConfig) -> anyhow::Result<Assembly> {
    config.validate()?;

    let (sender, completions) = completion_channel();
    let mut plane = ControlPlane::new(
        Box::new(InMemoryRegistry::new()),
        Box::new(PriorityController::new(config.app.format_priority.clone())),
        sender,
        ControlSettings::from(&config.app),
    );

    let mut domains = Vec::with_capacity(config.topology.domains.len());
    for domain in &config.topology.domains {
        let adapter = SimulatedDomainAdapter::from_app_config(domain.clone(), &config.app)?;
        domains.push(adapter.events());
        plane.add_adapter(Box::new(adapter))?;
    }

    info!(domains = domains.len(), "Control plane assembled");
    Ok(Assembly {
        plane,
        completions,
        domains,
    })
}

/// Running control loop
pub struct Runtime {
    pub handle: ControlHandle,
    pub task: JoinHandle<ControlPlane>,
    pub domains: Vec<DomainEvents>,
}

/// Move the plane onto its own task
pub fn spawn(assembly: Assembly) -> Runtime {
    let (control, handle) = ControlLoop::new(assembly.plane, assembly.completions);
    Runtime {
        handle,
        task: tokio::spawn(control.run()),
        domains: assembly.domains,
    }
}

/// Wait until a main connection leaves `Connecting`
///
/// Subscribe before sending the connect command so no transition is missed.
pub async fn settle_main_connection(
    handle: &ControlHandle,
    notifications: &mut broadcast::Receiver<Notification>,
    main: MainConnectionId,
    timeout: Duration,
) -> Result<MainConnection, SettleError> {
    let wait = async {
        loop {
            match notifications.recv().await {
                Ok(Notification::MainConnectionState { id, state }) if id == main => {
                    debug!(main_connection = %id, ?state, "Main connection transition");
                    if state != ConnectionState::Connecting {
                        return Ok(());
                    }
                }
                Ok(Notification::MainConnectionRemoved { id }) if id == main => {
                    return Err(SettleError::Removed(main));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(SettleError::Closed),
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(settled) => settled?,
        Err(_) => return Err(SettleError::Timeout(main)),
    }

    match handle.execute(Command::ListMainConnections).await.into_result()? {
        CommandResult::MainConnections(mains) => mains
            .into_iter()
            .find(|m| m.id == main)
            .ok_or(SettleError::Removed(main)),
        _ => Err(SettleError::Closed),
    }
}
