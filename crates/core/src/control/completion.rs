//! Cross-thread completion queue
//!
//! Workers never touch registry state. Every acknowledgment, ramp tick and
//! adapter event is pushed onto this queue and replayed by the control loop
//! on its own task. Messages from one producer keep their order.

use crate::domain::audio::{
    Availability, ConnectionId, DomainId, DomainState, HotSink, InterruptState, Result, SinkId,
    SourceId, Volume,
};
use crate::domain::handle::Handle;
use tokio::sync::mpsc;
use tracing::warn;

/// Message delivered from an adapter to the control loop
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    ConnectAck {
        handle: Handle,
        result: Result<()>,
    },
    DisconnectAck {
        handle: Handle,
        result: Result<()>,
    },
    /// Terminal sink volume acknowledgment with the volume the sink settled at
    SinkVolumeAck {
        handle: Handle,
        volume: Volume,
        result: Result<()>,
    },
    SourceVolumeAck {
        handle: Handle,
        volume: Volume,
        result: Result<()>,
    },
    SourceStateAck {
        handle: Handle,
        result: Result<()>,
    },
    SinkSoundPropertyAck {
        handle: Handle,
        result: Result<()>,
    },
    SourceSoundPropertyAck {
        handle: Handle,
        result: Result<()>,
    },
    CrossFadeAck {
        handle: Handle,
        hot_sink: HotSink,
        result: Result<()>,
    },
    /// Intermediate ramp value, never closes the handle
    SinkVolumeTick {
        handle: Handle,
        sink: SinkId,
        volume: Volume,
    },
    SourceVolumeTick {
        handle: Handle,
        source: SourceId,
        volume: Volume,
    },
    SinkAvailability {
        sink: SinkId,
        availability: Availability,
    },
    SourceAvailability {
        source: SourceId,
        availability: Availability,
    },
    InterruptState {
        source: SourceId,
        state: InterruptState,
    },
    DomainState {
        domain: DomainId,
        state: DomainState,
    },
    ConnectionDelay {
        connection: ConnectionId,
        delay: i16,
    },
}

impl Completion {
    /// Handle this message refers to, if any
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Completion::ConnectAck { handle, .. }
            | Completion::DisconnectAck { handle, .. }
            | Completion::SinkVolumeAck { handle, .. }
            | Completion::SourceVolumeAck { handle, .. }
            | Completion::SourceStateAck { handle, .. }
            | Completion::SinkSoundPropertyAck { handle, .. }
            | Completion::SourceSoundPropertyAck { handle, .. }
            | Completion::CrossFadeAck { handle, .. }
            | Completion::SinkVolumeTick { handle, .. }
            | Completion::SourceVolumeTick { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    /// Whether this message closes its handle
    pub fn is_terminal(&self) -> bool {
        self.handle().is_some()
            && !matches!(
                self,
                Completion::SinkVolumeTick { .. } | Completion::SourceVolumeTick { .. }
            )
    }
}

/// Producer side, cloned into every adapter and worker job
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<Completion>,
}

impl CompletionSender {
    /// Enqueue a completion; returns `false` once the control loop is gone
    ///
    /// Never blocks, so it is safe to call from worker threads.
    pub fn send(&self, completion: Completion) -> bool {
        match self.tx.send(completion) {
            Ok(()) => true,
            Err(err) => {
                warn!(completion = ?err.0, "Control loop gone, completion dropped");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the control loop
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl CompletionReceiver {
    /// Wait for the next completion
    pub async fn recv(&mut self) -> Option<Completion> {
        self.rx.recv().await
    }

    /// Take the next completion if one is already queued
    pub fn try_recv(&mut self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }
}

/// Create a connected sender/receiver pair
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CompletionSender { tx }, CompletionReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::RoutingError;
    use crate::domain::handle::HandleKind;

    fn handle(id: u32) -> Handle {
        Handle {
            id,
            kind: HandleKind::SetSinkVolume,
        }
    }

    #[tokio::test]
    async fn test_fifo_from_worker_thread() {
        let (tx, mut rx) = completion_channel();

        let worker = std::thread::spawn(move || {
            for volume in [10, 20, 30] {
                tx.send(Completion::SinkVolumeTick {
                    handle: handle(1),
                    sink: SinkId::new(1),
                    volume,
                });
            }
            tx.send(Completion::SinkVolumeAck {
                handle: handle(1),
                volume: 40,
                result: Ok(()),
            });
        });
        worker.join().unwrap();

        let mut seen = Vec::new();
        while let Some(completion) = rx.recv().await {
            let terminal = completion.is_terminal();
            seen.push(completion);
            if terminal {
                break;
            }
        }

        let volumes: Vec<_> = seen
            .iter()
            .map(|c| match c {
                Completion::SinkVolumeTick { volume, .. } | Completion::SinkVolumeAck { volume, .. } => *volume,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(volumes, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = completion_channel();
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.send(Completion::ConnectAck {
            handle: handle(2),
            result: Err(RoutingError::Aborted),
        }));
    }

    #[test]
    fn test_try_recv_and_classification() {
        let (tx, mut rx) = completion_channel();
        assert!(rx.try_recv().is_none());

        tx.send(Completion::DomainState {
            domain: DomainId::new(1),
            state: DomainState::Running,
        });
        let event = rx.try_recv().unwrap();
        assert!(event.handle().is_none());
        assert!(!event.is_terminal());
    }
}
