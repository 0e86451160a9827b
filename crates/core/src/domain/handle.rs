//! Handle tracker for in-flight asynchronous actions
//!
//! Every action dispatched to a domain adapter gets a [`Handle`]. The tracker
//! keeps the action's parameters until its terminal acknowledgment is
//! processed, at which point the entry is removed exactly once.

use crate::domain::audio::{
    ConnectionId, CrossfaderId, DomainId, HotSink, MainConnectionId, MainVolume, MuteState, SinkId,
    SoundProperty, SourceId, SourceState, Volume,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

/// Action type a handle was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Connect,
    Disconnect,
    SetSinkVolume,
    SetSourceVolume,
    SetSourceState,
    SetSinkSoundProperty,
    SetSourceSoundProperty,
    CrossFade,
}

/// Opaque token identifying one in-flight action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub id: u32,
    pub kind: HandleKind,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.kind, self.id)
    }
}

/// User-facing sink change applied once a sink volume action succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainSinkChange {
    Volume(MainVolume),
    Mute(MuteState),
}

/// Parameters recorded for an in-flight action
#[derive(Debug, Clone, PartialEq)]
pub enum HandleData {
    Connect {
        connection: ConnectionId,
        main: Option<MainConnectionId>,
    },
    Disconnect {
        connection: ConnectionId,
        main: Option<MainConnectionId>,
    },
    SinkVolume {
        sink: SinkId,
        target: Volume,
        previous: Volume,
        main: Option<MainSinkChange>,
    },
    SourceVolume {
        source: SourceId,
        target: Volume,
        previous: Volume,
    },
    SourceState {
        source: SourceId,
        target: SourceState,
    },
    SinkSoundProperty {
        sink: SinkId,
        property: SoundProperty,
        main: bool,
    },
    SourceSoundProperty {
        source: SourceId,
        property: SoundProperty,
        main: bool,
    },
    CrossFade {
        crossfader: CrossfaderId,
        hot_sink: HotSink,
    },
}

impl HandleData {
    pub fn kind(&self) -> HandleKind {
        match self {
            HandleData::Connect { .. } => HandleKind::Connect,
            HandleData::Disconnect { .. } => HandleKind::Disconnect,
            HandleData::SinkVolume { .. } => HandleKind::SetSinkVolume,
            HandleData::SourceVolume { .. } => HandleKind::SetSourceVolume,
            HandleData::SourceState { .. } => HandleKind::SetSourceState,
            HandleData::SinkSoundProperty { .. } => HandleKind::SetSinkSoundProperty,
            HandleData::SourceSoundProperty { .. } => HandleKind::SetSourceSoundProperty,
            HandleData::CrossFade { .. } => HandleKind::CrossFade,
        }
    }
}

/// Tracked entry: the action's parameters and the domain whose adapter runs it
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub handle: Handle,
    pub domain: DomainId,
    pub data: HandleData,
}

/// Issues handles and owns the parameters of every outstanding action
#[derive(Debug, Default)]
pub struct HandleTracker {
    next_id: u32,
    pending: BTreeMap<u32, PendingAction>,
}

impl HandleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle for a new action
    ///
    /// Ids wrap around and skip both zero and ids that are still in flight.
    pub fn create(&mut self, domain: DomainId, data: HandleData) -> Handle {
        let id = loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.pending.contains_key(&self.next_id) {
                break self.next_id;
            }
        };

        let handle = Handle {
            id,
            kind: data.kind(),
        };
        trace!(%handle, %domain, "Handle created");
        self.pending.insert(id, PendingAction { handle, domain, data });
        handle
    }

    pub fn get(&self, handle: Handle) -> Option<&PendingAction> {
        self.pending
            .get(&handle.id)
            .filter(|action| action.handle.kind == handle.kind)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Remove a handle, returning its parameters if it was still outstanding
    pub fn remove(&mut self, handle: Handle) -> Option<PendingAction> {
        if !self.contains(handle) {
            return None;
        }
        trace!(%handle, "Handle removed");
        self.pending.remove(&handle.id)
    }

    /// Outstanding handles in id order
    pub fn list(&self) -> Vec<Handle> {
        self.pending.values().map(|action| action.handle).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingAction> {
        self.pending.values()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
