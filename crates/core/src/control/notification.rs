//! Observer notifications
//!
//! Published on a broadcast channel after the control plane has applied a
//! change to the registry.

use crate::domain::audio::{
    Availability, ConnectionState, CrossfaderId, DomainId, DomainState, HotSink, InterruptState,
    MainConnectionId, MainVolume, MuteState, Result, SinkId, SoundProperty, SourceId, SourceState,
    Volume,
};
use crate::domain::handle::Handle;

/// Capacity of the observer channel; slow observers see `Lagged`
pub const NOTIFICATION_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    MainConnectionState {
        id: MainConnectionId,
        state: ConnectionState,
    },
    MainConnectionRemoved {
        id: MainConnectionId,
    },
    MainConnectionDelay {
        id: MainConnectionId,
        delay: Option<i16>,
    },
    SinkVolume {
        sink: SinkId,
        volume: Volume,
    },
    SinkVolumeTick {
        handle: Handle,
        sink: SinkId,
        volume: Volume,
    },
    SinkMainVolume {
        sink: SinkId,
        volume: MainVolume,
    },
    SinkMute {
        sink: SinkId,
        state: MuteState,
    },
    SourceVolume {
        source: SourceId,
        volume: Volume,
    },
    SourceVolumeTick {
        handle: Handle,
        source: SourceId,
        volume: Volume,
    },
    SourceState {
        source: SourceId,
        state: SourceState,
    },
    SinkSoundProperty {
        sink: SinkId,
        property: SoundProperty,
    },
    SinkMainSoundProperty {
        sink: SinkId,
        property: SoundProperty,
    },
    SourceSoundProperty {
        source: SourceId,
        property: SoundProperty,
    },
    SourceMainSoundProperty {
        source: SourceId,
        property: SoundProperty,
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
    HotSink {
        crossfader: CrossfaderId,
        hot_sink: HotSink,
    },
    /// Terminal acknowledgment processed, the handle is gone
    Acknowledged {
        handle: Handle,
        result: Result<()>,
    },
}
