//! Policy collaborator
//!
//! The controller decides which connection format wins on every hop and is
//! told about every acknowledgment after the control plane has committed or
//! rolled it back.

use crate::domain::audio::{
    ConnectionFormat, ConnectionState, MainConnectionId, Result, SinkId, SourceId, Volume,
};
use crate::domain::handle::Handle;
use crate::domain::router::Hop;
use tracing::debug;

/// Orders the candidate formats of one hop by preference
///
/// `route` holds the hops already fixed upstream of this one. Returning an
/// empty list rejects every candidate and makes the resolver backtrack to the
/// previous hop. Formats outside `candidates` are ignored.
pub trait FormatPrioritizer {
    fn choose_connection_format(
        &self,
        source: SourceId,
        sink: SinkId,
        route: &[Hop],
        candidates: &[ConnectionFormat],
    ) -> Vec<ConnectionFormat>;
}

/// Policy hooks mirrored after every commit or rollback
pub trait Controller: FormatPrioritizer + Send {
    fn on_connect_ack(&mut self, _handle: Handle, _result: &Result<()>) {}

    fn on_disconnect_ack(&mut self, _handle: Handle, _result: &Result<()>) {}

    fn on_volume_ack(&mut self, _handle: Handle, _volume: Volume, _result: &Result<()>) {}

    fn on_source_state_ack(&mut self, _handle: Handle, _result: &Result<()>) {}

    fn on_sound_property_ack(&mut self, _handle: Handle, _result: &Result<()>) {}

    fn on_cross_fade_ack(&mut self, _handle: Handle, _result: &Result<()>) {}

    fn on_main_connection_state(&mut self, _id: MainConnectionId, _state: ConnectionState) {}
}

/// Controller that ranks formats by a fixed preference list
///
/// Formats missing from the list keep their relative order after the listed ones.
#[derive(Debug, Clone, Default)]
pub struct PriorityController {
    priority: Vec<ConnectionFormat>,
}

impl PriorityController {
    pub fn new(priority: Vec<ConnectionFormat>) -> Self {
        Self { priority }
    }

    fn rank(&self, format: &ConnectionFormat) -> usize {
        self.priority
            .iter()
            .position(|f| f == format)
            .unwrap_or(self.priority.len())
    }
}

impl FormatPrioritizer for PriorityController {
    fn choose_connection_format(
        &self,
        _source: SourceId,
        _sink: SinkId,
        _route: &[Hop],
        candidates: &[ConnectionFormat],
    ) -> Vec<ConnectionFormat> {
        let mut ordered = candidates.to_vec();
        // sort_by_key is stable
        ordered.sort_by_key(|format| self.rank(format));
        ordered
    }
}

impl Controller for PriorityController {
    fn on_main_connection_state(&mut self, id: MainConnectionId, state: ConnectionState) {
        debug!(main_connection = %id, ?state, "Main connection state changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionFormat::*;

    #[test]
    fn test_priority_order() {
        let controller = PriorityController::new(vec![Compressed, Pcm]);
        let chosen = controller.choose_connection_format(
            SourceId::new(1),
            SinkId::new(1),
            &[],
            &[Analog, Pcm, Stereo, Compressed],
        );
        assert_eq!(chosen, vec![Compressed, Pcm, Analog, Stereo]);
    }

    #[test]
    fn test_empty_priority_keeps_order() {
        let controller = PriorityController::default();
        let chosen =
            controller.choose_connection_format(SourceId::new(1), SinkId::new(1), &[], &[Stereo, Mono]);
        assert_eq!(chosen, vec![Stereo, Mono]);
        assert!(controller
            .choose_connection_format(SourceId::new(1), SinkId::new(1), &[], &[])
            .is_empty());
    }
}
