//! Connection format negotiation primitives
//!
//! Pure functions used by the resolver: candidate sets per hop and the
//! restriction a gateway's conversion capability imposes on the next hop.

use crate::domain::audio::{ConnectionFormat, Gateway};
use serde::{Deserialize, Serialize};

/// Boolean conversion capability of a gateway
///
/// `rows[i][j]` is true iff a signal arriving in the gateway's sink format
/// `i` can be emitted in source format `j` on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversionMatrix {
    rows: Vec<Vec<bool>>,
}

impl ConversionMatrix {
    pub fn new(rows: Vec<Vec<bool>>) -> Self {
        Self { rows }
    }

    /// Matrix where every sink format converts to every source format
    pub fn full(sink_formats: usize, source_formats: usize) -> Self {
        Self {
            rows: vec![vec![true; source_formats]; sink_formats],
        }
    }

    /// Matrix that only passes format `i` through as format `i`
    pub fn identity(size: usize) -> Self {
        let rows = (0..size)
            .map(|i| (0..size).map(|j| i == j).collect())
            .collect();
        Self { rows }
    }

    pub fn allows(&self, sink_index: usize, source_index: usize) -> bool {
        self.rows
            .get(sink_index)
            .and_then(|row| row.get(source_index))
            .copied()
            .unwrap_or(false)
    }

    /// Whether the matrix is exactly `sink_formats` x `source_formats`
    pub fn has_shape(&self, sink_formats: usize, source_formats: usize) -> bool {
        self.rows.len() == sink_formats && self.rows.iter().all(|row| row.len() == source_formats)
    }

    pub fn rows(&self) -> &[Vec<bool>] {
        &self.rows
    }
}

/// Formats supported by both ends of a hop, in the source's declared order
pub fn intersection(
    source_formats: &[ConnectionFormat],
    sink_formats: &[ConnectionFormat],
) -> Vec<ConnectionFormat> {
    let mut common = Vec::new();
    for format in source_formats {
        if sink_formats.contains(format) && !common.contains(format) {
            common.push(*format);
        }
    }
    common
}

/// Source-side formats a gateway can emit when fed `incoming` on its sink side
pub fn gateway_output_formats(gateway: &Gateway, incoming: ConnectionFormat) -> Vec<ConnectionFormat> {
    let Some(row) = gateway.sink_formats.iter().position(|f| *f == incoming) else {
        return Vec::new();
    };

    gateway
        .source_formats
        .iter()
        .enumerate()
        .filter(|(column, _)| gateway.conversion.allows(row, *column))
        .map(|(_, format)| *format)
        .collect()
}

/// Drop candidates the gateway cannot produce from `incoming`, preserving order
pub fn restrict_by_gateway(
    gateway: &Gateway,
    incoming: ConnectionFormat,
    candidates: &[ConnectionFormat],
) -> Vec<ConnectionFormat> {
    let reachable = gateway_output_formats(gateway, incoming);
    candidates
        .iter()
        .copied()
        .filter(|format| reachable.contains(format))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::{DomainId, GatewayId, SinkId, SourceId};
    use ConnectionFormat::*;

    fn gateway(sink_formats: Vec<ConnectionFormat>, source_formats: Vec<ConnectionFormat>, rows: Vec<Vec<bool>>) -> Gateway {
        Gateway {
            id: GatewayId::new(1),
            name: "gw".to_string(),
            sink_id: SinkId::new(10),
            source_id: SourceId::new(10),
            domain_sink_id: DomainId::new(1),
            domain_source_id: DomainId::new(2),
            control_domain_id: DomainId::new(1),
            sink_formats,
            source_formats,
            conversion: ConversionMatrix::new(rows),
        }
    }

    #[test]
    fn test_intersection_keeps_source_order() {
        let common = intersection(&[Compressed, Pcm, Stereo], &[Stereo, Pcm]);
        assert_eq!(common, vec![Pcm, Stereo]);
    }

    #[test]
    fn test_intersection_empty() {
        assert!(intersection(&[Pcm], &[Analog]).is_empty());
        assert!(intersection(&[], &[Analog]).is_empty());
    }

    #[test]
    fn test_matrix_shapes() {
        let full = ConversionMatrix::full(2, 3);
        assert!(full.has_shape(2, 3));
        assert!(!full.has_shape(3, 2));
        assert!(full.allows(1, 2));
        assert!(!full.allows(2, 0));

        let identity = ConversionMatrix::identity(3);
        assert!(identity.allows(1, 1));
        assert!(!identity.allows(1, 2));
    }

    #[test]
    fn test_gateway_restriction() {
        let gw = gateway(
            vec![Pcm, Stereo],
            vec![Pcm, Analog],
            vec![vec![true, false], vec![false, true]],
        );

        assert_eq!(gateway_output_formats(&gw, Pcm), vec![Pcm]);
        assert_eq!(gateway_output_formats(&gw, Stereo), vec![Analog]);
        assert!(gateway_output_formats(&gw, Compressed).is_empty());

        assert_eq!(restrict_by_gateway(&gw, Stereo, &[Pcm, Analog]), vec![Analog]);
        assert!(restrict_by_gateway(&gw, Pcm, &[Analog]).is_empty());
    }
}
