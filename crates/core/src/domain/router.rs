//! Routing tree and route resolution
//!
//! Resolution runs in two phases. A breadth-first routing tree is grown from
//! the source's domain by following gateways, and every tree node that lands
//! in the sink's domain yields one gateway chain. Each chain is then turned
//! into hops and a format is negotiated for every hop, backtracking over an
//! explicit stack of per-hop choices when a later hop has no usable format.

use crate::domain::audio::{
    ConnectionFormat, DomainId, Gateway, GatewayId, RoutingError, SinkId, SourceId,
};
use crate::domain::controller::FormatPrioritizer;
use crate::domain::format::{intersection, restrict_by_gateway};
use crate::domain::registry::Registry;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, trace};

/// Resolution failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Unknown source {0}")]
    UnknownSource(SourceId),

    #[error("Unknown sink {0}")]
    UnknownSink(SinkId),

    #[error("No route from source {source_id} to sink {sink_id}")]
    NoRoute { source_id: SourceId, sink_id: SinkId },

    #[error("No format agreement from source {source_id} to sink {sink_id}")]
    NoFormatAgreement { source_id: SourceId, sink_id: SinkId },
}

impl From<ResolveError> for RoutingError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::UnknownSource(_) | ResolveError::UnknownSink(_) => {
                RoutingError::NotFound(err.to_string())
            }
            ResolveError::NoRoute { .. } | ResolveError::NoFormatAgreement { .. } => {
                RoutingError::NotPossible(err.to_string())
            }
        }
    }
}

/// One source to sink leg confined to a single domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub source_id: SourceId,
    pub sink_id: SinkId,
    pub domain_id: DomainId,
    pub format: ConnectionFormat,
}

/// Ordered hops from a source to a sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub source_id: SourceId,
    pub sink_id: SinkId,
    pub hops: Vec<Hop>,
}

impl Route {
    /// Gateways crossed, in order
    pub fn gateway_count(&self) -> usize {
        self.hops.len().saturating_sub(1)
    }
}

#[derive(Debug)]
struct TreeNode {
    domain: DomainId,
    parent: Option<usize>,
    gateway: Option<GatewayId>,
}

/// Breadth-first tree of domains reachable from a root domain
///
/// A domain can appear on several branches but never twice on the path from
/// the root to any node, so every node stands for one simple gateway chain.
#[derive(Debug)]
pub struct RoutingTree {
    nodes: Vec<TreeNode>,
}

impl RoutingTree {
    /// Grow the tree from `root`, not expanding past `target`
    pub fn build(root: DomainId, target: DomainId, gateways: &[&Gateway]) -> Self {
        let mut nodes = vec![TreeNode {
            domain: root,
            parent: None,
            gateway: None,
        }];
        let mut queue = VecDeque::from([0usize]);

        while let Some(index) = queue.pop_front() {
            let domain = nodes[index].domain;
            if domain == target {
                continue;
            }

            for gateway in gateways.iter().filter(|g| g.domain_sink_id == domain) {
                let next = gateway.domain_source_id;
                if Self::on_path(&nodes, index, next) {
                    continue;
                }
                nodes.push(TreeNode {
                    domain: next,
                    parent: Some(index),
                    gateway: Some(gateway.id),
                });
                queue.push_back(nodes.len() - 1);
            }
        }

        trace!(%root, nodes = nodes.len(), "Routing tree built");
        Self { nodes }
    }

    fn on_path(nodes: &[TreeNode], mut index: usize, domain: DomainId) -> bool {
        loop {
            if nodes[index].domain == domain {
                return true;
            }
            match nodes[index].parent {
                Some(parent) => index = parent,
                None => return false,
            }
        }
    }

    /// Gateway chains from the root to every node in `target`, shortest first
    pub fn chains_to(&self, target: DomainId) -> Vec<Vec<GatewayId>> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.domain == target)
            .map(|(index, _)| self.chain(index))
            .collect()
    }

    fn chain(&self, mut index: usize) -> Vec<GatewayId> {
        let mut gateways = Vec::new();
        while let Some(gateway) = self.nodes[index].gateway {
            gateways.push(gateway);
            match self.nodes[index].parent {
                Some(parent) => index = parent,
                None => break,
            }
        }
        gateways.reverse();
        gateways
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Hop endpoints before a format has been chosen
struct HopPlan<'a> {
    source_id: SourceId,
    sink_id: SinkId,
    domain_id: DomainId,
    candidates: Vec<ConnectionFormat>,
    /// Gateway feeding this hop's source, if any
    upstream: Option<&'a Gateway>,
}

/// One level of the negotiation stack
struct Choice {
    ranked: Vec<ConnectionFormat>,
    index: usize,
}

impl Choice {
    fn format(&self) -> ConnectionFormat {
        self.ranked[self.index]
    }
}

/// Find every route from `source` to `sink` that admits a consistent format
///
/// With `only_free` set, gateways whose sink or source already carries a
/// connection are ignored. Routes are returned shortest first.
pub fn resolve<P>(
    registry: &dyn Registry,
    prioritizer: &P,
    only_free: bool,
    source: SourceId,
    sink: SinkId,
) -> Result<Vec<Route>, ResolveError>
where
    P: FormatPrioritizer + ?Sized,
{
    let source_domain = registry
        .source(source)
        .ok_or(ResolveError::UnknownSource(source))?
        .domain_id;
    let sink_domain = registry
        .sink(sink)
        .ok_or(ResolveError::UnknownSink(sink))?
        .domain_id;

    let gateways: Vec<&Gateway> = registry
        .gateways()
        .into_iter()
        .filter(|g| !only_free || !registry.gateway_in_use(g))
        .collect();

    let tree = RoutingTree::build(source_domain, sink_domain, &gateways);
    let chains = tree.chains_to(sink_domain);
    if chains.is_empty() {
        debug!(%source, %sink, "No gateway chain reaches the sink domain");
        return Err(ResolveError::NoRoute {
            source_id: source,
            sink_id: sink,
        });
    }

    let mut routes = Vec::new();
    for chain in &chains {
        let Some(plan) = plan_hops(registry, source, sink, source_domain, chain) else {
            continue;
        };
        match negotiate(prioritizer, &plan) {
            Some(hops) => routes.push(Route {
                source_id: source,
                sink_id: sink,
                hops,
            }),
            None => trace!(%source, %sink, gateways = chain.len(), "Chain has no format agreement"),
        }
    }

    if routes.is_empty() {
        return Err(ResolveError::NoFormatAgreement {
            source_id: source,
            sink_id: sink,
        });
    }

    debug!(%source, %sink, routes = routes.len(), "Routes resolved");
    Ok(routes)
}

/// Lay out hop endpoints for a gateway chain
///
/// Returns `None` if a gateway endpoint is missing from the registry.
fn plan_hops<'a>(
    registry: &'a dyn Registry,
    source: SourceId,
    sink: SinkId,
    source_domain: DomainId,
    chain: &[GatewayId],
) -> Option<Vec<HopPlan<'a>>> {
    let mut plan = Vec::with_capacity(chain.len() + 1);
    let mut hop_source = source;
    let mut hop_domain = source_domain;
    let mut upstream: Option<&Gateway> = None;

    for gateway_id in chain {
        let gateway = registry.gateway(*gateway_id)?;
        plan.push(HopPlan {
            source_id: hop_source,
            sink_id: gateway.sink_id,
            domain_id: hop_domain,
            candidates: intersection(
                &registry.source(hop_source)?.connection_formats,
                &registry.sink(gateway.sink_id)?.connection_formats,
            ),
            upstream,
        });
        hop_source = gateway.source_id;
        hop_domain = gateway.domain_source_id;
        upstream = Some(gateway);
    }

    plan.push(HopPlan {
        source_id: hop_source,
        sink_id: sink,
        domain_id: hop_domain,
        candidates: intersection(
            &registry.source(hop_source)?.connection_formats,
            &registry.sink(sink)?.connection_formats,
        ),
        upstream,
    });

    Some(plan)
}

/// Choose one format per hop, backtracking over an explicit choice stack
///
/// Terminates with `None` once the first hop runs out of choices. The number
/// of steps is bounded by the product of the per-hop candidate counts.
fn negotiate<P>(prioritizer: &P, plan: &[HopPlan<'_>]) -> Option<Vec<Hop>>
where
    P: FormatPrioritizer + ?Sized,
{
    let mut stack: Vec<Choice> = Vec::with_capacity(plan.len());

    while stack.len() < plan.len() {
        let hop = &plan[stack.len()];
        let candidates = match (hop.upstream, stack.last()) {
            (Some(gateway), Some(previous)) => {
                restrict_by_gateway(gateway, previous.format(), &hop.candidates)
            }
            _ => hop.candidates.clone(),
        };

        let ranked = if candidates.is_empty() {
            candidates
        } else {
            let partial = chosen_hops(plan, &stack);
            let mut ranked =
                prioritizer.choose_connection_format(hop.source_id, hop.sink_id, &partial, &candidates);
            // Only candidates are legal, each at most once
            let mut seen = Vec::with_capacity(ranked.len());
            ranked.retain(|format| {
                let keep = candidates.contains(format) && !seen.contains(format);
                if keep {
                    seen.push(*format);
                }
                keep
            });
            ranked
        };

        if !ranked.is_empty() {
            stack.push(Choice { ranked, index: 0 });
            continue;
        }

        // Backtrack to the nearest hop that still has an untried format
        loop {
            let previous = stack.last_mut()?;
            previous.index += 1;
            if previous.index < previous.ranked.len() {
                break;
            }
            stack.pop();
        }
    }

    Some(chosen_hops(plan, &stack))
}

/// Hops fixed so far by the choice stack
fn chosen_hops(plan: &[HopPlan<'_>], stack: &[Choice]) -> Vec<Hop> {
    plan.iter()
        .zip(stack)
        .map(|(hop, choice)| Hop {
            source_id: hop.source_id,
            sink_id: hop.sink_id,
            domain_id: hop.domain_id,
            format: choice.format(),
        })
        .collect()
}
