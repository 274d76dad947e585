//! Bridges small discontinuities in a matched edge sequence.
//!
//! The walk works on undirected edges: consecutive edges that share a node
//! are connected, anything else is a gap. A gap is bridged with the shortest
//! path from the last known position to the nearer end of the next edge, but
//! only when that path is short and simple enough to be believable. Before
//! any position is known, the bridge may start at either end of the current
//! edge. After a rejected or impossible bridge the position is forgotten, so
//! the next gap is not bridged from a guess.

use std::collections::HashSet;

use log::{debug, trace};
use ordered_float::OrderedFloat;

use crate::config::GapFillConfig;
use crate::street_graph::{EdgeId, GraphAdapter, NodeId, UndirectedEdge};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FillStats {
    pub gaps: usize,
    pub filled: usize,
    /// No path between the gap ends
    pub unreachable: usize,
    /// A path exists but exceeds the thresholds
    pub rejected: usize,
    /// Position forgotten after an earlier failed bridge
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fill {
    /// Unordered, see [`crate::route::Route::fillers`]
    pub edges: Vec<EdgeId>,
    pub stats: FillStats,
}

struct Bridge {
    from: NodeId,
    nodes: Vec<NodeId>,
    length: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// No connection or bridge seen yet
    Start,
    Known(NodeId),
    /// Forgotten after an unreachable or implausible bridge
    Lost,
}

/// Normalize to undirected edges and keep only transitions.
pub fn dedup_undirected(edges: &[EdgeId]) -> Vec<UndirectedEdge> {
    let mut walk: Vec<UndirectedEdge> = Vec::with_capacity(edges.len());
    for edge in edges {
        let undirected = edge.undirected();
        if walk.last() != Some(&undirected) {
            walk.push(undirected);
        }
    }
    walk
}

pub fn fill<G: GraphAdapter + ?Sized>(edges: &[EdgeId], graph: &G, config: &GapFillConfig) -> Fill {
    let walk = dedup_undirected(edges);
    let mut stats = FillStats::default();
    let mut position = Position::Start;
    let mut bridged: Vec<UndirectedEdge> = Vec::new();

    for pair in walk.windows(2) {
        let (current, next) = (pair[0], pair[1]);

        if let Some(shared) = current.shared_endpoint(&next) {
            position = Position::Known(shared);
            continue;
        }

        stats.gaps += 1;
        let starts: Vec<NodeId> = match position {
            Position::Known(node) => vec![node],
            Position::Start => {
                let (a, b) = current.endpoints();
                vec![a, b]
            }
            Position::Lost => {
                trace!("Gap {:?} -> {:?} with unknown position", current, next);
                stats.skipped += 1;
                continue;
            }
        };

        let Some(bridge) = starts
            .into_iter()
            .filter_map(|from| shortest_bridge(graph, from, &next))
            .min_by_key(|bridge| OrderedFloat(bridge.length))
        else {
            debug!("No path from {:?} to {:?}, leaving gap", current, next);
            stats.unreachable += 1;
            position = Position::Lost;
            continue;
        };
        let from = bridge.from;

        if bridge.length < config.length_threshold_m
            && bridge.nodes.len() < config.node_count_threshold
        {
            trace!(
                "Bridging gap from node {} with {} nodes over {:.1}m",
                from,
                bridge.nodes.len(),
                bridge.length
            );
            bridged.extend(
                bridge
                    .nodes
                    .windows(2)
                    .map(|step| UndirectedEdge::new(step[0], step[1])),
            );
            position = bridge
                .nodes
                .last()
                .copied()
                .map_or(Position::Lost, Position::Known);
            stats.filled += 1;
        } else {
            debug!(
                "Bridge from node {} to {:?} is implausible ({:.1}m, {} nodes), leaving gap",
                from,
                next,
                bridge.length,
                bridge.nodes.len()
            );
            stats.rejected += 1;
            position = Position::Lost;
        }
    }

    let fill = Fill {
        edges: directed_forms(graph, &bridged),
        stats,
    };
    debug!("Gap filling: {:?}", fill.stats);
    fill
}

/// Shorter of the paths from `from` to either end of `target`.
fn shortest_bridge<G: GraphAdapter + ?Sized>(
    graph: &G,
    from: NodeId,
    target: &UndirectedEdge,
) -> Option<Bridge> {
    let (a, b) = target.endpoints();
    [a, b]
        .into_iter()
        .filter_map(|to| graph.shortest_path(from, to))
        .map(|nodes| Bridge {
            from,
            length: path_length(graph, &nodes),
            nodes,
        })
        .min_by_key(|bridge| OrderedFloat(bridge.length))
}

fn path_length<G: GraphAdapter + ?Sized>(graph: &G, nodes: &[NodeId]) -> f64 {
    nodes
        .windows(2)
        .map(|step| graph.edge_length(step[0], step[1]).unwrap_or(f64::INFINITY))
        .sum()
}

// For each bridged pair, the shortest existing edge in each direction.
fn directed_forms<G: GraphAdapter + ?Sized>(graph: &G, bridged: &[UndirectedEdge]) -> Vec<EdgeId> {
    let mut seen = HashSet::new();
    let mut edges = Vec::new();

    for pair in bridged {
        if !seen.insert(*pair) {
            continue;
        }
        let (a, b) = pair.endpoints();
        for (u, v) in [(a, b), (b, a)] {
            let shortest = graph
                .edges_between(u, v)
                .into_iter()
                .filter_map(|id| graph.edge(&id).map(|data| (OrderedFloat(data.length), id)))
                .min();
            if let Some((_, id)) = shortest {
                edges.push(id);
            }
        }
    }

    edges
}
