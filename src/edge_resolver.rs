//! Turns the way ids reported by the remote matcher into graph edges.

use log::{debug, trace};
use ordered_float::OrderedFloat;

use crate::remote_matcher::MatchedPoint;
use crate::street_graph::{EdgeId, GraphAdapter, distance_to_geometry};
use crate::track::LatLon;

/// Distances closer than this count as equal. An edge and its reversed
/// twin only differ by floating point noise.
pub const TIE_TOLERANCE_M: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// In input order, consecutive duplicates included
    pub edges: Vec<EdgeId>,
    pub resolved_points: usize,
    pub total_points: usize,
}

impl Resolution {
    /// Percentage of matched points whose way exists in the graph
    pub fn match_rate(&self) -> f64 {
        if self.total_points == 0 {
            return 0.0;
        }
        self.resolved_points as f64 / self.total_points as f64 * 100.0
    }
}

/// Resolve each matched point to one edge, or two when an edge and its
/// reverse are equally close. Points whose way is not in the graph are
/// dropped.
pub fn resolve<G: GraphAdapter + ?Sized>(points: &[MatchedPoint], graph: &G) -> Resolution {
    let mut edges = Vec::with_capacity(points.len());
    let mut resolved_points = 0;

    for point in points {
        let candidates = graph.edges_with_way(point.way_id);
        let chosen = match candidates.as_slice() {
            [] => {
                trace!("Way {} is not part of the graph", point.way_id);
                continue;
            }
            [single] => vec![*single],
            _ => closest_candidates(point.position, &candidates, graph),
        };

        if chosen.is_empty() {
            continue;
        }
        resolved_points += 1;
        edges.extend(chosen);
    }

    let resolution = Resolution {
        edges,
        resolved_points,
        total_points: points.len(),
    };
    debug!(
        "Resolved {:.1}% of matched points to {} edges",
        resolution.match_rate(),
        resolution.edges.len()
    );
    resolution
}

fn closest_candidates<G: GraphAdapter + ?Sized>(
    position: LatLon,
    candidates: &[EdgeId],
    graph: &G,
) -> Vec<EdgeId> {
    let mut ranked: Vec<(OrderedFloat<f64>, EdgeId)> = candidates
        .iter()
        .filter_map(|edge| {
            let geometry = graph.edge_geometry(edge)?;
            distance_to_geometry(position, geometry).map(|d| (OrderedFloat(d), *edge))
        })
        .collect();
    ranked.sort();

    match ranked.as_slice() {
        [] => Vec::new(),
        [(best, first), (runner_up, second), ..] if runner_up.0 - best.0 <= TIE_TOLERANCE_M => {
            let mut tied = vec![*first, *second];
            tied.sort();
            tied
        }
        [(_, first), ..] => vec![*first],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::street_graph::tests::node_row;
    use crate::street_graph::{StreetGraph, StreetGraphBuilder, WayReference};

    // 1 - 2 - 3 along one parallel. Way 100 is two-way over both edges,
    // way 200 is a one-way pair 1->2 and 2->3.
    fn graph() -> StreetGraph {
        let mut builder = StreetGraphBuilder::new();
        node_row(&mut builder, &[1, 2, 3]);
        builder.add_two_way(1, 2, 74.0, Some(WayReference::Single(100)));
        builder.add_two_way(2, 3, 74.0, Some(WayReference::Single(100)));
        builder.add_edge(1, 2, 74.0, Some(WayReference::Single(200)));
        builder.add_edge(2, 3, 74.0, Some(WayReference::Single(200)));
        builder.add_edge(3, 1, 148.0, Some(WayReference::Single(300)));
        builder.build()
    }

    fn point(lat: f64, lon: f64, way_id: i64) -> MatchedPoint {
        MatchedPoint {
            position: LatLon::new(lat, lon),
            edge_index: 0,
            way_id,
        }
    }

    #[test]
    fn single_candidate_is_emitted() {
        let resolution = resolve(&[point(48.15, 11.5905, 300)], &graph());
        assert_eq!(resolution.edges, vec![EdgeId::new(3, 1, 0)]);
        assert_eq!(resolution.resolved_points, 1);
    }

    #[test]
    fn reversed_twins_at_equal_distance_are_both_emitted() {
        let resolution = resolve(&[point(48.15003, 11.5903, 100)], &graph());
        assert_eq!(
            resolution.edges,
            vec![EdgeId::new(1, 2, 0), EdgeId::new(2, 1, 0)]
        );
    }

    #[test]
    fn closer_candidate_wins_when_distances_differ() {
        let resolution = resolve(&[point(48.15003, 11.5903, 200)], &graph());
        assert_eq!(resolution.edges, vec![EdgeId::new(1, 2, 1)]);

        let resolution = resolve(&[point(48.15003, 11.5917, 200)], &graph());
        assert_eq!(resolution.edges, vec![EdgeId::new(2, 3, 1)]);
    }

    #[test]
    fn unknown_ways_are_dropped_and_order_is_kept() {
        let points = [
            point(48.15, 11.5905, 300),
            point(48.15, 11.5905, 999),
            point(48.15, 11.5905, 300),
            point(48.15003, 11.5917, 200),
        ];
        let resolution = resolve(&points, &graph());
        assert_eq!(
            resolution.edges,
            vec![
                EdgeId::new(3, 1, 0),
                EdgeId::new(3, 1, 0),
                EdgeId::new(2, 3, 1)
            ]
        );
        assert_eq!(resolution.resolved_points, 3);
        assert_eq!(resolution.total_points, 4);
        assert!((resolution.match_rate() - 75.0).abs() < 1e-9);
    }
}
