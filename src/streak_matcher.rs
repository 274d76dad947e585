//! Offline matching by nearest edge, used when no remote matcher is reachable.
//!
//! Every sample snaps to its nearest edge. Runs of samples on the same edge
//! form streaks, and short streaks that hug an intersection are dropped since
//! they are usually a neighbouring street grazed while turning. The route
//! holds one edge per kept sample, so a street appears as often as it was
//! sampled.

use log::{debug, trace};

use crate::config::StreakConfig;
use crate::street_graph::{EdgeId, GraphAdapter, haversine_m};
use crate::track::{GpsTrack, LatLon};

#[derive(Debug, Clone, Copy)]
struct Hit {
    edge: EdgeId,
    point: LatLon,
}

pub fn match_by_proximity<G: GraphAdapter + ?Sized>(
    track: &GpsTrack,
    graph: &G,
    config: &StreakConfig,
) -> Vec<EdgeId> {
    let hits: Vec<Hit> = track
        .points()
        .iter()
        .filter_map(|point| {
            let (edge, distance) = graph.nearest_edge(*point)?;
            (distance < config.max_distance_m).then_some(Hit {
                edge,
                point: *point,
            })
        })
        .collect();

    let mut route = Vec::new();
    let mut kept = 0;
    let mut rejected = 0;
    for streak in hits.chunk_by(|a, b| a.edge == b.edge) {
        let edge = streak[0].edge;
        if streak.len() >= config.min_streak {
            route.extend(streak.iter().map(|hit| hit.edge));
            kept += 1;
            continue;
        }

        let ratio = streak
            .iter()
            .map(|hit| intersection_ratio(graph, hit))
            .fold(f64::NEG_INFINITY, f64::max);
        if ratio > config.min_intersection_ratio {
            route.extend(streak.iter().map(|hit| hit.edge));
            kept += 1;
        } else {
            trace!(
                "Dropping {}-sample streak on {:?} near an intersection (ratio {:.2})",
                streak.len(),
                edge,
                ratio
            );
            rejected += 1;
        }
    }

    debug!(
        "{}: {} of {} samples near the graph, {} streaks kept, {} dropped",
        track.label(),
        hits.len(),
        track.points().len(),
        kept,
        rejected
    );
    route
}

/// Distance to the nearer endpoint of the hit edge, relative to its length.
fn intersection_ratio<G: GraphAdapter + ?Sized>(graph: &G, hit: &Hit) -> f64 {
    let endpoints = [hit.edge.u, hit.edge.v]
        .into_iter()
        .filter_map(|node| graph.node_position(node));
    let nearest = endpoints
        .map(|position| haversine_m(hit.point, position))
        .fold(f64::INFINITY, f64::min);

    match graph.edge(&hit.edge) {
        Some(data) => nearest / data.length,
        None => 0.0,
    }
}
