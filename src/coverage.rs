//! Which streets have been run and which are left.
//!
//! Everything here works on the undirected view of the graph so that the
//! two directions of a street count once.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::route::Route;
use crate::street_graph::{GraphAdapter, UndirectedEdge};
use crate::track::{GpsTrack, LatLon};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageStats {
    pub total_length_meters: f64,
    pub covered_length_meters: f64,
    pub to_cover_length_meters: f64,
    pub covered_percentage: f64,
    pub to_cover_percentage: f64,
    pub number_of_runs: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Coverage {
    /// Most recent run date per covered street, if any run had a date
    covered: BTreeMap<UndirectedEdge, Option<DateTime<Utc>>>,
    to_cover: BTreeSet<UndirectedEdge>,
    number_of_runs: usize,
}

impl Coverage {
    pub fn compute<G: GraphAdapter + ?Sized>(graph: &G, runs: &[(GpsTrack, Route)]) -> Self {
        let all = graph.undirected_edges();
        let mut covered: BTreeMap<UndirectedEdge, Option<DateTime<Utc>>> = BTreeMap::new();
        let mut number_of_runs = 0;

        for (track, route) in runs {
            if route.is_empty() {
                continue;
            }
            number_of_runs += 1;
            for edge in route.all_edges() {
                let street = edge.undirected();
                if !all.contains(&street) {
                    continue;
                }
                let latest = covered.entry(street).or_insert(None);
                *latest = (*latest).max(track.date());
            }
        }

        let to_cover = all
            .into_iter()
            .filter(|street| !covered.contains_key(street))
            .collect();

        Self {
            covered,
            to_cover,
            number_of_runs,
        }
    }

    pub fn covered(&self) -> impl Iterator<Item = &UndirectedEdge> {
        self.covered.keys()
    }

    pub fn to_cover(&self) -> &BTreeSet<UndirectedEdge> {
        &self.to_cover
    }

    pub fn last_run(&self, street: &UndirectedEdge) -> Option<DateTime<Utc>> {
        self.covered.get(street).copied().flatten()
    }

    pub fn stats<G: GraphAdapter + ?Sized>(&self, graph: &G) -> CoverageStats {
        let length = |street: &UndirectedEdge| {
            let (u, v) = street.endpoints();
            graph.edge_length(u, v).unwrap_or(0.0)
        };
        let covered_length: f64 = self.covered.keys().map(length).sum();
        let to_cover_length: f64 = self.to_cover.iter().map(length).sum();
        let total = covered_length + to_cover_length;
        let percentage = |part: f64| if total > 0.0 { part / total * 100.0 } else { 0.0 };

        CoverageStats {
            total_length_meters: total,
            covered_length_meters: covered_length,
            to_cover_length_meters: to_cover_length,
            covered_percentage: percentage(covered_length),
            to_cover_percentage: percentage(to_cover_length),
            number_of_runs: self.number_of_runs,
        }
    }

    /// Every street as a LineString feature with `covered` and `date`.
    pub fn to_geojson<G: GraphAdapter + ?Sized>(&self, graph: &G) -> Value {
        let mut seen = BTreeSet::new();
        let mut features = Vec::new();

        for id in graph.all_edges() {
            let street = id.undirected();
            if !seen.insert(street) {
                continue;
            }
            let Some(data) = graph.edge(&id) else {
                continue;
            };
            let coordinates: Vec<[f64; 2]> = data.geometry.coords().map(|c| [c.x, c.y]).collect();
            let (u, v) = street.endpoints();

            features.push(json!({
                "type": "Feature",
                "geometry": {"type": "LineString", "coordinates": coordinates},
                "properties": {
                    "u": u,
                    "v": v,
                    "length": data.length,
                    "covered": self.covered.contains_key(&street),
                    "date": self.last_run(&street).map(|d| d.to_rfc3339()),
                },
            }));
        }

        json!({"type": "FeatureCollection", "features": features})
    }
}

/// Raw and matched samples of each track, for inspecting match quality.
pub fn matched_points_geojson(tracks: &[GpsTrack]) -> Value {
    let multipoint = |points: &[LatLon]| {
        let coordinates: Vec<[f64; 2]> = points.iter().map(|p| [p.lon, p.lat]).collect();
        json!({"type": "MultiPoint", "coordinates": coordinates})
    };

    let features: Vec<Value> = tracks
        .iter()
        .flat_map(|track| {
            let raw = Some(json!({
                "type": "Feature",
                "geometry": multipoint(track.points()),
                "properties": {"track": track.name(), "type": track.track_type(), "kind": "raw"},
            }));
            let matched = track.matched_points().map(|points| {
                json!({
                    "type": "Feature",
                    "geometry": multipoint(points),
                    "properties": {"track": track.name(), "kind": "matched"},
                })
            });
            raw.into_iter().chain(matched)
        })
        .collect();

    json!({"type": "FeatureCollection", "features": features})
}
