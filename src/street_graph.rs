//! The street graph every matcher works against.
//!
//! Edges are directed and identified by `(u, v, key)`, so parallel edges
//! between the same nodes can coexist. A graph built without simplification
//! keeps one edge per consecutive node pair of an OSM way, which is why one
//! way usually maps to several edges.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use geo::{BoundingRect, Closest, ClosestPoint, Coord, Haversine, LineString, Point, Rect};
use geo::algorithm::Distance;
use log::debug;
use petgraph::algo::astar;
use petgraph::prelude::UnGraphMap;
use rstar::{AABB, PointDistance, RTree, RTreeObject};
use serde::{Deserialize, Serialize};

use crate::track::LatLon;

pub type NodeId = i64;
pub type WayId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId {
    pub u: NodeId,
    pub v: NodeId,
    pub key: u32,
}

impl EdgeId {
    pub fn new(u: NodeId, v: NodeId, key: u32) -> Self {
        Self { u, v, key }
    }

    pub fn undirected(&self) -> UndirectedEdge {
        UndirectedEdge::new(self.u, self.v)
    }
}

/// Node pair with the smaller id first. Direction and key are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UndirectedEdge(NodeId, NodeId);

impl UndirectedEdge {
    pub fn new(a: NodeId, b: NodeId) -> Self {
        if a <= b { Self(a, b) } else { Self(b, a) }
    }

    pub fn endpoints(&self) -> (NodeId, NodeId) {
        (self.0, self.1)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.0 == node || self.1 == node
    }

    /// Common endpoint of two edges, if any.
    pub fn shared_endpoint(&self, other: &UndirectedEdge) -> Option<NodeId> {
        [self.0, self.1].into_iter().find(|n| other.contains(*n))
    }
}

/// The OSM way(s) an edge was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WayReference {
    Single(WayId),
    Multiple(Vec<WayId>),
}

impl WayReference {
    pub fn contains(&self, id: WayId) -> bool {
        match self {
            WayReference::Single(way) => *way == id,
            WayReference::Multiple(ways) => ways.contains(&id),
        }
    }

    pub fn ids(&self) -> &[WayId] {
        match self {
            WayReference::Single(way) => std::slice::from_ref(way),
            WayReference::Multiple(ways) => ways,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeData {
    /// meters
    pub length: f64,
    /// lon/lat, oriented from `u` to `v`
    pub geometry: LineString<f64>,
    pub way: Option<WayReference>,
}

/// What the matching pipeline needs from a street graph.
///
/// Implementations are read-only while matching runs.
pub trait GraphAdapter {
    /// All edges whose way reference contains `way_id`.
    fn edges_with_way(&self, way_id: WayId) -> Vec<EdgeId>;

    /// Closest edge to `point` and the distance to it in meters.
    fn nearest_edge(&self, point: LatLon) -> Option<(EdgeId, f64)>;

    /// Node sequence of the shortest path by length, both ends included.
    fn shortest_path(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>>;

    /// Length of the shortest edge connecting `u` and `v` in either direction.
    fn edge_length(&self, u: NodeId, v: NodeId) -> Option<f64>;

    fn edge(&self, id: &EdgeId) -> Option<&EdgeData>;

    fn edge_geometry(&self, id: &EdgeId) -> Option<&LineString<f64>> {
        self.edge(id).map(|e| &e.geometry)
    }

    /// Directed edges from `u` to `v`, all keys.
    fn edges_between(&self, u: NodeId, v: NodeId) -> Vec<EdgeId>;

    fn node_position(&self, node: NodeId) -> Option<LatLon>;

    /// Every directed edge.
    fn all_edges(&self) -> Vec<EdgeId>;

    /// Every node pair connected by at least one edge.
    fn undirected_edges(&self) -> BTreeSet<UndirectedEdge> {
        self.all_edges().iter().map(EdgeId::undirected).collect()
    }
}

/// Great-circle distance in meters
pub fn haversine_m(a: LatLon, b: LatLon) -> f64 {
    Haversine.distance(a.to_point(), b.to_point())
}

/// Distance in meters from `point` to the closest point of `geometry`.
pub fn distance_to_geometry(point: LatLon, geometry: &LineString<f64>) -> Option<f64> {
    let point = point.to_point();
    match geometry.closest_point(&point) {
        Closest::Intersection(closest) | Closest::SinglePoint(closest) => {
            Some(Haversine.distance(point, closest))
        }
        Closest::Indeterminate => None,
    }
}

const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Equirectangular projection around the graph centre. Good to well under a
/// meter over the few kilometers a study area spans.
#[derive(Debug, Clone, Copy)]
struct LocalProjection {
    origin: LatLon,
    meters_per_deg_lat: f64,
    meters_per_deg_lon: f64,
}

impl LocalProjection {
    fn around<'a>(positions: impl Iterator<Item = &'a LatLon>) -> Self {
        let (mut lat, mut lon, mut count) = (0.0, 0.0, 0usize);
        for p in positions {
            lat += p.lat;
            lon += p.lon;
            count += 1;
        }
        let origin = if count == 0 {
            LatLon::new(0.0, 0.0)
        } else {
            LatLon::new(lat / count as f64, lon / count as f64)
        };
        let meters_per_deg_lat = EARTH_RADIUS_M.to_radians();

        Self {
            origin,
            meters_per_deg_lat,
            meters_per_deg_lon: meters_per_deg_lat * origin.lat.to_radians().cos(),
        }
    }

    fn project(&self, p: LatLon) -> [f64; 2] {
        [
            (p.lon - self.origin.lon) * self.meters_per_deg_lon,
            (p.lat - self.origin.lat) * self.meters_per_deg_lat,
        ]
    }

    fn project_line(&self, line: &LineString<f64>) -> LineString<f64> {
        line.coords()
            .map(|c| {
                let [x, y] = self.project(LatLon::new(c.y, c.x));
                Coord { x, y }
            })
            .collect()
    }
}

// Edge geometry in projected meters, stored in the R-tree
struct IndexedEdge {
    edge: EdgeId,
    line: LineString<f64>,
    bbox: Rect<f64>,
}

impl RTreeObject for IndexedEdge {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bbox.min().x, self.bbox.min().y],
            [self.bbox.max().x, self.bbox.max().y],
        )
    }
}

impl PointDistance for IndexedEdge {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let query = Point::new(point[0], point[1]);
        match self.line.closest_point(&query) {
            Closest::Intersection(closest) | Closest::SinglePoint(closest) => {
                let dx = closest.x() - query.x();
                let dy = closest.y() - query.y();
                dx * dx + dy * dy
            }
            Closest::Indeterminate => f64::INFINITY,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredGraph {
    nodes: Vec<(NodeId, LatLon)>,
    edges: Vec<(EdgeId, EdgeData)>,
}

/// In-memory street graph with a spatial index for nearest-edge queries and
/// an undirected length-weighted view for shortest paths.
pub struct StreetGraph {
    nodes: HashMap<NodeId, LatLon>,
    edges: BTreeMap<EdgeId, EdgeData>,
    way_index: HashMap<WayId, Vec<EdgeId>>,
    routing: UnGraphMap<NodeId, f64>,
    projection: LocalProjection,
    spatial: RTree<IndexedEdge>,
}

impl StreetGraph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let stored = StoredGraph {
            nodes: self.nodes.iter().map(|(id, p)| (*id, *p)).collect(),
            edges: self
                .edges
                .iter()
                .map(|(id, data)| (*id, data.clone()))
                .collect(),
        };
        let bytes = bincode::serde::encode_to_vec(&stored, bincode::config::standard())
            .map_err(|e| anyhow!("Failed to encode street graph: {}", e))?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, bytes)
            .with_context(|| format!("Failed to write street graph to {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read street graph {}", path.display()))?;
        let (stored, _): (StoredGraph, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| anyhow!("Invalid street graph {}: {}", path.display(), e))?;

        let mut builder = StreetGraphBuilder::new();
        for (id, position) in stored.nodes {
            builder.add_node(id, position);
        }
        for (id, data) in stored.edges {
            builder.edges.insert(id, data);
        }
        Ok(builder.build())
    }
}

impl GraphAdapter for StreetGraph {
    fn edges_with_way(&self, way_id: WayId) -> Vec<EdgeId> {
        self.way_index.get(&way_id).cloned().unwrap_or_default()
    }

    fn nearest_edge(&self, point: LatLon) -> Option<(EdgeId, f64)> {
        let query = self.projection.project(point);
        self.spatial
            .nearest_neighbor(&query)
            .map(|indexed| (indexed.edge, indexed.distance_2(&query).sqrt()))
    }

    fn shortest_path(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>> {
        if !self.routing.contains_node(from) || !self.routing.contains_node(to) {
            return None;
        }
        // Zero estimate: explicit edge lengths need not agree with node positions
        astar(
            &self.routing,
            from,
            |node| node == to,
            |(_, _, length)| *length,
            |_| 0.0,
        )
        .map(|(_, path)| path)
    }

    fn edge_length(&self, u: NodeId, v: NodeId) -> Option<f64> {
        self.routing.edge_weight(u, v).copied()
    }

    fn edge(&self, id: &EdgeId) -> Option<&EdgeData> {
        self.edges.get(id)
    }

    fn edges_between(&self, u: NodeId, v: NodeId) -> Vec<EdgeId> {
        self.edges
            .range(EdgeId::new(u, v, 0)..=EdgeId::new(u, v, u32::MAX))
            .map(|(id, _)| *id)
            .collect()
    }

    fn node_position(&self, node: NodeId) -> Option<LatLon> {
        self.nodes.get(&node).copied()
    }

    fn all_edges(&self) -> Vec<EdgeId> {
        self.edges.keys().copied().collect()
    }
}

#[derive(Debug, Default)]
pub struct StreetGraphBuilder {
    nodes: HashMap<NodeId, LatLon>,
    edges: BTreeMap<EdgeId, EdgeData>,
}

impl StreetGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: NodeId, position: LatLon) -> &mut Self {
        self.nodes.insert(id, position);
        self
    }

    /// Add a straight edge between two known nodes under the next free key.
    pub fn add_edge(
        &mut self,
        u: NodeId,
        v: NodeId,
        length: f64,
        way: Option<WayReference>,
    ) -> Option<EdgeId> {
        let from = self.nodes.get(&u)?;
        let to = self.nodes.get(&v)?;
        let geometry = LineString::from(vec![(from.lon, from.lat), (to.lon, to.lat)]);
        Some(self.add_edge_with_geometry(u, v, geometry, length, way))
    }

    pub fn add_edge_with_geometry(
        &mut self,
        u: NodeId,
        v: NodeId,
        geometry: LineString<f64>,
        length: f64,
        way: Option<WayReference>,
    ) -> EdgeId {
        let mut key = 0;
        while self.edges.contains_key(&EdgeId::new(u, v, key)) {
            key += 1;
        }
        let id = EdgeId::new(u, v, key);
        self.edges.insert(
            id,
            EdgeData {
                length,
                geometry,
                way,
            },
        );
        id
    }

    /// Add `u -> v` and `v -> u` with the same length and way.
    pub fn add_two_way(
        &mut self,
        u: NodeId,
        v: NodeId,
        length: f64,
        way: Option<WayReference>,
    ) -> Option<(EdgeId, EdgeId)> {
        let forward = self.add_edge(u, v, length, way.clone())?;
        let backward = self.add_edge(v, u, length, way)?;
        Some((forward, backward))
    }

    pub fn build(self) -> StreetGraph {
        let projection = LocalProjection::around(self.nodes.values());

        let mut way_index: HashMap<WayId, Vec<EdgeId>> = HashMap::new();
        let mut routing = UnGraphMap::new();
        let mut indexed = Vec::new();

        for node in self.nodes.keys() {
            routing.add_node(*node);
        }

        for (id, data) in &self.edges {
            if let Some(way) = &data.way {
                for way_id in way.ids() {
                    way_index.entry(*way_id).or_default().push(*id);
                }
            }

            match routing.edge_weight_mut(id.u, id.v) {
                Some(length) => *length = data.length.min(*length),
                None => {
                    routing.add_edge(id.u, id.v, data.length);
                }
            }

            // Index one edge of each two-way pair so that nearby samples do
            // not flip between the two directions.
            let reverse = EdgeId::new(id.v, id.u, id.key);
            if id.u > id.v && self.edges.contains_key(&reverse) {
                continue;
            }
            let line = projection.project_line(&data.geometry);
            if let Some(bbox) = line.bounding_rect() {
                indexed.push(IndexedEdge {
                    edge: *id,
                    line,
                    bbox,
                });
            }
        }

        debug!(
            "Built street graph with {} nodes, {} edges, {} indexed geometries",
            self.nodes.len(),
            self.edges.len(),
            indexed.len()
        );

        StreetGraph {
            nodes: self.nodes,
            edges: self.edges,
            way_index,
            routing,
            projection,
            spatial: RTree::bulk_load(indexed),
        }
    }
}
