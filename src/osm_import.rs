//! Street graph import from an OSM PBF extract.
//!
//! Ways are kept unsimplified: one edge per consecutive node pair, in both
//! directions since a pedestrian may walk a one-way street either way. The
//! result is cached next to the other data files, keyed by the area settings
//! and the extract's file name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use geo::{Haversine, LineString, Point};
use geo::algorithm::Distance;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use osmpbf::{Element, ElementReader};

use crate::config::AreaConfig;
use crate::fingerprint::fingerprint;
use crate::street_graph::{NodeId, StreetGraph, StreetGraphBuilder, WayId, WayReference};
use crate::track::LatLon;

/// A highway way as read from the extract
#[derive(Debug, Clone)]
pub struct RawWay {
    pub id: WayId,
    pub nodes: Vec<NodeId>,
}

/// Load the cached graph for this area, or import it from `pbf` and cache it.
pub fn load_or_build(pbf: &Path, area: &AreaConfig, data_dir: &Path) -> Result<StreetGraph> {
    let cache = cache_path(pbf, area, data_dir)?;
    if cache.is_file() {
        let graph = StreetGraph::load(&cache)?;
        info!(
            "Loaded street graph from {} ({} nodes, {} edges)",
            cache.display(),
            graph.node_count(),
            graph.edge_count()
        );
        return Ok(graph);
    }

    let start_time = Instant::now();
    let (nodes, ways) = read_pbf(pbf, area)?;
    let graph = build_graph(&nodes, &ways);
    info!(
        "Imported {} ways into {} nodes and {} edges in {:.1?}",
        ways.len(),
        graph.node_count(),
        graph.edge_count(),
        start_time.elapsed()
    );

    graph.save(&cache)?;
    debug!("Cached street graph at {}", cache.display());
    Ok(graph)
}

fn cache_path(pbf: &Path, area: &AreaConfig, data_dir: &Path) -> Result<PathBuf> {
    let mut description = serde_json::to_string(area)?;
    if let Some(name) = pbf.file_name().and_then(|n| n.to_str()) {
        description.push_str(name);
    }
    Ok(data_dir.join(format!("{}.bin", fingerprint(&description))))
}

/// Positions of the nodes inside the area and the accepted highway ways.
pub fn read_pbf(pbf: &Path, area: &AreaConfig) -> Result<(HashMap<NodeId, LatLon>, Vec<RawWay>)> {
    let reader = ElementReader::from_path(pbf)
        .with_context(|| format!("Failed to open OSM extract {}", pbf.display()))?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {spinner} {pos} elements - {msg}")?,
    );
    pb.set_message(format!("Reading {}", pbf.display()));

    let mut nodes = HashMap::new();
    let mut ways = Vec::new();

    reader
        .for_each(|element| {
            pb.inc(1);
            match element {
                Element::Node(node) => {
                    if area.contains(node.lon(), node.lat()) {
                        nodes.insert(node.id(), LatLon::new(node.lat(), node.lon()));
                    }
                }
                Element::DenseNode(node) => {
                    if area.contains(node.lon(), node.lat()) {
                        nodes.insert(node.id(), LatLon::new(node.lat(), node.lon()));
                    }
                }
                Element::Way(way) => {
                    let accepted = way
                        .tags()
                        .find(|(key, _)| *key == "highway")
                        .is_some_and(|(_, highway)| area.accepts_highway(highway));
                    if accepted {
                        let refs: Vec<NodeId> = way.refs().collect();
                        if refs.len() > 1 {
                            ways.push(RawWay {
                                id: way.id(),
                                nodes: refs,
                            });
                        }
                    }
                }
                _ => {}
            }
        })
        .with_context(|| format!("Failed to read OSM extract {}", pbf.display()))?;

    pb.finish_with_message(format!(
        "{} nodes in area, {} highway ways",
        nodes.len(),
        ways.len()
    ));
    Ok((nodes, ways))
}

/// One two-way edge per consecutive node pair. Segments leaving the area
/// are cut off.
pub fn build_graph(nodes: &HashMap<NodeId, LatLon>, ways: &[RawWay]) -> StreetGraph {
    let mut builder = StreetGraphBuilder::new();

    for way in ways {
        for pair in way.nodes.windows(2) {
            let (u, v) = (pair[0], pair[1]);
            if u == v {
                continue;
            }
            let (Some(from), Some(to)) = (nodes.get(&u), nodes.get(&v)) else {
                continue;
            };

            builder.add_node(u, *from).add_node(v, *to);
            let length = Haversine.distance(
                Point::new(from.lon, from.lat),
                Point::new(to.lon, to.lat),
            );
            let reference = Some(WayReference::Single(way.id));
            builder.add_edge_with_geometry(
                u,
                v,
                LineString::from(vec![(from.lon, from.lat), (to.lon, to.lat)]),
                length,
                reference.clone(),
            );
            builder.add_edge_with_geometry(
                v,
                u,
                LineString::from(vec![(to.lon, to.lat), (from.lon, from.lat)]),
                length,
                reference,
            );
        }
    }

    builder.build()
}
