//! Client for a Valhalla-style `trace_attributes` endpoint.
//!
//! A track's samples are posted as one shape; the matched points that come
//! back carry an index into the response's edge list, whose `way_id` is
//! resolved against the local graph. Responses are cached by request
//! fingerprint so re-running a batch does not hit the service again.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};

use crate::config::{Config, GapFillConfig};
use crate::edge_resolver;
use crate::error::MatchError;
use crate::fingerprint::{FingerprintCache, fingerprint};
use crate::gap_filler;
use crate::prefit::Prefitter;
use crate::route::Route;
use crate::street_graph::{GraphAdapter, WayId};
use crate::track::{GpsTrack, LatLon};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ShapePoint {
    pub lat: f64,
    pub lon: f64,
}

/// Runs are on foot, so pedestrian costing
pub const COSTING: &str = "pedestrian";
/// Samples are snapped to the road network, never routed between
pub const SHAPE_MATCH: &str = "map_snap";

/// Request body. Field order is part of the cache key, keep it stable.
#[derive(Debug, Clone, Serialize)]
pub struct MatchRequest {
    pub shape: Vec<ShapePoint>,
    pub costing: &'static str,
    pub shape_match: &'static str,
}

impl MatchRequest {
    pub fn new(points: &[LatLon]) -> Self {
        Self {
            shape: points
                .iter()
                .map(|p| ShapePoint {
                    lat: p.lat,
                    lon: p.lon,
                })
                .collect(),
            costing: COSTING,
            shape_match: SHAPE_MATCH,
        }
    }

    /// Canonical JSON form, the input of the request fingerprint.
    pub fn body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Deserialize)]
struct TraceResponse {
    #[serde(default)]
    matched_points: Vec<ResponsePoint>,
    #[serde(default)]
    edges: Vec<ResponseEdge>,
}

#[derive(Debug, Deserialize)]
struct ResponsePoint {
    lat: f64,
    lon: f64,
    #[serde(rename = "type")]
    kind: String,
    edge_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ResponseEdge {
    way_id: Option<WayId>,
}

/// A sample the service snapped onto one of its edges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedPoint {
    pub position: LatLon,
    /// Index into the response's edge list
    pub edge_index: usize,
    pub way_id: WayId,
}

/// Keep the points classified as "matched", in response order.
///
/// Points referring to an edge the response does not describe are dropped.
pub fn parse_response(track: &str, text: &str) -> Result<Vec<MatchedPoint>, MatchError> {
    let response: TraceResponse =
        serde_json::from_str(text).map_err(|source| MatchError::MalformedResponse {
            track: track.to_string(),
            source,
        })?;

    let mut dangling = 0;
    let points: Vec<MatchedPoint> = response
        .matched_points
        .iter()
        .filter(|point| point.kind == "matched")
        .filter_map(|point| {
            let resolved = point.edge_index.and_then(|index| {
                let way_id = response.edges.get(index)?.way_id?;
                Some(MatchedPoint {
                    position: LatLon::new(point.lat, point.lon),
                    edge_index: index,
                    way_id,
                })
            });
            if resolved.is_none() {
                dangling += 1;
            }
            resolved
        })
        .collect();

    if dangling > 0 {
        warn!(
            "Track '{}': dropped {} matched points referring to unknown edges ({} edges in response)",
            track,
            dangling,
            response.edges.len()
        );
    }
    Ok(points)
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// The HTTP calls the matchers make. Non-success statuses are returned, not
/// turned into errors; only network failures are `Err`.
#[allow(async_fn_in_trait)]
pub trait HttpTransport {
    async fn post_json(&self, url: &str, body: String) -> Result<TransportResponse>;

    async fn get(&self, url: &str) -> Result<TransportResponse>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(180))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, body: String) -> Result<TransportResponse> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(reqwest::Error::without_url)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(reqwest::Error::without_url)?;
        Ok(TransportResponse { status, body })
    }

    async fn get(&self, url: &str) -> Result<TransportResponse> {
        // Query strings may carry access tokens, keep URLs out of errors
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(reqwest::Error::without_url)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(reqwest::Error::without_url)?;
        Ok(TransportResponse { status, body })
    }
}

pub struct RemoteMatcher<T> {
    transport: T,
    url: String,
    gap_fill: GapFillConfig,
    prefit: Option<Prefitter>,
}

impl<T: HttpTransport> RemoteMatcher<T> {
    /// Fails when no endpoint is configured.
    pub fn new(transport: T, config: &Config) -> Result<Self> {
        let url = config
            .remote
            .trace_attributes_url()
            .ok_or_else(|| anyhow!("No remote matcher endpoint configured"))?;
        let prefit = Prefitter::from_config(&config.prefit);
        if prefit.is_some() {
            info!("Samples are pre-fitted before matching");
        }

        Ok(Self {
            transport,
            url,
            gap_fill: config.gap_fill.clone(),
            prefit,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Match one track and bridge the gaps in the result.
    ///
    /// Successful responses are cached and the cache file is rewritten
    /// before parsing. The track's matched points are replaced on success.
    pub async fn match_track<G: GraphAdapter + ?Sized>(
        &self,
        track: &mut GpsTrack,
        graph: &G,
        cache: &mut FingerprintCache,
    ) -> Result<Route, MatchError> {
        let samples = match &self.prefit {
            Some(prefit) => prefit.fit(&self.transport, track).await?,
            None => track.points().to_vec(),
        };

        let body = MatchRequest::new(&samples)
            .body()
            .map_err(|source| MatchError::Request {
                track: track.name().to_string(),
                source,
            })?;
        let key = fingerprint(&body);

        let text = match cache.get(&key) {
            Some(text) => {
                debug!("{}: served from cache ({})", track.label(), key);
                text.to_string()
            }
            None => {
                debug!(
                    "{}: posting {} samples to {}",
                    track.label(),
                    samples.len(),
                    self.url
                );
                let response = self
                    .transport
                    .post_json(&self.url, body)
                    .await
                    .map_err(|e| MatchError::Transport {
                        track: track.name().to_string(),
                        message: format!("{:#}", e),
                    })?;
                if response.status != 200 {
                    return Err(MatchError::RemoteStatus {
                        track: track.name().to_string(),
                        status: response.status,
                        body: response.body,
                    });
                }
                cache.put(key, response.body.as_str());
                cache.flush()?;
                response.body
            }
        };

        let matched = parse_response(track.name(), &text)?;
        track.record_matched_points(matched.iter().map(|p| p.position).collect());

        let resolution = edge_resolver::resolve(&matched, graph);
        if resolution.resolved_points < resolution.total_points {
            debug!(
                "{}: {:.1}% of matched points lie on the local graph",
                track.label(),
                resolution.match_rate()
            );
        }
        let fill = gap_filler::fill(&resolution.edges, graph, &self.gap_fill);

        Ok(Route::new(resolution.edges, fill.edges))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::{Cell, RefCell};

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::street_graph::tests::node_row;
    use crate::street_graph::{EdgeId, StreetGraph, StreetGraphBuilder, WayReference};

    /// Replays canned responses and counts the calls made.
    pub(crate) struct FakeTransport {
        pub status: u16,
        pub body: String,
        pub calls: Cell<usize>,
        pub requests: RefCell<Vec<String>>,
    }

    impl FakeTransport {
        pub fn new(status: u16, body: &str) -> Self {
            Self {
                status,
                body: body.to_string(),
                calls: Cell::new(0),
                requests: RefCell::new(Vec::new()),
            }
        }

        fn record(&self, request: String) -> Result<TransportResponse> {
            self.calls.set(self.calls.get() + 1);
            self.requests.borrow_mut().push(request);
            Ok(TransportResponse {
                status: self.status,
                body: self.body.clone(),
            })
        }
    }

    impl HttpTransport for FakeTransport {
        async fn post_json(&self, _url: &str, body: String) -> Result<TransportResponse> {
            self.record(body)
        }

        async fn get(&self, url: &str) -> Result<TransportResponse> {
            self.record(url.to_string())
        }
    }

    const RESPONSE: &str = r#"{
        "matched_points": [
            {"lat": 48.15, "lon": 11.5905, "type": "matched", "edge_index": 0, "distance_along_edge": 0.5},
            {"lat": 48.16, "lon": 11.60, "type": "unmatched", "edge_index": 4294967295},
            {"lat": 48.15, "lon": 11.5915, "type": "matched", "edge_index": 1},
            {"lat": 48.15, "lon": 11.5925, "type": "matched", "edge_index": 7}
        ],
        "edges": [
            {"way_id": 100, "length": 0.074},
            {"way_id": 200, "length": 0.074}
        ]
    }"#;

    fn graph() -> StreetGraph {
        let mut builder = StreetGraphBuilder::new();
        node_row(&mut builder, &[1, 2, 3]);
        builder.add_two_way(1, 2, 74.0, Some(WayReference::Single(100)));
        builder.add_two_way(2, 3, 74.0, Some(WayReference::Single(200)));
        builder.build()
    }

    fn track() -> GpsTrack {
        let points = vec![LatLon::new(48.15001, 11.5904), LatLon::new(48.15001, 11.5916)];
        let timestamps = vec![
            Utc.timestamp_opt(1_628_848_369, 0).unwrap(),
            Utc.timestamp_opt(1_628_848_375, 0).unwrap(),
        ];
        GpsTrack::new("Morning Run", points, timestamps, None, None).unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.remote.endpoint = Some("http://localhost:8002/".to_string());
        config
    }

    #[test]
    fn request_body_is_canonical() {
        let request = MatchRequest::new(&[LatLon::new(48.15, 11.59), LatLon::new(48.1501, 11.5902)]);
        assert_eq!(
            request.body().unwrap(),
            r#"{"shape":[{"lat":48.15,"lon":11.59},{"lat":48.1501,"lon":11.5902}],"costing":"pedestrian","shape_match":"map_snap"}"#
        );
    }

    #[tokio::test]
    async fn costing_in_config_file_is_ignored() {
        let config: Config = serde_json::from_str(
            r#"{"remote": {"endpoint": "http://localhost:8002", "costing": "auto", "shape_match": "walk_or_snap"}}"#,
        )
        .unwrap();
        let matcher = RemoteMatcher::new(FakeTransport::new(200, RESPONSE), &config).unwrap();

        matcher
            .match_track(&mut track(), &graph(), &mut FingerprintCache::new())
            .await
            .unwrap();

        let requests = matcher.transport.requests.borrow();
        assert!(requests[0].ends_with(r#""costing":"pedestrian","shape_match":"map_snap"}"#));
    }

    #[tokio::test]
    async fn transport_errors_omit_the_url() {
        let transport = ReqwestTransport::new().unwrap();
        // Nothing listens on port 9 of the loopback interface
        let err = transport
            .get("http://127.0.0.1:9/matching?access_token=sk.secret")
            .await
            .unwrap_err();
        let message = format!("{:#}", err);
        assert!(!message.contains("sk.secret"), "token leaked: {}", message);
        assert!(!message.contains("127.0.0.1:9/matching"));

        let err = transport
            .post_json("http://127.0.0.1:9/trace_attributes?key=sk.secret", "{}".to_string())
            .await
            .unwrap_err();
        assert!(!format!("{:#}", err).contains("sk.secret"));
    }

    #[test]
    fn only_matched_points_with_known_edges_are_kept() {
        let points = parse_response("Morning Run", RESPONSE).unwrap();
        assert_eq!(
            points,
            vec![
                MatchedPoint {
                    position: LatLon::new(48.15, 11.5905),
                    edge_index: 0,
                    way_id: 100
                },
                MatchedPoint {
                    position: LatLon::new(48.15, 11.5915),
                    edge_index: 1,
                    way_id: 200
                },
            ]
        );
    }

    #[test]
    fn malformed_response_is_reported() {
        let err = parse_response("Morning Run", "<html>502</html>").unwrap_err();
        assert!(matches!(err, MatchError::MalformedResponse { .. }));
    }

    #[test]
    fn missing_endpoint_is_rejected() {
        let transport = FakeTransport::new(200, RESPONSE);
        assert!(RemoteMatcher::new(transport, &Config::default()).is_err());
    }

    #[tokio::test]
    async fn match_resolves_ways_and_records_points() {
        let matcher = RemoteMatcher::new(FakeTransport::new(200, RESPONSE), &config()).unwrap();
        assert_eq!(matcher.url(), "http://localhost:8002/trace_attributes");

        let mut track = track();
        let mut cache = FingerprintCache::new();
        let route = matcher
            .match_track(&mut track, &graph(), &mut cache)
            .await
            .unwrap();

        assert_eq!(
            route.edges,
            vec![
                EdgeId::new(1, 2, 0),
                EdgeId::new(2, 1, 0),
                EdgeId::new(2, 3, 0),
                EdgeId::new(3, 2, 0)
            ]
        );
        assert!(route.fillers.is_empty());
        assert_eq!(track.matched_points().map(|p| p.len()), Some(2));

        let requests = matcher.transport.requests.borrow();
        assert!(requests[0].contains(r#"{"lat":48.15001,"lon":11.5904}"#));
    }

    #[tokio::test]
    async fn repeated_request_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache/responses.json");
        let mut cache = FingerprintCache::new();
        cache.configure(&cache_path).unwrap();

        let matcher = RemoteMatcher::new(FakeTransport::new(200, RESPONSE), &config()).unwrap();
        let graph = graph();

        let first = matcher
            .match_track(&mut track(), &graph, &mut cache)
            .await
            .unwrap();
        assert_eq!(matcher.transport.calls.get(), 1);
        assert!(cache_path.is_file());

        let second = matcher
            .match_track(&mut track(), &graph, &mut cache)
            .await
            .unwrap();
        assert_eq!(matcher.transport.calls.get(), 1);
        assert_eq!(first, second);

        let mut reloaded = FingerprintCache::new();
        reloaded.configure(&cache_path).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn error_status_fails_without_caching() {
        let matcher = RemoteMatcher::new(
            FakeTransport::new(400, r#"{"error":"No suitable edges near location"}"#),
            &config(),
        )
        .unwrap();
        let mut track = track();
        let mut cache = FingerprintCache::new();

        let err = matcher
            .match_track(&mut track, &graph(), &mut cache)
            .await
            .unwrap_err();

        match &err {
            MatchError::RemoteStatus {
                track,
                status,
                body,
            } => {
                assert_eq!(track, "Morning Run");
                assert_eq!(*status, 400);
                assert!(body.contains("No suitable edges"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!err.is_fatal());
        assert!(cache.is_empty());
        assert!(track.matched_points().is_none());

        // Not cached, so the next attempt calls again
        let _ = matcher.match_track(&mut track, &graph(), &mut cache).await;
        assert_eq!(matcher.transport.calls.get(), 2);
    }
}
