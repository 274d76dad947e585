//! Optional correction of raw samples through a Mapbox-compatible map
//! matching API, done in batches because the API caps coordinates per call.

use std::time::Duration;

use log::{debug, trace};
use serde::Deserialize;

use crate::config::PrefitConfig;
use crate::error::MatchError;
use crate::remote_matcher::HttpTransport;
use crate::track::{GpsTrack, LatLon};

#[derive(Debug, Deserialize)]
struct MatchingResponse {
    #[serde(default)]
    matchings: Vec<Matching>,
}

#[derive(Debug, Deserialize)]
struct Matching {
    geometry: MatchingGeometry,
}

#[derive(Debug, Deserialize)]
struct MatchingGeometry {
    /// `[lon, lat]` pairs
    coordinates: Vec<[f64; 2]>,
}

#[derive(Debug, Clone)]
pub struct Prefitter {
    base_url: String,
    profile: String,
    access_token: String,
    batch_size: usize,
    pause: Duration,
}

impl Prefitter {
    /// `None` unless an access token is configured.
    pub fn from_config(config: &PrefitConfig) -> Option<Self> {
        let access_token = config.access_token.clone()?;
        Some(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            profile: config.profile.clone(),
            access_token,
            // The API needs two coordinates to match anything
            batch_size: config.batch_size.max(2),
            pause: Duration::from_millis(config.pause_ms),
        })
    }

    /// Corrected samples of all batches, concatenated in order.
    ///
    /// A trailing batch of a single sample is passed through unchanged.
    pub async fn fit<T: HttpTransport>(
        &self,
        transport: &T,
        track: &GpsTrack,
    ) -> Result<Vec<LatLon>, MatchError> {
        let failure = |message: String| MatchError::Prefit {
            track: track.name().to_string(),
            message: self.redact(&message),
        };

        let indices: Vec<usize> = (0..track.points().len()).collect();
        let batches: Vec<&[usize]> = indices.chunks(self.batch_size).collect();
        let mut fitted = Vec::with_capacity(indices.len());

        for (n, batch) in batches.iter().enumerate() {
            if n > 0 {
                tokio::time::sleep(self.pause).await;
            }
            if batch.len() < 2 {
                fitted.extend(batch.iter().map(|&i| track.points()[i]));
                continue;
            }

            // The URL carries the token, it must not reach any error message
            let url = self.batch_url(track, batch);
            let response = transport
                .get(&url)
                .await
                .map_err(|e| failure(format!("{:#}", e)))?;
            if response.status != 200 {
                return Err(failure(format!(
                    "status {} for batch {}: {}",
                    response.status, n, response.body
                )));
            }

            let parsed: MatchingResponse = serde_json::from_str(&response.body)
                .map_err(|e| failure(format!("invalid response for batch {}: {}", n, e)))?;
            let before = fitted.len();
            fitted.extend(
                parsed
                    .matchings
                    .iter()
                    .flat_map(|m| &m.geometry.coordinates)
                    .map(|[lon, lat]| LatLon::new(*lat, *lon)),
            );
            trace!(
                "Batch {} of {}: {} samples fitted to {} points",
                n + 1,
                batches.len(),
                batch.len(),
                fitted.len() - before
            );
        }

        debug!(
            "{}: pre-fitted {} samples into {} points with {} requests",
            track.label(),
            track.points().len(),
            fitted.len(),
            batches.iter().filter(|b| b.len() >= 2).count()
        );
        Ok(fitted)
    }

    fn redact(&self, message: &str) -> String {
        if self.access_token.is_empty() {
            return message.to_string();
        }
        message.replace(&self.access_token, "<redacted>")
    }

    fn batch_url(&self, track: &GpsTrack, batch: &[usize]) -> String {
        let coordinates = batch
            .iter()
            .map(|&i| {
                let p = track.points()[i];
                format!("{},{}", p.lon, p.lat)
            })
            .collect::<Vec<_>>()
            .join(";");
        let timestamps = batch
            .iter()
            .map(|&i| track.timestamps()[i].timestamp().to_string())
            .collect::<Vec<_>>()
            .join(";");

        format!(
            "{}/{}/{}?access_token={}&geometries=geojson&timestamps={}",
            self.base_url, self.profile, coordinates, self.access_token, timestamps
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_matcher::TransportResponse;
    use crate::remote_matcher::tests::FakeTransport;
    use chrono::{TimeZone, Utc};

    const RESPONSE: &str = r#"{
        "code": "Ok",
        "matchings": [
            {"confidence": 0.9, "geometry": {"type": "LineString", "coordinates": [[11.59, 48.15], [11.591, 48.1501]]}}
        ],
        "tracepoints": []
    }"#;

    fn prefitter() -> Prefitter {
        Prefitter::from_config(&PrefitConfig {
            access_token: Some("pk.test".to_string()),
            pause_ms: 0,
            ..Default::default()
        })
        .unwrap()
    }

    fn track(len: usize) -> GpsTrack {
        let points = (0..len)
            .map(|i| LatLon::new(48.15, 11.59 + i as f64 * 0.0001))
            .collect();
        let timestamps = (0..len as i64)
            .map(|s| Utc.timestamp_opt(1_628_848_369 + s, 0).unwrap())
            .collect();
        GpsTrack::new("Long Run", points, timestamps, None, None).unwrap()
    }

    #[test]
    fn disabled_without_token() {
        assert!(Prefitter::from_config(&PrefitConfig::default()).is_none());
    }

    #[tokio::test]
    async fn samples_are_sent_in_batches() {
        let transport = FakeTransport::new(200, RESPONSE);
        let fitted = prefitter().fit(&transport, &track(250)).await.unwrap();

        assert_eq!(transport.calls.get(), 3);
        assert_eq!(fitted.len(), 6);
        assert_eq!(fitted[0], LatLon::new(48.15, 11.59));
        assert_eq!(fitted[1], LatLon::new(48.1501, 11.591));

        let requests = transport.requests.borrow();
        assert!(requests[0].starts_with(
            "https://api.mapbox.com/matching/v5/mapbox/walking/11.59,48.15;"
        ));
        assert!(requests[0].contains("access_token=pk.test"));
        assert!(requests[0].contains("timestamps=1628848369;1628848370;"));
        assert_eq!(requests[2].matches(';').count(), 49 * 2);
    }

    #[tokio::test]
    async fn single_trailing_sample_is_kept_as_is() {
        let transport = FakeTransport::new(200, RESPONSE);
        let track = track(201);
        let fitted = prefitter().fit(&transport, &track).await.unwrap();

        assert_eq!(transport.calls.get(), 2);
        assert_eq!(fitted.len(), 5);
        assert_eq!(fitted[4], track.points()[200]);
    }

    /// Fails like reqwest does, naming the URL in the error
    struct UnreachableTransport;

    impl HttpTransport for UnreachableTransport {
        async fn post_json(&self, url: &str, _body: String) -> anyhow::Result<TransportResponse> {
            Err(anyhow::anyhow!("error sending request for url ({})", url))
        }

        async fn get(&self, url: &str) -> anyhow::Result<TransportResponse> {
            Err(anyhow::anyhow!("error sending request for url ({})", url))
        }
    }

    #[tokio::test]
    async fn network_error_does_not_leak_the_token() {
        let err = prefitter()
            .fit(&UnreachableTransport, &track(10))
            .await
            .unwrap_err();

        assert!(matches!(err, MatchError::Prefit { .. }));
        let message = err.to_string();
        assert!(!message.contains("pk.test"), "token leaked: {}", message);
        assert!(message.contains("access_token=<redacted>"));
    }

    #[tokio::test]
    async fn error_status_fails_the_track() {
        let transport = FakeTransport::new(401, r#"{"message":"Not Authorized - Invalid Token"}"#);
        let err = prefitter().fit(&transport, &track(10)).await.unwrap_err();
        assert!(matches!(err, MatchError::Prefit { .. }));
        assert!(!err.is_fatal());
    }
}
