mod config;
mod coverage;
mod edge_resolver;
mod error;
mod fingerprint;
mod gap_filler;
mod osm_import;
mod prefit;
mod remote_matcher;
mod route;
mod streak_matcher;
mod street_graph;
mod track;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::Serialize;

use config::Config;
use coverage::Coverage;
use fingerprint::FingerprintCache;
use remote_matcher::{HttpTransport, RemoteMatcher, ReqwestTransport};
use route::Route;
use street_graph::GraphAdapter;
use track::{GpsTrack, TrackFilter};

#[derive(Parser, Debug)]
#[command(name = "streetcover")]
#[command(about = "Match GPS runs to the street network and report which streets are left", long_about = None)]
struct Cli {
    /// Base URL of the Valhalla API
    #[arg(long, env = "VALHALLA_URL")]
    valhalla: Option<String>,

    /// Directory containing the GPX files of your runs
    #[arg(short = 'd', long)]
    gpxdir: PathBuf,

    /// Results are written to a new timestamped directory below this one
    #[arg(short, long, default_value = "plots")]
    outdir: PathBuf,

    /// File caching matcher responses, created if it does not exist
    #[arg(short, long)]
    cachefile: Option<PathBuf>,

    /// OSM PBF extract covering the area
    #[arg(long)]
    osm: PathBuf,

    /// Where imported street graphs are cached
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// JSON file overriding the default settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pre-fit samples through the Mapbox map matching API
    #[arg(long, env = "MAPBOX_TOKEN")]
    mapbox_token: Option<String>,

    /// Match by proximity instead of calling the remote matcher
    #[arg(long)]
    offline: bool,

    /// Verbose logging and extra output files
    #[arg(long)]
    debug: bool,

    /// Only consider tracks recorded at or after this UNIX timestamp
    #[arg(long)]
    filter_date: Option<i64>,

    /// Only consider tracks with this name
    #[arg(long)]
    filter_name: Option<String>,
}

impl Cli {
    fn settings(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(url) = &self.valhalla {
            config.remote.endpoint = Some(url.clone());
        }
        if let Some(token) = &self.mapbox_token {
            config.prefit.access_token = Some(token.clone());
        }
        Ok(config)
    }

    fn track_filter(&self) -> Result<TrackFilter> {
        let not_before = match self.filter_date {
            Some(secs) => Some(
                DateTime::<Utc>::from_timestamp(secs, 0)
                    .ok_or_else(|| anyhow!("Invalid --filter-date {}", secs))?,
            ),
            None => None,
        };
        Ok(TrackFilter {
            name: self.filter_name.clone(),
            not_before,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::builder()
        .filter_level(if cli.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_target(false)
        .format_timestamp(None)
        .target(env_logger::Target::Stderr)
        .init();

    let config = cli.settings()?;
    let matcher = if cli.offline {
        info!("Offline mode, matching by proximity");
        None
    } else {
        let matcher = RemoteMatcher::new(ReqwestTransport::new()?, &config)
            .context("Pass --valhalla, set VALHALLA_URL or use --offline")?;
        info!("Matching against {}", matcher.url());
        Some(matcher)
    };

    let graph = osm_import::load_or_build(&cli.osm, &config.area, &cli.data_dir)?;

    let mut cache = FingerprintCache::new();
    if let Some(path) = &cli.cachefile {
        cache.configure(path)?;
    }

    let tracks = track::load_tracks(&cli.gpxdir, &cli.track_filter()?)?;
    info!("Matching {} tracks", tracks.len());

    let runs = match_tracks(tracks, &graph, matcher.as_ref(), &config, &mut cache).await?;

    let coverage = Coverage::compute(&graph, &runs);
    let stats = coverage.stats(&graph);
    info!(
        "Covered {:.1} of {:.1} km ({:.1}%) in {} runs, {} streets run, {} to go",
        stats.covered_length_meters / 1000.0,
        stats.total_length_meters / 1000.0,
        stats.covered_percentage,
        stats.number_of_runs,
        coverage.covered().count(),
        coverage.to_cover().len()
    );

    let outdir = cli.outdir.join(Utc::now().timestamp().to_string());
    fs::create_dir_all(&outdir)
        .with_context(|| format!("Failed to create {}", outdir.display()))?;
    write_json(&outdir.join("stats.json"), &stats)?;
    write_json(&outdir.join("coverage.geojson"), &coverage.to_geojson(&graph))?;
    if cli.debug {
        let tracks: Vec<GpsTrack> = runs.into_iter().map(|(track, _)| track).collect();
        write_json(
            &outdir.join("matched_points.geojson"),
            &coverage::matched_points_geojson(&tracks),
        )?;
    }
    info!("Results written to {}", outdir.display());

    cache.flush()?;
    if let Some(path) = cache.path() {
        info!("{} cached responses in {}", cache.len(), path.display());
    }
    Ok(())
}

/// Match every track, isolating per-track failures. Only cache failures
/// abort the batch.
async fn match_tracks<G, T>(
    tracks: Vec<GpsTrack>,
    graph: &G,
    matcher: Option<&RemoteMatcher<T>>,
    config: &Config,
    cache: &mut FingerprintCache,
) -> Result<Vec<(GpsTrack, Route)>>
where
    G: GraphAdapter + ?Sized,
    T: HttpTransport,
{
    let pb = ProgressBar::new(tracks.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta}) - {msg}")?
            .progress_chars("##-"),
    );

    let mut runs = Vec::with_capacity(tracks.len());
    let mut failed = 0;
    for mut track in tracks {
        pb.set_message(track.name().to_string());
        let result = match matcher {
            Some(matcher) => matcher.match_track(&mut track, graph, cache).await,
            None => Ok(match_offline(&track, graph, config)),
        };
        pb.inc(1);

        match result {
            Ok(route) => {
                if route.is_empty() {
                    info!("{} did not touch the area", track.label());
                }
                runs.push((track, route));
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("{}, skipping", e);
                failed += 1;
            }
        }
    }

    pb.finish_with_message(format!("{} matched, {} failed", runs.len(), failed));
    Ok(runs)
}

fn match_offline<G: GraphAdapter + ?Sized>(track: &GpsTrack, graph: &G, config: &Config) -> Route {
    let edges = streak_matcher::match_by_proximity(track, graph, &config.streak);
    let fill = gap_filler::fill(&edges, graph, &config.gap_fill);
    Route::new(edges, fill.edges)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::street_graph::tests::node_row;
    use crate::street_graph::{EdgeId, StreetGraphBuilder};
    use crate::track::LatLon;
    use chrono::TimeZone;

    #[test]
    fn command_line_overrides_config() {
        let cli = Cli::try_parse_from([
            "streetcover",
            "-d",
            "runs",
            "--osm",
            "oberbayern.osm.pbf",
            "--valhalla",
            "http://localhost:8002",
            "--filter-date",
            "1628848369",
        ])
        .unwrap();

        let config = cli.settings().unwrap();
        assert_eq!(
            config.remote.trace_attributes_url().as_deref(),
            Some("http://localhost:8002/trace_attributes")
        );
        assert_eq!(cli.outdir, PathBuf::from("plots"));

        let filter = cli.track_filter().unwrap();
        assert_eq!(
            filter.not_before,
            Some(Utc.timestamp_opt(1_628_848_369, 0).unwrap())
        );
        assert!(filter.name.is_none());
    }

    #[tokio::test]
    async fn offline_batch_keeps_every_track() {
        let mut builder = StreetGraphBuilder::new();
        node_row(&mut builder, &[1, 2, 3]);
        builder.add_two_way(1, 2, 74.0, None);
        builder.add_two_way(2, 3, 74.0, None);
        let graph = builder.build();

        let track = |name: &str, lat: f64| {
            let points: Vec<LatLon> = (0..4)
                .map(|i| LatLon::new(lat, 11.5903 + i as f64 * 0.0001))
                .collect();
            let timestamps = (0..4)
                .map(|s| Utc.timestamp_opt(1_628_848_369 + s, 0).unwrap())
                .collect();
            GpsTrack::new(name, points, timestamps, None, None).unwrap()
        };

        let runs = match_tracks::<_, ReqwestTransport>(
            vec![track("on street", 48.15001), track("elsewhere", 48.30)],
            &graph,
            None,
            &Config::default(),
            &mut FingerprintCache::new(),
        )
        .await
        .unwrap();

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].1.edges, vec![EdgeId::new(1, 2, 0); 4]);
        assert!(runs[1].1.is_empty());
    }
}
