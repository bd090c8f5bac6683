// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Geodata preparation: bulk reverse-geocoding around trip waypoints into
//! the offline store.
//!
//! A job enumerates a grid of points around each waypoint (or one optimized
//! center), fetches each point from Nominatim with a 100 ms courtesy delay
//! and a single request in flight, and persists enriched records. Progress
//! is published through a shared registry; `pause` quiesces the worker at
//! the current waypoint boundary, `cancel` removes the registry entry and
//! the worker exits without a terminal update.

use base::{err, geo, Error, ErrorKind};
use db::geocode::{GeocodeDb, GeocodeRecord};
use base::clock::Clocks;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org/reverse";

const USER_AGENT: &str = concat!(
    "dashcam-trip-planner/",
    env!("CARGO_PKG_VERSION"),
    " (offline geocoding preparation)"
);

/// Courtesy delay between requests; one request in flight at a time.
const INTER_REQUEST_DELAY: Duration = Duration::from_millis(100);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Adaptive radius clamp.
const MIN_RADIUS_KM: f64 = 3.0;
const MAX_RADIUS_KM: f64 = 20.0;

/// Wait while paused before re-checking the registry.
const PAUSE_POLL: Duration = Duration::from_millis(200);

/// Consecutive request failures treated as a dead network rather than bad
/// data.
const CONSECUTIVE_FAILURE_LIMIT: u32 = 10;

/// Grid spacing in degrees, selected by circle radius.
pub fn grid_spacing_deg(radius_km: f64) -> f64 {
    if radius_km <= 1.0 {
        0.001
    } else if radius_km <= 5.0 {
        0.005
    } else if radius_km <= 10.0 {
        0.01
    } else {
        0.02
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PointType {
    CenterWaypoint,
    GridPoint,
}

impl PointType {
    pub fn as_str(self) -> &'static str {
        match self {
            PointType::CenterWaypoint => "center_waypoint",
            PointType::GridPoint => "grid_point",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GridPoint {
    pub lat: f64,
    pub lon: f64,
    pub point_type: PointType,
}

/// Every grid point within the circle, center first.
pub fn generate_grid(center_lat: f64, center_lon: f64, radius_km: f64) -> Vec<GridPoint> {
    let mut points = vec![GridPoint {
        lat: center_lat,
        lon: center_lon,
        point_type: PointType::CenterWaypoint,
    }];
    if !geo::valid_coords(center_lat, center_lon) || radius_km <= 0.0 {
        return points;
    }
    let radius_deg = radius_km / 111.0;
    let spacing = grid_spacing_deg(radius_km);
    let mut lat = center_lat - radius_deg;
    while lat <= center_lat + radius_deg {
        let mut lon = center_lon - radius_deg;
        while lon <= center_lon + radius_deg {
            let dist_deg =
                ((lat - center_lat).powi(2) + (lon - center_lon).powi(2)).sqrt();
            let is_center =
                (lat - center_lat).abs() < 0.001 && (lon - center_lon).abs() < 0.001;
            if dist_deg <= radius_deg && !is_center && geo::valid_coords(lat, lon) {
                points.push(GridPoint {
                    lat,
                    lon,
                    point_type: PointType::GridPoint,
                });
            }
            lon += spacing;
        }
        lat += spacing;
    }
    debug!(
        center_lat,
        center_lon,
        radius_km,
        spacing,
        count = points.len(),
        "generated grid coverage"
    );
    points
}

#[derive(Clone, Debug, PartialEq)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    pub name: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum AreaClass {
    Urban,
    Suburban,
    Rural,
}

/// Latitude-band heuristic for area class. A stand-in for real population
/// density data.
fn area_class(lat: f64) -> AreaClass {
    let lat_abs = lat.abs();
    if (30.0..=60.0).contains(&lat_abs) {
        AreaClass::Urban
    } else if (20.0..30.0).contains(&lat_abs) || (60.0..=70.0).contains(&lat_abs) {
        AreaClass::Suburban
    } else {
        AreaClass::Rural
    }
}

fn base_radius_km(class: AreaClass) -> f64 {
    match class {
        AreaClass::Urban => 6.0,
        AreaClass::Suburban => 10.0,
        AreaClass::Rural => 15.0,
    }
}

/// Density factor from the mean distance to other waypoints within 50 km:
/// a dense cluster shrinks each circle. Neutral (1.0) when isolated.
fn density_factor(i: usize, waypoints: &[Waypoint]) -> f64 {
    let wp = &waypoints[i];
    let mut nearby = 0;
    let mut total = 0.0;
    for (j, other) in waypoints.iter().enumerate() {
        if i == j {
            continue;
        }
        let d = geo::haversine_km(wp.lat, wp.lon, other.lat, other.lon);
        if d <= 50.0 {
            nearby += 1;
            total += d;
        }
    }
    if nearby == 0 {
        return 1.0;
    }
    (total / nearby as f64 / 25.0).clamp(0.5, 1.5)
}

/// Shrinks circles that would substantially overlap a neighbor's.
fn overlap_factor(i: usize, waypoints: &[Waypoint], base_radius: f64) -> f64 {
    let wp = &waypoints[i];
    let mut penalty = 0.0;
    for (j, other) in waypoints.iter().enumerate() {
        if i == j {
            continue;
        }
        let d = geo::haversine_km(wp.lat, wp.lon, other.lat, other.lon);
        let reach = base_radius * 1.2;
        if d < reach {
            penalty += (reach - d) / reach;
        }
    }
    (1.0 - penalty * 0.3).max(0.6)
}

/// Optimized per-waypoint radii: area-class base, density and overlap
/// modulation, clamped to `[3 km, 20 km]`.
pub fn adaptive_radii(waypoints: &[Waypoint]) -> Vec<f64> {
    waypoints
        .iter()
        .enumerate()
        .map(|(i, wp)| {
            let base = base_radius_km(area_class(wp.lat));
            let after_density = base * density_factor(i, waypoints);
            let after_overlap = after_density * overlap_factor(i, waypoints, after_density);
            after_overlap.clamp(MIN_RADIUS_KM, MAX_RADIUS_KM)
        })
        .collect()
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Downloading,
    Paused,
    Complete,
    Error,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    DownloadingWaypoint,
    SavingData,
    CompletingWaypoint,
    Complete,
    Error,
    Stopped,
}

/// Progress of one trip's geodata job, published over SSE.
#[derive(Clone, Debug, serde::Serialize)]
pub struct DownloadProgress {
    pub trip_id: String,
    pub status: Status,
    pub current_phase: Phase,
    pub progress_percent: f64,
    pub waypoints_processed: usize,
    pub total_waypoints: usize,
    pub grid_processed: usize,
    pub grid_total: usize,
    pub successful_calls: usize,
    pub failed_calls: usize,
    pub detail: String,
    pub eta_seconds: Option<u64>,
}

impl DownloadProgress {
    fn new(trip_id: &str) -> Self {
        DownloadProgress {
            trip_id: trip_id.to_owned(),
            status: Status::Downloading,
            current_phase: Phase::Initializing,
            progress_percent: 0.0,
            waypoints_processed: 0,
            total_waypoints: 0,
            grid_processed: 0,
            grid_total: 0,
            successful_calls: 0,
            failed_calls: 0,
            detail: String::new(),
            eta_seconds: None,
        }
    }
}

/// Shared registry of in-flight jobs, keyed by trip id. Removing an entry
/// is the cancellation signal.
#[derive(Default)]
pub struct ProgressRegistry {
    jobs: Mutex<HashMap<String, DownloadProgress>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, trip_id: &str) -> Option<DownloadProgress> {
        self.jobs.lock().unwrap().get(trip_id).cloned()
    }

    /// Pauses a running job. Returns false if unknown.
    pub fn pause(&self, trip_id: &str) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(trip_id) {
            Some(p) if p.status == Status::Downloading => {
                p.status = Status::Paused;
                info!(%trip_id, "geodata download paused");
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn resume(&self, trip_id: &str) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(trip_id) {
            Some(p) if p.status == Status::Paused => {
                p.status = Status::Downloading;
                info!(%trip_id, "geodata download resumed");
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Cancels by removing the entry; the worker notices and exits without
    /// a terminal state update.
    pub fn cancel(&self, trip_id: &str) -> bool {
        let removed = self.jobs.lock().unwrap().remove(trip_id).is_some();
        if removed {
            info!(%trip_id, "geodata download cancelled");
        }
        removed
    }

    fn insert(&self, progress: DownloadProgress) {
        self.jobs
            .lock()
            .unwrap()
            .insert(progress.trip_id.clone(), progress);
    }

    /// Applies `f` to the entry. Returns false (cancelled) if it is gone.
    fn update(&self, trip_id: &str, f: impl FnOnce(&mut DownloadProgress)) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(trip_id) {
            Some(p) => {
                f(p);
                true
            }
            None => false,
        }
    }

    fn is_paused(&self, trip_id: &str) -> Option<bool> {
        self.jobs
            .lock()
            .unwrap()
            .get(trip_id)
            .map(|p| p.status == Status::Paused)
    }
}

/// Rate-limited Nominatim reverse geocoding client.
pub struct NominatimClient {
    http: reqwest::Client,
    endpoint: String,
}

impl NominatimClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| err!(Internal, source(e)))?;
        Ok(NominatimClient {
            http,
            endpoint: endpoint.into(),
        })
    }

    /// One reverse lookup. `Ok(None)` for an empty/placeless response,
    /// `NetworkTransient` for request failures.
    pub async fn reverse(&self, lat: f64, lon: f64) -> Result<Option<serde_json::Value>, Error> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("format", "json".to_owned()),
                ("addressdetails", "1".to_owned()),
                ("extratags", "1".to_owned()),
                ("namedetails", "1".to_owned()),
                ("zoom", "18".to_owned()),
            ])
            .send()
            .await
            .map_err(|e| err!(NetworkTransient, source(e)))?;
        if !response.status().is_success() {
            return Err(err!(
                NetworkTransient,
                msg("reverse geocoding returned {}", response.status())
            ));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| err!(NetworkTransient, source(e)))?;
        Ok(body.get("display_name").is_some().then_some(body))
    }
}

/// One job's inputs.
#[derive(Clone, Debug)]
pub struct GeodataJob {
    pub trip_id: String,
    /// Ordered waypoints: start, intermediates, end.
    pub waypoints: Vec<Waypoint>,
    /// Fixed radius for every waypoint; adaptive radii when absent.
    pub radius_km: Option<f64>,
    /// Optimized single circle covering the whole trip.
    pub single_center: Option<(f64, f64, f64)>,
    pub use_single_center: bool,
}

/// The long-running downloader. One instance per process; jobs run on the
/// caller's task.
pub struct GeodataDownloader<C: Clocks + Clone> {
    registry: Arc<ProgressRegistry>,
    store: Arc<GeocodeDb<C>>,
    client: NominatimClient,
    inter_request_delay: Duration,
}

impl<C: Clocks + Clone> GeodataDownloader<C> {
    pub fn new(
        registry: Arc<ProgressRegistry>,
        store: Arc<GeocodeDb<C>>,
        client: NominatimClient,
    ) -> Self {
        GeodataDownloader {
            registry,
            store,
            client,
            inter_request_delay: INTER_REQUEST_DELAY,
        }
    }

    #[cfg(test)]
    fn with_delay(mut self, delay: Duration) -> Self {
        self.inter_request_delay = delay;
        self
    }

    pub fn registry(&self) -> &Arc<ProgressRegistry> {
        &self.registry
    }

    /// Runs a job to completion, cancellation, or error.
    pub async fn run(&self, job: GeodataJob) {
        let trip_id = job.trip_id.clone();
        self.registry.insert(DownloadProgress::new(&trip_id));

        if job.use_single_center {
            if let Some((lat, lon, radius_km)) = job.single_center {
                match self.run_circles(&trip_id, &[(lat, lon, radius_km)]).await {
                    Outcome::Done => {
                        self.finish(&trip_id);
                        return;
                    }
                    Outcome::Cancelled => return,
                    Outcome::Failed(e) => {
                        // Fall back to per-waypoint mode and continue.
                        warn!(
                            %trip_id,
                            err = %e.chain(),
                            "single-center mode failed; falling back to per-waypoint"
                        );
                    }
                }
            } else {
                warn!(%trip_id, "single-center requested without a center; using waypoints");
            }
        }

        let radii: Vec<f64> = match job.radius_km {
            Some(r) => vec![r; job.waypoints.len()],
            None => adaptive_radii(&job.waypoints),
        };
        let circles: Vec<(f64, f64, f64)> = job
            .waypoints
            .iter()
            .zip(&radii)
            .map(|(wp, r)| (wp.lat, wp.lon, *r))
            .collect();
        match self.run_circles(&trip_id, &circles).await {
            Outcome::Done => self.finish(&trip_id),
            Outcome::Cancelled => {}
            Outcome::Failed(e) => {
                warn!(%trip_id, err = %e.chain(), "geodata download failed");
                self.registry.update(&trip_id, |p| {
                    p.status = Status::Error;
                    p.current_phase = Phase::Error;
                    p.detail = e.to_string();
                });
            }
        }
    }

    fn finish(&self, trip_id: &str) {
        let updated = self.registry.update(trip_id, |p| {
            p.status = Status::Complete;
            p.current_phase = Phase::Complete;
            p.progress_percent = 100.0;
            p.eta_seconds = Some(0);
            p.detail = "download complete".to_owned();
        });
        if updated {
            info!(%trip_id, "geodata download complete");
        }
    }

    /// Downloads every circle, one waypoint at a time. Pause is honored at
    /// waypoint boundaries; cancellation between grid points.
    async fn run_circles(&self, trip_id: &str, circles: &[(f64, f64, f64)]) -> Outcome {
        let grids: Vec<Vec<GridPoint>> = circles
            .iter()
            .map(|(lat, lon, r)| generate_grid(*lat, *lon, *r))
            .collect();
        let total_points: usize = grids.iter().map(Vec::len).sum();
        if !self.registry.update(trip_id, |p| {
            p.total_waypoints = circles.len();
            p.detail = format!("processing {total_points} points");
        }) {
            return Outcome::Cancelled;
        }

        let started = Instant::now();
        let mut consecutive_failures = 0u32;
        let mut done_points = 0usize;
        for (wi, grid) in grids.iter().enumerate() {
            // Quiesce here while paused; a removed entry means cancelled.
            loop {
                match self.registry.is_paused(trip_id) {
                    None => return Outcome::Cancelled,
                    Some(true) => tokio::time::sleep(PAUSE_POLL).await,
                    Some(false) => break,
                }
            }
            if !self.registry.update(trip_id, |p| {
                p.current_phase = Phase::DownloadingWaypoint;
                p.grid_processed = 0;
                p.grid_total = grid.len();
                p.detail = format!("waypoint {}/{}", wi + 1, circles.len());
            }) {
                return Outcome::Cancelled;
            }

            for (pi, point) in grid.iter().enumerate() {
                match self.client.reverse(point.lat, point.lon).await {
                    Ok(Some(response)) => {
                        consecutive_failures = 0;
                        let record = GeocodeRecord::from_nominatim(
                            point.lat,
                            point.lon,
                            Some(trip_id),
                            point.point_type.as_str(),
                            &response,
                        );
                        if !self.registry.update(trip_id, |p| {
                            p.current_phase = Phase::SavingData;
                        }) {
                            return Outcome::Cancelled;
                        }
                        if let Err(e) = self.store.store(&record) {
                            if e.kind() == ErrorKind::StorageFatal {
                                return Outcome::Failed(e);
                            }
                            warn!(err = %e.chain(), "unable to store geodata record");
                            if !self.registry.update(trip_id, |p| p.failed_calls += 1) {
                                return Outcome::Cancelled;
                            }
                        } else if !self.registry.update(trip_id, |p| p.successful_calls += 1) {
                            return Outcome::Cancelled;
                        }
                    }
                    Ok(None) => {
                        consecutive_failures = 0;
                        if !self.registry.update(trip_id, |p| p.failed_calls += 1) {
                            return Outcome::Cancelled;
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        debug!(err = %e.chain(), "reverse geocoding request failed");
                        // A long unbroken run of failures means the network
                        // is gone, not the data.
                        if consecutive_failures >= CONSECUTIVE_FAILURE_LIMIT {
                            return Outcome::Failed(err!(
                                NetworkFatal,
                                msg("{consecutive_failures} consecutive request failures")
                            ));
                        }
                        if !self.registry.update(trip_id, |p| p.failed_calls += 1) {
                            return Outcome::Cancelled;
                        }
                    }
                }
                done_points += 1;
                let percent = done_points as f64 / total_points as f64 * 100.0;
                let eta = if done_points > 0 {
                    let per_point = started.elapsed().as_secs_f64() / done_points as f64;
                    Some((per_point * (total_points - done_points) as f64) as u64)
                } else {
                    None
                };
                if !self.registry.update(trip_id, |p| {
                    p.grid_processed = pi + 1;
                    p.progress_percent = percent;
                    p.eta_seconds = eta;
                }) {
                    return Outcome::Cancelled;
                }
                tokio::time::sleep(self.inter_request_delay).await;
            }

            if !self.registry.update(trip_id, |p| {
                p.current_phase = Phase::CompletingWaypoint;
                p.waypoints_processed = wi + 1;
            }) {
                return Outcome::Cancelled;
            }
        }
        Outcome::Done
    }
}

enum Outcome {
    Done,
    Cancelled,
    Failed(Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use jiff::Timestamp;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn spacing_buckets() {
        assert_eq!(grid_spacing_deg(0.5), 0.001);
        assert_eq!(grid_spacing_deg(1.0), 0.001);
        assert_eq!(grid_spacing_deg(3.0), 0.005);
        assert_eq!(grid_spacing_deg(10.0), 0.01);
        assert_eq!(grid_spacing_deg(15.0), 0.02);
    }

    #[test]
    fn grid_center_first_then_circle() {
        let grid = generate_grid(40.0, -3.7, 0.5);
        assert_eq!(grid[0].point_type, PointType::CenterWaypoint);
        assert_eq!((grid[0].lat, grid[0].lon), (40.0, -3.7));
        assert!(grid.len() > 1, "grid must cover the circle");
        let radius_deg = 0.5 / 111.0;
        for p in &grid[1..] {
            assert_eq!(p.point_type, PointType::GridPoint);
            let d = ((p.lat - 40.0).powi(2) + (p.lon + 3.7).powi(2)).sqrt();
            assert!(d <= radius_deg + 1e-9, "point outside circle");
        }
        // Larger radius, coarser spacing, still bounded.
        let big = generate_grid(40.0, -3.7, 12.0);
        assert!(big.len() > grid.len());
    }

    #[test]
    fn grid_rejects_invalid_center() {
        assert_eq!(generate_grid(95.0, 0.0, 1.0).len(), 1);
        assert_eq!(generate_grid(40.0, -3.7, 0.0).len(), 1);
    }

    #[test]
    fn area_classes_by_latitude_band() {
        assert_eq!(area_class(40.0), AreaClass::Urban);
        assert_eq!(area_class(-45.0), AreaClass::Urban);
        assert_eq!(area_class(25.0), AreaClass::Suburban);
        assert_eq!(area_class(65.0), AreaClass::Suburban);
        assert_eq!(area_class(5.0), AreaClass::Rural);
        assert_eq!(area_class(80.0), AreaClass::Rural);
    }

    #[test]
    fn adaptive_radii_clamp_and_shrink_clusters() {
        // One isolated rural waypoint: base 15 km, no modulation.
        let lone = vec![Waypoint {
            lat: 5.0,
            lon: 0.0,
            name: None,
        }];
        let radii = adaptive_radii(&lone);
        assert_eq!(radii, vec![15.0]);

        // A tight urban cluster shrinks each circle toward the minimum.
        let cluster: Vec<Waypoint> = (0..4)
            .map(|i| Waypoint {
                lat: 40.0 + i as f64 * 0.01,
                lon: -3.7,
                name: None,
            })
            .collect();
        let radii = adaptive_radii(&cluster);
        for r in &radii {
            assert!((MIN_RADIUS_KM..=MAX_RADIUS_KM).contains(r), "got {r}");
            assert!(*r < 6.0, "cluster circle did not shrink: {r}");
        }

        // Far-apart urban waypoints keep their base radius (density factor
        // neutral beyond 50 km, no overlap).
        let spread = vec![
            Waypoint { lat: 40.0, lon: -3.7, name: None },
            Waypoint { lat: 41.0, lon: -1.0, name: None },
        ];
        let radii = adaptive_radii(&spread);
        assert_eq!(radii, vec![6.0, 6.0]);
    }

    /// Serves canned Nominatim responses; counts requests.
    async fn serve_nominatim(hits: Arc<AtomicUsize>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let hits = hits.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |_req| {
                        hits.fetch_add(1, Ordering::SeqCst);
                        async move {
                            let body = serde_json::json!({
                                "place_id": 1,
                                "display_name": "Somewhere, Testland",
                                "address": {
                                    "road": "Test Road",
                                    "city": "Testville",
                                    "country": "Testland",
                                    "country_code": "tl"
                                }
                            })
                            .to_string();
                            Ok::<_, std::convert::Infallible>(
                                hyper::Response::builder()
                                    .header("content-type", "application/json")
                                    .body(Full::new(bytes::Bytes::from(body)))
                                    .unwrap(),
                            )
                        }
                    });
                    let io = hyper_util::rt::TokioIo::new(stream);
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });
        format!("http://{addr}/reverse")
    }

    fn downloader(
        endpoint: &str,
    ) -> (
        GeodataDownloader<SimulatedClocks>,
        Arc<GeocodeDb<SimulatedClocks>>,
    ) {
        let store = Arc::new(
            GeocodeDb::open_in_memory(SimulatedClocks::new(Timestamp::UNIX_EPOCH)).unwrap(),
        );
        let d = GeodataDownloader::new(
            Arc::new(ProgressRegistry::new()),
            store.clone(),
            NominatimClient::new(endpoint).unwrap(),
        )
        .with_delay(Duration::from_millis(1));
        (d, store)
    }

    fn job(trip_id: &str, n_waypoints: usize) -> GeodataJob {
        GeodataJob {
            trip_id: trip_id.to_owned(),
            waypoints: (0..n_waypoints)
                .map(|i| Waypoint {
                    lat: 40.0 + i as f64 * 0.1,
                    lon: -3.7,
                    name: Some(format!("wp{i}")),
                })
                .collect(),
            radius_km: Some(0.35),
            single_center: None,
            use_single_center: false,
        }
    }

    #[tokio::test]
    async fn full_run_completes_and_stores_all_points() {
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = serve_nominatim(hits.clone()).await;
        let (d, store) = downloader(&endpoint);

        let j = job("trip-1", 3);
        let expected: usize = j
            .waypoints
            .iter()
            .map(|w| generate_grid(w.lat, w.lon, 0.35).len())
            .sum();
        d.run(j).await;

        let p = d.registry().get("trip-1").unwrap();
        assert_eq!(p.status, Status::Complete);
        assert_eq!(p.current_phase, Phase::Complete);
        assert_eq!(p.waypoints_processed, 3);
        assert_eq!(p.total_waypoints, 3);
        assert_eq!(p.progress_percent, 100.0);
        assert_eq!(p.successful_calls, expected);
        assert_eq!(p.failed_calls, 0);
        assert_eq!(hits.load(Ordering::SeqCst), expected);
        assert_eq!(store.trip_record_count("trip-1").unwrap() as usize, expected);
        // Center waypoints and grid points are both present.
        let rec = store.lookup(40.0, -3.7, 0.05).unwrap().unwrap();
        assert_eq!(rec.location_type.as_deref(), Some("center_waypoint"));
    }

    #[tokio::test]
    async fn pause_then_resume_matches_uninterrupted_run() {
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = serve_nominatim(hits.clone()).await;

        // Uninterrupted reference run.
        let (d1, store1) = downloader(&endpoint);
        d1.run(job("ref", 2)).await;
        let reference = store1.trip_record_count("ref").unwrap();

        // Paused run: pre-insert the entry paused, resume shortly after.
        let (d2, store2) = downloader(&endpoint);
        let registry = d2.registry().clone();
        let worker = {
            let j = job("paused", 2);
            async move { d2.run(j).await }
        };
        let control = async move {
            // Wait for the entry to appear, then pause at the first
            // waypoint boundary.
            loop {
                if registry.pause("paused") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            let before = registry.get("paused").unwrap();
            assert_eq!(before.status, Status::Paused);
            assert!(registry.resume("paused"));
        };
        tokio::join!(worker, control);

        let p = store2
            .trip_record_count("paused")
            .unwrap();
        assert_eq!(p, reference, "pause/resume must not change the result");
    }

    #[tokio::test]
    async fn cancel_removes_entry_and_stops_worker() {
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = serve_nominatim(hits.clone()).await;
        let (d, _store) = downloader(&endpoint);
        let registry = d.registry().clone();

        let worker = tokio::spawn(async move { d.run(job("doomed", 3)).await });
        // Wait until the job registers, then cancel.
        loop {
            if registry.get("doomed").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(registry.cancel("doomed"));
        worker.await.unwrap();
        // The worker exited without re-inserting a terminal state.
        assert!(registry.get("doomed").is_none());
        assert!(!registry.cancel("doomed"));
    }

    #[tokio::test]
    async fn single_center_mode_downloads_one_circle() {
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = serve_nominatim(hits.clone()).await;
        let (d, store) = downloader(&endpoint);
        let mut j = job("single", 3);
        j.use_single_center = true;
        j.single_center = Some((40.0, -3.7, 0.35));
        let expected = generate_grid(40.0, -3.7, 0.35).len();
        d.run(j).await;

        let p = d.registry().get("single").unwrap();
        assert_eq!(p.status, Status::Complete);
        assert_eq!(p.successful_calls, expected);
        assert_eq!(store.trip_record_count("single").unwrap() as usize, expected);
    }

    #[tokio::test]
    async fn unreachable_endpoint_errors_out() {
        // Nothing listens on this port.
        let (d, _store) = downloader("http://127.0.0.1:1/reverse");
        d.run(job("nofire", 1)).await;
        let p = d.registry().get("nofire").unwrap();
        assert_eq!(p.status, Status::Error);
        assert_eq!(p.current_phase, Phase::Error);
    }

    #[tokio::test]
    async fn nominatim_client_parses_and_flags_failures() {
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = serve_nominatim(hits.clone()).await;
        let client = NominatimClient::new(&endpoint).unwrap();
        let body = client.reverse(40.0, -3.7).await.unwrap().unwrap();
        assert_eq!(body["display_name"], "Somewhere, Testland");

        let dead = NominatimClient::new("http://127.0.0.1:1/reverse").unwrap();
        let err = dead.reverse(40.0, -3.7).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkTransient);
    }
}
