// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Capture manager: the orchestrator over cameras, recording engine, GPS
//! reader, landmark index, and trip store.
//!
//! Responsibilities:
//! * camera initialization (in parallel) and per-camera failure counting
//!   with driver reset at the threshold;
//! * trip lifecycle: a trip starts with recording and ends with it, with
//!   orphan recovery for trips left open by a crash;
//! * the GPS logger task: position rows every 2 s while a trip is active,
//!   landmark scan within 2 km every 5 s;
//! * landmark approach: quality upgrade inside 500 m of a priority
//!   landmark, encounter rows inside 200 m (cooldown-gated), auto-start and
//!   clip marking inside 100 m;
//! * clip enrichment: GPS interval, track-sampled landmarks, offline
//!   reverse geocoding, metadata injection, persistence.
//!
//! The recorder never sees any of this: it calls the [`ClipSink`] trait,
//! which this manager implements. The trip store is downstream of the
//! manager only.

use crate::cameras::{CameraDriver, CameraKind, Frame, RESET_THRESHOLD};
use crate::config::Paths;
use crate::gps::FixSource;
use crate::landmarks::{Landmark, LandmarkIndex};
use crate::metadata::MetadataInjector;
use crate::recorder::{CameraHandle, ClipRecord, ClipSink, Recorder};
use base::clock::Clocks;
use base::{shutdown, Error};
use db::{ClipInsert, Database, EncounterInsert, GeocodeDb, GpsSample, Quality, UpgradeInsert};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Quality upgrades trigger inside this distance of a priority landmark.
const UPGRADE_DISTANCE_M: f64 = 500.0;
/// Encounter rows are written inside this distance.
const ENCOUNTER_DISTANCE_M: f64 = 200.0;
/// Recording auto-starts and the clip is marked inside this distance.
const MARK_DISTANCE_M: f64 = 100.0;

/// Landmark scan radius for approach planning.
const APPROACH_SCAN_KM: f64 = 2.0;

/// Every Nth GPS row of a clip is checked against the landmark index.
const LANDMARK_SAMPLE_STRIDE: usize = 5;

/// Minimum spacing of repeated per-camera warnings.
const WARN_INTERVAL: Duration = Duration::from_secs(10);

/// GPS retention horizon for the hourly sweep.
const GPS_RETENTION_DAYS: i64 = 30;
const GPS_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Clone, Copy, Debug)]
pub struct CaptureOptions {
    /// Cadence of GPS row writes while a trip is active.
    pub gps_log_interval: Duration,
    /// Cadence of the 2 km landmark scan.
    pub landmark_check_interval: Duration,
    /// Sleep granularity of the logger loop.
    pub loop_granularity: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            gps_log_interval: Duration::from_secs(2),
            landmark_check_interval: Duration::from_secs(5),
            loop_granularity: Duration::from_secs(1),
        }
    }
}

struct LoggerTask {
    shutdown_tx: shutdown::Sender,
    join: std::thread::JoinHandle<()>,
}

pub struct CaptureManager<C: Clocks + Clone> {
    clocks: C,
    paths: Paths,
    db: Arc<Database<C>>,
    gps: Arc<dyn FixSource>,
    landmarks: Arc<LandmarkIndex<C>>,
    recorder: Recorder<C>,
    injector: MetadataInjector,
    /// Offline reverse geocoding for clip location names, when prepared.
    geocode: Option<Arc<GeocodeDb<C>>>,
    cameras: Vec<CameraHandle>,
    options: CaptureOptions,
    current_trip: Mutex<Option<i64>>,
    failures: Mutex<HashMap<CameraKind, u32>>,
    last_warn: Mutex<HashMap<CameraKind, Duration>>,
    last_gps_cleanup: Mutex<Option<Duration>>,
    logger: Mutex<Option<LoggerTask>>,
}

impl<C: Clocks + Clone> CaptureManager<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clocks: C,
        paths: Paths,
        db: Arc<Database<C>>,
        gps: Arc<dyn FixSource>,
        landmarks: Arc<LandmarkIndex<C>>,
        geocode: Option<Arc<GeocodeDb<C>>>,
        cameras: Vec<CameraHandle>,
        recorder: Recorder<C>,
        options: CaptureOptions,
    ) -> Self {
        CaptureManager {
            clocks,
            paths,
            db,
            gps,
            landmarks,
            recorder,
            injector: MetadataInjector::new(),
            geocode,
            cameras,
            options,
            current_trip: Mutex::new(None),
            failures: Mutex::new(HashMap::new()),
            last_warn: Mutex::new(HashMap::new()),
            last_gps_cleanup: Mutex::new(None),
            logger: Mutex::new(None),
        }
    }

    /// Initializes all cameras in parallel. Returns the list of per-camera
    /// failures; the system runs degraded with whatever initialized.
    pub fn initialize(&self) -> Vec<String> {
        let mut errors = Vec::new();
        std::thread::scope(|s| {
            let handles: Vec<_> = self
                .cameras
                .iter()
                .map(|(kind, cam)| {
                    let kind = *kind;
                    s.spawn(move || {
                        info!(camera = %kind, "initializing camera");
                        cam.lock().unwrap().initialize().map_err(|e| (kind, e))
                    })
                })
                .collect();
            for h in handles {
                if let Err((kind, e)) = h.join().expect("camera init does not panic") {
                    warn!(camera = %kind, err = %e.chain(), "could not initialize camera");
                    errors.push(format!("could not initialize {kind} camera"));
                }
            }
        });
        info!("camera initialization complete");
        errors
    }

    /// Finalizes a trip left active by a prior run.
    pub fn recover_orphan_trip(&self) -> Result<(), Error> {
        if let Some(id) = self.db.recover_orphan_trip()? {
            warn!(trip_id = id, "finalized orphan active trip from prior run");
        }
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn current_trip(&self) -> Option<i64> {
        *self.current_trip.lock().unwrap()
    }

    /// Reads a single preview frame, counting failures toward a driver
    /// reset. A camera owned by the recording engine yields `None` fast.
    pub fn get_preview_frame(&self, kind: CameraKind) -> Option<Frame> {
        let Some((_, cam)) = self.cameras.iter().find(|(k, _)| *k == kind) else {
            self.warn_rate_limited(kind, "unknown camera");
            return None;
        };
        let mut guard = match cam.try_lock() {
            Ok(g) => g,
            Err(TryLockError::WouldBlock) => {
                debug!(camera = %kind, "camera busy (contention)");
                return None;
            }
            Err(TryLockError::Poisoned(_)) => return None,
        };
        if !guard.is_initialized() {
            self.warn_rate_limited(kind, "camera not initialized");
            return None;
        }
        match guard.capture_frame() {
            Some(frame) => {
                let mut failures = self.failures.lock().unwrap();
                if failures.insert(kind, 0).unwrap_or(0) > 0 {
                    info!(camera = %kind, "camera recovered without reset");
                }
                Some(frame)
            }
            None => {
                let count = {
                    let mut failures = self.failures.lock().unwrap();
                    let c = failures.entry(kind).or_insert(0);
                    *c += 1;
                    *c
                };
                if count >= RESET_THRESHOLD {
                    warn!(camera = %kind, count, "failure threshold reached; resetting driver");
                    guard.release();
                    self.clocks.sleep(Duration::from_secs(1));
                    if let Err(e) = guard.initialize() {
                        warn!(camera = %kind, err = %e.chain(), "driver reset failed");
                    }
                    self.failures.lock().unwrap().insert(kind, 0);
                } else {
                    self.warn_rate_limited(kind, "failed to capture preview frame");
                }
                None
            }
        }
    }

    fn warn_rate_limited(&self, kind: CameraKind, msg: &str) {
        let now = self.clocks.monotonic();
        let mut last = self.last_warn.lock().unwrap();
        let stale = last
            .get(&kind)
            .map(|prev| now.saturating_sub(*prev) >= WARN_INTERVAL)
            .unwrap_or(true);
        if stale {
            warn!(camera = %kind, "{msg}");
            last.insert(kind, now);
        }
    }

    /// Starts the recording engine, opens a trip, and launches the GPS
    /// logger.
    pub fn start_recording(self: &Arc<Self>) -> Result<(), Error> {
        self.recorder.start_recording(self.clone())?;
        let fix = self.gps.latest();
        let trip_id = match self.db.start_trip(fix.latitude, fix.longitude, None) {
            Ok(id) => id,
            Err(e) => {
                let _ = self.recorder.stop_recording();
                return Err(e);
            }
        };
        *self.current_trip.lock().unwrap() = Some(trip_id);
        info!(trip_id, "recording started");
        self.start_gps_logger();
        Ok(())
    }

    /// Stops the GPS logger and engine, persists the final clip (which
    /// bypassed the sink), ends the trip, and returns all clips.
    pub fn stop_recording(self: &Arc<Self>) -> Result<Vec<ClipRecord>, Error> {
        self.stop_gps_logger();
        let clips = self.recorder.stop_recording()?;
        let trip_id = self.current_trip.lock().unwrap().take();
        if let (Some(trip_id), Some(last)) = (trip_id, clips.last()) {
            self.enrich_and_persist(trip_id, last);
        }
        if let Some(trip_id) = trip_id {
            let fix = self.gps.latest();
            self.db.end_trip(trip_id, fix.latitude, fix.longitude)?;
            info!(trip_id, clips = clips.len(), "recording stopped, trip ended");
        }
        Ok(clips)
    }

    pub fn set_recording_quality(&self, quality: Quality) {
        self.recorder.set_recording_quality(quality);
    }

    pub fn current_quality(&self) -> Quality {
        self.recorder.current_quality()
    }

    /// Applies a settings map from the subscription bus. Only the keys the
    /// capture side owns are interpreted here.
    pub fn apply_settings(&self, settings: &serde_json::Map<String, serde_json::Value>) {
        if let Some(q) = settings
            .get("recording_quality")
            .and_then(|v| v.as_str())
            .and_then(Quality::parse)
        {
            self.set_recording_quality(q);
        }
    }

    /// Stops everything and releases the drivers. Used at process shutdown.
    pub fn cleanup(self: &Arc<Self>) {
        if self.recorder.is_recording() {
            info!("stopping recording during cleanup");
            if let Err(e) = self.stop_recording() {
                error!(err = %e.chain(), "error stopping recording during cleanup");
            }
        }
        for (_, cam) in &self.cameras {
            cam.lock().unwrap().release();
        }
    }

    fn start_gps_logger(self: &Arc<Self>) {
        let mut logger = self.logger.lock().unwrap();
        if logger.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let manager = self.clone();
        let join = std::thread::Builder::new()
            .name("gps-logger".to_owned())
            .spawn(move || manager.gps_logger_loop(shutdown_rx))
            .expect("spawning gps logger");
        *logger = Some(LoggerTask { shutdown_tx, join });
        info!("GPS logging started");
    }

    fn stop_gps_logger(&self) {
        let Some(task) = self.logger.lock().unwrap().take() else {
            return;
        };
        drop(task.shutdown_tx);
        if task.join.join().is_err() {
            error!("GPS logger thread panicked");
        }
        info!("GPS logging stopped");
    }

    /// Background task while a trip is active: position rows on the log
    /// cadence, landmark scan on the check cadence, GPS retention sweep
    /// hourly.
    fn gps_logger_loop(self: Arc<Self>, shutdown_rx: shutdown::Receiver) {
        let mut last_log: Option<Duration> = None;
        let mut last_check: Option<Duration> = None;
        loop {
            if shutdown_rx.wait_for(self.options.loop_granularity).is_err() {
                return;
            }
            let now = self.clocks.monotonic();
            let due = |last: &mut Option<Duration>, interval: Duration| {
                let is_due = last.map(|l| now.saturating_sub(l) >= interval).unwrap_or(true);
                if is_due {
                    *last = Some(now);
                }
                is_due
            };
            if due(&mut last_log, self.options.gps_log_interval) {
                self.log_current_position();
            }
            if due(&mut last_check, self.options.landmark_check_interval) {
                self.check_nearby_landmarks();
            }
            self.maybe_cleanup_gps();
        }
    }

    fn log_current_position(&self) {
        let Some(trip_id) = self.current_trip() else {
            return;
        };
        let fix = self.gps.latest();
        if !fix.is_loggable() {
            return;
        }
        let sample = GpsSample {
            timestamp: self.clocks.realtime(),
            latitude: fix.latitude.unwrap(),
            longitude: fix.longitude.unwrap(),
            altitude: fix.altitude,
            speed: fix.speed,
            heading: fix.heading,
            satellites: fix.satellites,
            fix_quality: fix.fix_quality,
        };
        if let Err(e) = self.db.log_gps(Some(trip_id), &sample) {
            warn!(err = %e.chain(), "unable to log GPS position");
        }
    }

    fn check_nearby_landmarks(self: &Arc<Self>) {
        let fix = self.gps.latest();
        let (Some(lat), Some(lon)) = (fix.latitude, fix.longitude) else {
            return;
        };
        for (landmark, distance_m) in self.landmarks.nearby_within(lat, lon, APPROACH_SCAN_KM) {
            self.handle_landmark_approach(&landmark, distance_m);
        }
    }

    /// Distance-tiered reaction to an approaching landmark.
    pub fn handle_landmark_approach(self: &Arc<Self>, landmark: &Landmark, distance_m: f64) {
        if distance_m <= UPGRADE_DISTANCE_M
            && landmark.is_priority()
            && self.recorder.is_recording()
            && self.recorder.current_quality() == Quality::Normal
        {
            info!(
                landmark = %landmark.name,
                distance_m,
                "upgrading recording quality for priority landmark"
            );
            self.recorder.set_recording_quality(Quality::High);
            if let Some(trip_id) = self.current_trip() {
                let up = UpgradeInsert {
                    landmark_id: Some(landmark.id.clone()),
                    landmark_name: Some(landmark.name.clone()),
                    distance_meters: distance_m,
                    reason: "priority_landmark_approach".to_owned(),
                };
                if let Err(e) = self.db.log_quality_upgrade(trip_id, &up) {
                    warn!(err = %e.chain(), "unable to log quality upgrade");
                }
            }
        }

        if distance_m <= ENCOUNTER_DISTANCE_M {
            if let Some(trip_id) = self.current_trip() {
                if self.landmarks.notify_permitted(&landmark.id) {
                    let enc = EncounterInsert {
                        landmark_id: landmark.id.clone(),
                        landmark_name: landmark.name.clone(),
                        lat: landmark.lat,
                        lon: landmark.lon,
                        landmark_type: landmark.category.clone(),
                        is_priority_landmark: landmark.is_priority(),
                    };
                    if let Err(e) = self.db.add_landmark_encounter(trip_id, &enc) {
                        warn!(err = %e.chain(), "unable to record landmark encounter");
                    }
                }
            }
        }

        if distance_m <= MARK_DISTANCE_M {
            if !self.recorder.is_recording() {
                info!(landmark = %landmark.name, "auto-starting recording for nearby landmark");
                if let Err(e) = self.start_recording() {
                    warn!(err = %e.chain(), "auto-start failed");
                }
            }
            self.recorder.mark_landmark_proximity(&landmark.id);
        }
    }

    fn maybe_cleanup_gps(&self) {
        let now = self.clocks.monotonic();
        {
            let mut last = self.last_gps_cleanup.lock().unwrap();
            let is_due = last
                .map(|l| now.saturating_sub(l) >= GPS_CLEANUP_INTERVAL)
                .unwrap_or(true);
            if !is_due {
                return;
            }
            *last = Some(now);
        }
        let cutoff =
            self.clocks.realtime() - jiff::SignedDuration::from_hours(24 * GPS_RETENTION_DAYS);
        match self.db.cleanup_gps_before(cutoff) {
            Ok(0) => {}
            Ok(n) => info!(deleted = n, "cleaned up old GPS rows"),
            Err(e) => warn!(err = %e.chain(), "GPS cleanup failed"),
        }
    }

    /// Enriches one completed clip and writes it to the trip store.
    fn enrich_and_persist(&self, trip_id: i64, clip: &ClipRecord) {
        let mut insert = ClipInsert {
            start_time: Some(clip.start_time),
            end_time: Some(clip.end_time),
            sequence_num: clip.sequence_num,
            quality: Some(clip.quality),
            road_video_file: clip
                .files
                .get(&CameraKind::Road)
                .map(|p| self.paths.relativize(p).to_string_lossy().into_owned()),
            interior_video_file: clip
                .files
                .get(&CameraKind::Interior)
                .map(|p| self.paths.relativize(p).to_string_lossy().into_owned()),
            ..ClipInsert::default()
        };

        let track = match self.db.gps_in_range(trip_id, clip.start_time, clip.end_time) {
            Ok(t) => t,
            Err(e) => {
                warn!(err = %e.chain(), "unable to read clip GPS range");
                Vec::new()
            }
        };
        if let (Some(first), Some(last)) = (track.first(), track.last()) {
            insert.start_lat = Some(first.latitude);
            insert.start_lon = Some(first.longitude);
            insert.end_lat = Some(last.latitude);
            insert.end_lon = Some(last.longitude);
        }

        // Landmarks along the track, sampled to keep the index queries
        // bounded. A priority landmark wins over whichever came first.
        let mut nearby: Vec<Landmark> = Vec::new();
        for point in track.iter().step_by(LANDMARK_SAMPLE_STRIDE) {
            if let Some(hit) = self.landmarks.nearby(point.latitude, point.longitude) {
                if !nearby.iter().any(|l| l.id == hit.landmark.id) {
                    nearby.push(hit.landmark);
                }
            }
        }
        let chosen = nearby
            .iter()
            .find(|l| l.is_priority())
            .or_else(|| nearby.first());
        if let Some(lm) = chosen {
            insert.near_landmark = true;
            insert.landmark_id = Some(lm.id.clone());
            insert.landmark_type = Some(lm.category.clone());
        } else if let Some(marked) = &clip.marked_landmark {
            insert.near_landmark = true;
            insert.landmark_id = Some(marked.clone());
        }

        if let (Some(geocode), Some(lat), Some(lon)) =
            (self.geocode.as_ref(), insert.start_lat, insert.start_lon)
        {
            match geocode.lookup(lat, lon, 1.0) {
                Ok(Some(rec)) => {
                    insert.location = Some(serde_json::json!({
                        "display_name": rec.display_name,
                        "city": rec.city,
                        "town": rec.town,
                        "village": rec.village,
                        "state": rec.state,
                        "country": rec.country,
                        "country_code": rec.country_code,
                        "timestamp": self.clocks.realtime().to_string(),
                    }));
                }
                Ok(None) => debug!("no offline geocoding record for clip start"),
                Err(e) => warn!(err = %e.chain(), "offline geocoding lookup failed"),
            }
        }

        for path in clip.files.values() {
            if let Err(e) = self
                .injector
                .process_clip(&self.clocks, path, &track, &insert)
            {
                warn!(
                    path = %path.display(),
                    err = %e.chain(),
                    "unable to attach clip metadata"
                );
            }
        }

        match self.db.record_clip(trip_id, &insert) {
            Ok(clip_id) => info!(
                clip_id,
                sequence = clip.sequence_num,
                "clip persisted"
            ),
            Err(e) => error!(err = %e.chain(), "unable to persist clip"),
        }
    }
}

/// The recorder hands completed clips here, serially, from its own thread.
impl<C: Clocks + Clone> ClipSink for CaptureManager<C> {
    fn clip_completed(&self, clip: ClipRecord) {
        let Some(trip_id) = self.current_trip() else {
            warn!("completed clip with no active trip; dropping");
            return;
        };
        debug!(sequence = clip.sequence_num, "processing completed clip");
        self.enrich_and_persist(trip_id, &clip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cameras::testutil::MockDriver;
    use crate::gps::GpsFix;
    use crate::recorder::RecorderOptions;
    use base::clock::RealClocks;
    use db::GeocodeRecord;

    /// Scriptable fix source.
    #[derive(Default)]
    struct StubGps {
        fix: Mutex<GpsFix>,
    }

    impl StubGps {
        fn set(&self, lat: f64, lon: f64) {
            *self.fix.lock().unwrap() = GpsFix {
                latitude: Some(lat),
                longitude: Some(lon),
                altitude: Some(600.0),
                speed: Some(13.0),
                heading: Some(45.0),
                satellites: Some(9),
                fix_quality: 1,
            };
        }

        fn clear(&self) {
            *self.fix.lock().unwrap() = GpsFix::default();
        }
    }

    impl FixSource for StubGps {
        fn latest(&self) -> GpsFix {
            self.fix.lock().unwrap().clone()
        }
    }

    struct Fixture {
        manager: Arc<CaptureManager<RealClocks>>,
        db: Arc<Database<RealClocks>>,
        gps: Arc<StubGps>,
        road: Arc<Mutex<MockDriver>>,
        interior: Arc<Mutex<MockDriver>>,
        geocode: Arc<GeocodeDb<RealClocks>>,
        _tmp: tempfile::TempDir,
    }

    fn priority_landmark(id: &str, lat: f64, lon: f64) -> Landmark {
        Landmark {
            id: id.to_owned(),
            name: format!("priority {id}"),
            lat,
            lon,
            radius_m: Some(600.0),
            category: "viewpoint".to_owned(),
        }
    }

    fn fixture(landmarks: Vec<Landmark>, clip_ms: u64) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let clocks = RealClocks {};
        let paths = Paths::resolve(Some(tmp.path().join("data"))).unwrap();
        let db = Arc::new(Database::open_in_memory(clocks).unwrap());
        let gps = Arc::new(StubGps::default());
        let geocode = Arc::new(GeocodeDb::open_in_memory(clocks).unwrap());
        let index = Arc::new(LandmarkIndex::new(clocks, landmarks));
        let road = Arc::new(Mutex::new(MockDriver::new(CameraKind::Road)));
        let interior = Arc::new(Mutex::new(MockDriver::new(CameraKind::Interior)));
        let cameras: Vec<CameraHandle> = vec![
            (CameraKind::Road, road.clone() as _),
            (CameraKind::Interior, interior.clone() as _),
        ];
        let recorder = Recorder::new(
            clocks,
            paths.clone(),
            cameras.clone(),
            RecorderOptions {
                clip_duration: Duration::from_millis(clip_ms),
                frame_interval: Duration::from_millis(2),
            },
        );
        let manager = Arc::new(CaptureManager::new(
            clocks,
            paths,
            db.clone(),
            gps.clone() as _,
            index,
            Some(geocode.clone()),
            cameras,
            recorder,
            CaptureOptions {
                gps_log_interval: Duration::from_millis(10),
                landmark_check_interval: Duration::from_millis(15),
                loop_granularity: Duration::from_millis(5),
            },
        ));
        Fixture {
            manager,
            db,
            gps,
            road,
            interior,
            geocode,
            _tmp: tmp,
        }
    }

    #[test]
    fn short_trip_one_clip() {
        let f = fixture(Vec::new(), 10_000);
        f.gps.set(40.0, -3.7);
        f.manager.start_recording().unwrap();
        assert!(f.manager.is_recording());
        let trip_id = f.manager.current_trip().unwrap();
        assert_eq!(f.db.get_active_trip().unwrap().unwrap().id, trip_id);
        std::thread::sleep(Duration::from_millis(80));
        let clips = f.manager.stop_recording().unwrap();

        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].sequence_num, 1);
        let stored = f.db.trip_clips(trip_id).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(f.db.get_active_trip().unwrap().is_none());
        let trip = f.db.get_trip(trip_id).unwrap().unwrap();
        assert!(trip.end_time.is_some());
        assert_eq!(trip.start_lat, Some(40.0));
        // GPS rows were logged on the way.
        assert!(!f.db.gps_track(trip_id).unwrap().is_empty());
    }

    #[test]
    fn clip_roll_persists_both_clips() {
        let f = fixture(Vec::new(), 80);
        f.gps.set(40.0, -3.7);
        f.manager.start_recording().unwrap();
        let trip_id = f.manager.current_trip().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let clips = f.manager.stop_recording().unwrap();

        assert!(clips.len() >= 2, "expected a roll, got {}", clips.len());
        let stored = f.db.trip_clips(trip_id).unwrap();
        assert_eq!(stored.len(), clips.len());
        let seqs: Vec<i32> = stored.iter().filter_map(|c| c.sequence_num).collect();
        let expect: Vec<i32> = (1..=clips.len() as i32).collect();
        assert_eq!(seqs, expect);
        // The trip's aggregate file list covers both cameras of every clip.
        let trip = f.db.get_trip(trip_id).unwrap().unwrap();
        assert_eq!(trip.video_files.len(), 2 * clips.len());
    }

    #[test]
    fn priority_landmark_upgrades_quality_and_rolls() {
        let f = fixture(vec![priority_landmark("lm1", 40.0, -3.7)], 60_000);
        f.gps.set(40.0, -3.7);
        f.manager.start_recording().unwrap();
        let trip_id = f.manager.current_trip().unwrap();
        assert_eq!(f.manager.current_quality(), Quality::Normal);

        let lm = priority_landmark("lm1", 40.0, -3.7);
        f.manager.handle_landmark_approach(&lm, 400.0);
        assert_eq!(f.manager.current_quality(), Quality::High);
        std::thread::sleep(Duration::from_millis(50));
        let clips = f.manager.stop_recording().unwrap();

        // The quality change rolled the clip: NQ first, HQ after.
        assert_eq!(clips.len(), 2);
        assert_eq!(clips[0].quality, Quality::Normal);
        assert_eq!(clips[1].quality, Quality::High);
        let ups = f.db.trip_quality_upgrades(trip_id).unwrap();
        assert_eq!(ups.len(), 1);
        assert_eq!(ups[0].landmark_id.as_deref(), Some("lm1"));
        assert_eq!(ups[0].reason.as_deref(), Some("priority_landmark_approach"));

        // A second approach at high quality does not upgrade again.
        let f2 = fixture(Vec::new(), 60_000);
        f2.gps.set(40.0, -3.7);
        f2.manager.start_recording().unwrap();
        f2.manager.set_recording_quality(Quality::High);
        std::thread::sleep(Duration::from_millis(20));
        f2.manager.handle_landmark_approach(&lm, 400.0);
        let trip2 = f2.manager.current_trip().unwrap();
        f2.manager.stop_recording().unwrap();
        assert!(f2.db.trip_quality_upgrades(trip2).unwrap().is_empty());
    }

    #[test]
    fn encounter_recorded_once_per_cooldown() {
        let f = fixture(Vec::new(), 60_000);
        f.gps.set(40.0, -3.7);
        f.manager.start_recording().unwrap();
        let trip_id = f.manager.current_trip().unwrap();
        let lm = priority_landmark("lm9", 40.0, -3.7);
        f.manager.handle_landmark_approach(&lm, 150.0);
        f.manager.handle_landmark_approach(&lm, 120.0);
        f.manager.stop_recording().unwrap();
        let encounters = f.db.trip_encounters(trip_id).unwrap();
        assert_eq!(encounters.len(), 1, "cooldown must gate the second row");
        assert!(encounters[0].is_priority_landmark);
    }

    #[test]
    fn close_approach_auto_starts_and_marks_clip() {
        let f = fixture(Vec::new(), 60_000);
        f.gps.set(40.0, -3.7);
        assert!(!f.manager.is_recording());
        let lm = priority_landmark("lm5", 40.0, -3.7);
        f.manager.handle_landmark_approach(&lm, 80.0);
        assert!(f.manager.is_recording(), "must auto-start inside 100 m");
        std::thread::sleep(Duration::from_millis(30));
        let clips = f.manager.stop_recording().unwrap();
        assert_eq!(clips[0].marked_landmark.as_deref(), Some("lm5"));
    }

    #[test]
    fn preview_failures_trigger_reset_at_threshold() {
        let f = fixture(Vec::new(), 60_000);
        let initial_resets = f.road.lock().unwrap().resets();
        f.road.lock().unwrap().state.lock().unwrap().fail_captures = 5;
        for _ in 0..4 {
            assert!(f.manager.get_preview_frame(CameraKind::Road).is_none());
        }
        assert_eq!(f.road.lock().unwrap().resets(), initial_resets);
        // The fifth consecutive failure crosses the threshold.
        assert!(f.manager.get_preview_frame(CameraKind::Road).is_none());
        assert_eq!(f.road.lock().unwrap().resets(), initial_resets + 1);
        // After the reset, frames flow again and the counter is clear.
        assert!(f.manager.get_preview_frame(CameraKind::Road).is_some());
        // Interior camera was untouched.
        assert_eq!(f.interior.lock().unwrap().resets(), 0);
    }

    #[test]
    fn enrichment_attaches_gps_landmark_and_location() {
        let f = fixture(vec![priority_landmark("lmx", 40.0, -3.7)], 60_000);
        f.geocode
            .store(&GeocodeRecord {
                lat: 40.0,
                lon: -3.7,
                display_name: Some("Plaza Mayor, Madrid".to_owned()),
                city: Some("Madrid".to_owned()),
                country_code: Some("es".to_owned()),
                ..GeocodeRecord::default()
            })
            .unwrap();
        f.gps.set(40.0, -3.7);
        f.manager.start_recording().unwrap();
        let trip_id = f.manager.current_trip().unwrap();
        // Let the logger write some rows inside the clip window.
        std::thread::sleep(Duration::from_millis(80));
        f.manager.stop_recording().unwrap();

        let stored = f.db.trip_clips(trip_id).unwrap();
        assert_eq!(stored.len(), 1);
        let clip = &stored[0];
        assert_eq!(clip.start_lat, Some(40.0));
        assert_eq!(clip.end_lon, Some(-3.7));
        assert!(clip.near_landmark);
        assert_eq!(clip.landmark_id.as_deref(), Some("lmx"));
        assert_eq!(clip.landmark_type.as_deref(), Some("viewpoint"));
        let location: serde_json::Value =
            serde_json::from_str(clip.location.as_ref().unwrap()).unwrap();
        assert_eq!(location["city"], "Madrid");
        assert_eq!(location["country_code"], "es");
        // Clip file paths are stored relative to the data dir.
        assert!(clip
            .road_video_file
            .as_ref()
            .unwrap()
            .starts_with("videos/"));
        // Without ffmpeg in the test environment, sidecars were written.
        // (With ffmpeg present the tags are in the container instead.)
    }

    #[test]
    fn no_fix_means_no_gps_rows() {
        let f = fixture(Vec::new(), 60_000);
        f.gps.clear();
        f.manager.start_recording().unwrap();
        let trip_id = f.manager.current_trip().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        f.manager.stop_recording().unwrap();
        assert!(f.db.gps_track(trip_id).unwrap().is_empty());
    }

    #[test]
    fn orphan_trip_recovered_at_startup() {
        let f = fixture(Vec::new(), 60_000);
        let orphan = f.db.start_trip(Some(1.0), Some(2.0), None).unwrap();
        f.manager.recover_orphan_trip().unwrap();
        assert!(f.db.get_active_trip().unwrap().is_none());
        assert!(f.db.get_trip(orphan).unwrap().unwrap().end_time.is_some());
        // A fresh recording can start afterwards.
        f.manager.start_recording().unwrap();
        f.manager.stop_recording().unwrap();
    }

    #[test]
    fn initialize_reports_camera_errors() {
        let f = fixture(Vec::new(), 60_000);
        let errors = f.manager.initialize();
        assert!(errors.is_empty());
    }

    #[test]
    fn apply_settings_changes_quality() {
        let f = fixture(Vec::new(), 60_000);
        let mut map = serde_json::Map::new();
        map.insert("recording_quality".into(), serde_json::json!("high"));
        f.manager.apply_settings(&map);
        assert_eq!(f.manager.current_quality(), Quality::High);
    }
}
