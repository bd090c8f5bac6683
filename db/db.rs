// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Trip store: the sole durable state of the recorder.
//!
//! Trips, GPS tracks, landmark encounters, video clips, quality upgrades,
//! and out-of-band external videos live in one SQLite database (see
//! `schema.sql`). All access goes through [`Database`], which serializes
//! writes, runs every operation in a transactional scope, and retries
//! transient lock contention with exponential backoff before surfacing
//! `StorageBusy`. Corruption is surfaced as `StorageFatal` and is not
//! retried; the process is expected to abort.
//!
//! Timestamps are stored as integer microseconds since the Unix epoch so
//! that index order matches chronological order.

use base::clock::{Clocks, RealClocks, TimerGuard};
use base::geo;
use base::{err, Error, ErrorKind};
use jiff::civil;
use jiff::Timestamp;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

/// Expected schema version; see `upgrade/`.
pub const EXPECTED_VERSION: i32 = 2;

/// SQLite busy timeout. Lock waits longer than this fail the statement.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Total attempts for a write that keeps hitting `StorageBusy`.
const WRITE_ATTEMPTS: u32 = 3;

const INSERT_GPS_SQL: &str = r#"
    insert into gps_coordinates (trip_id,  timestamp,  latitude,  longitude,  altitude,
                                 speed,  heading,  satellites,  fix_quality)
                         values (:trip_id, :timestamp, :latitude, :longitude, :altitude,
                                 :speed, :heading, :satellites, :fix_quality)
"#;

const INSERT_CLIP_SQL: &str = r#"
    insert into video_clips (trip_id,  start_time,  end_time,  start_lat,  start_lon,
                             end_lat,  end_lon,  sequence_num,  quality,
                             road_video_file,  interior_video_file,
                             near_landmark,  landmark_id,  landmark_type,  location)
                     values (:trip_id, :start_time, :end_time, :start_lat, :start_lon,
                             :end_lat, :end_lon, :sequence_num, :quality,
                             :road_video_file, :interior_video_file,
                             :near_landmark, :landmark_id, :landmark_type, :location)
"#;

const TRIP_COLUMNS: &str = r#"
    id, start_time, end_time, start_lat, start_lon, end_lat, end_lon,
    distance_km, video_files, planned_trip_id
"#;

pub(crate) fn ts_to_micros(ts: Timestamp) -> i64 {
    ts.as_microsecond()
}

pub(crate) fn micros_to_ts(micros: i64) -> Timestamp {
    Timestamp::from_microsecond(micros).expect("stored timestamps are in range")
}

/// Maps a rusqlite error onto the storage error taxonomy.
pub(crate) fn sql(e: rusqlite::Error) -> Error {
    let kind = match &e {
        rusqlite::Error::SqliteFailure(f, _) => match f.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorKind::StorageBusy,
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => ErrorKind::StorageFatal,
            ErrorCode::DiskFull | ErrorCode::CannotOpen | ErrorCode::SystemIoFailure => {
                ErrorKind::StorageFatal
            }
            _ => ErrorKind::Internal,
        },
        _ => ErrorKind::Internal,
    };
    Error::new(kind).source(e)
}

/// Recording quality of a clip. Selects encoder bitrate/resolution and the
/// `HQ`/`NQ` component of clip filenames.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Normal,
    High,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Normal => "normal",
            Quality::High => "high",
        }
    }

    pub fn file_suffix(self) -> &'static str {
        match self {
            Quality::Normal => "NQ",
            Quality::High => "HQ",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Quality::Normal),
            "high" => Some(Quality::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Trip {
    pub id: i64,
    pub start_time: Timestamp,
    /// `None` iff the trip is still active.
    pub end_time: Option<Timestamp>,
    pub start_lat: Option<f64>,
    pub start_lon: Option<f64>,
    pub end_lat: Option<f64>,
    pub end_lon: Option<f64>,
    pub distance_km: Option<f64>,
    pub video_files: Vec<String>,
    pub planned_trip_id: Option<String>,
}

/// One GPS fix to append to a trip's track.
#[derive(Clone, Debug, PartialEq)]
pub struct GpsSample {
    pub timestamp: Timestamp,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    /// meters/second, non-negative.
    pub speed: Option<f64>,
    /// degrees, `[0, 360)`.
    pub heading: Option<f64>,
    pub satellites: Option<u32>,
    /// NMEA fix quality, `0..=8`. `0` is invalid and never logged.
    pub fix_quality: u8,
}

impl GpsSample {
    fn validate(&self) -> Result<(), Error> {
        if !geo::valid_coords(self.latitude, self.longitude) {
            return Err(err!(
                InvalidArgument,
                msg(
                    "coordinates out of range: ({}, {})",
                    self.latitude,
                    self.longitude
                )
            ));
        }
        if self.speed.is_some_and(|s| s < 0.0) {
            return Err(err!(InvalidArgument, msg("negative speed")));
        }
        if self.heading.is_some_and(|h| !(0.0..360.0).contains(&h)) {
            return Err(err!(InvalidArgument, msg("heading out of [0, 360)")));
        }
        if self.fix_quality > 8 {
            return Err(err!(
                InvalidArgument,
                msg("fix_quality {} out of 0..=8", self.fix_quality)
            ));
        }
        Ok(())
    }
}

/// A stored GPS row.
#[derive(Clone, Debug, PartialEq)]
pub struct GpsPoint {
    pub id: i64,
    pub trip_id: Option<i64>,
    pub timestamp: Timestamp,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub satellites: Option<u32>,
    pub fix_quality: Option<u8>,
}

#[derive(Clone, Debug)]
pub struct EncounterInsert {
    pub landmark_id: String,
    pub landmark_name: String,
    pub lat: f64,
    pub lon: f64,
    pub landmark_type: String,
    pub is_priority_landmark: bool,
}

#[derive(Clone, Debug)]
pub struct Encounter {
    pub id: i64,
    pub trip_id: i64,
    pub landmark_id: Option<String>,
    pub landmark_name: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub encounter_time: Timestamp,
    pub landmark_type: String,
    pub is_priority_landmark: bool,
}

/// A clip row to insert, as produced by the capture manager's enrichment.
#[derive(Clone, Debug, Default)]
pub struct ClipInsert {
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    pub sequence_num: i32,
    pub quality: Option<Quality>,
    pub road_video_file: Option<String>,
    pub interior_video_file: Option<String>,
    pub start_lat: Option<f64>,
    pub start_lon: Option<f64>,
    pub end_lat: Option<f64>,
    pub end_lon: Option<f64>,
    pub near_landmark: bool,
    pub landmark_id: Option<String>,
    pub landmark_type: Option<String>,
    /// Reverse-geocoded names, stored as a JSON blob.
    pub location: Option<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct Clip {
    pub id: i64,
    pub trip_id: Option<i64>,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub sequence_num: Option<i32>,
    pub quality: Option<Quality>,
    pub road_video_file: Option<String>,
    pub interior_video_file: Option<String>,
    pub start_lat: Option<f64>,
    pub start_lon: Option<f64>,
    pub end_lat: Option<f64>,
    pub end_lon: Option<f64>,
    pub near_landmark: bool,
    pub landmark_id: Option<String>,
    pub landmark_type: Option<String>,
    pub location: Option<String>,
}

#[derive(Clone, Debug)]
pub struct UpgradeInsert {
    pub landmark_id: Option<String>,
    pub landmark_name: Option<String>,
    pub distance_meters: f64,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct QualityUpgrade {
    pub id: i64,
    pub trip_id: i64,
    pub timestamp: Timestamp,
    pub landmark_id: Option<String>,
    pub landmark_name: Option<String>,
    pub distance_meters: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ExternalVideoInsert {
    pub date: Option<Timestamp>,
    pub file_path: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub source: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ExternalVideo {
    pub id: i64,
    pub date: Option<Timestamp>,
    pub file_path: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub upload_time: Timestamp,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GpsStatistics {
    pub point_count: i64,
    pub avg_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub distance_km: f64,
}

#[derive(Clone, Debug)]
pub struct TripDetails {
    pub trip: Trip,
    pub gps_points: Vec<GpsPoint>,
    pub encounters: Vec<Encounter>,
    pub clips: Vec<Clip>,
    pub upgrades: Vec<QualityUpgrade>,
}

/// Applies the integrity pragmas used on every open.
pub fn set_integrity_pragmas(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(
        r#"
        pragma foreign_keys = on;
        pragma fullfsync = on;
        pragma synchronous = normal;
        "#,
    )
    .map_err(sql)
}

/// Initializes a fresh database at the expected schema version.
pub fn init(conn: &mut Connection) -> Result<(), Error> {
    set_integrity_pragmas(conn)?;
    let _ = conn.query_row("pragma journal_mode = wal", params![], |row| {
        row.get::<_, String>(0)
    });
    let tx = conn.transaction().map_err(sql)?;
    tx.execute_batch(include_str!("schema.sql")).map_err(sql)?;
    tx.execute(
        "insert into version (id, unix_time, notes) values (?1, ?2, ?3)",
        params![
            EXPECTED_VERSION,
            Timestamp::now().as_second(),
            concat!("created by dashcam-db ", env!("CARGO_PKG_VERSION")),
        ],
    )
    .map_err(sql)?;
    tx.commit().map_err(sql)?;
    Ok(())
}

/// Returns the schema version, or `None` for an empty database.
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>, Error> {
    let has_version: bool = conn
        .query_row(
            "select count(*) from sqlite_master where name = 'version'",
            params![],
            |row| row.get::<_, i64>(0).map(|n| n > 0),
        )
        .map_err(sql)?;
    if !has_version {
        return Ok(None);
    }
    conn.query_row("select max(id) from version", params![], |row| {
        row.get::<_, Option<i32>>(0)
    })
    .map_err(sql)
}

/// The trip store handle. Cheap to share behind an `Arc`.
pub struct Database<C: Clocks + Clone = RealClocks> {
    conn: Mutex<Connection>,
    clocks: C,
}

impl<C: Clocks + Clone> Database<C> {
    /// Wraps an open connection, verifying the schema version.
    pub fn new(clocks: C, conn: Connection) -> Result<Self, Error> {
        set_integrity_pragmas(&conn)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(sql)?;
        match get_schema_version(&conn)? {
            None => {
                return Err(err!(
                    FailedPrecondition,
                    msg("empty database; run `dashcam init`")
                ))
            }
            Some(v) if v < EXPECTED_VERSION => {
                return Err(err!(
                    InvalidArgument,
                    msg(
                        "database at schema version {v}, expected {EXPECTED_VERSION}; \
                         run `dashcam upgrade`"
                    )
                ))
            }
            Some(v) if v > EXPECTED_VERSION => {
                return Err(err!(
                    InvalidArgument,
                    msg("database at schema version {v}, later than expected {EXPECTED_VERSION}")
                ))
            }
            Some(_) => {}
        }
        Ok(Database {
            conn: Mutex::new(conn),
            clocks,
        })
    }

    /// Opens the database at `path`, creating it if `create` is set.
    pub fn open(clocks: C, path: &Path, create: bool) -> Result<Self, Error> {
        let mut flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let exists = path.exists();
        if create {
            flags |= rusqlite::OpenFlags::SQLITE_OPEN_CREATE;
        }
        info!(
            path = %path.display(),
            sqlite = rusqlite::version(),
            "opening trip store"
        );
        let mut conn = Connection::open_with_flags(path, flags).map_err(sql)?;
        if create && !exists {
            init(&mut conn)?;
        }
        Self::new(clocks, conn)
    }

    /// Opens a fresh in-memory database. For tests.
    pub fn open_in_memory(clocks: C) -> Result<Self, Error> {
        let mut conn = Connection::open_in_memory().map_err(sql)?;
        init(&mut conn)?;
        Self::new(clocks, conn)
    }

    pub fn clocks(&self) -> &C {
        &self.clocks
    }

    /// The transactional scope: runs `f` inside an immediate transaction,
    /// committing on `Ok` and rolling back on `Err`. Retries `StorageBusy`
    /// with exponential backoff up to [`WRITE_ATTEMPTS`] total attempts.
    /// `StorageFatal` is logged and surfaced without retry.
    fn transact<T>(
        &self,
        op: &'static str,
        mut f: impl FnMut(&rusqlite::Transaction) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let _t = TimerGuard::new(&self.clocks, || op);
        let mut attempt = 0;
        loop {
            let r = {
                let mut conn = self.conn.lock().unwrap();
                conn.transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(sql)
                    .and_then(|tx| {
                        let t = f(&tx)?;
                        tx.commit().map_err(sql)?;
                        Ok(t)
                    })
            };
            match r {
                Err(e) if e.kind() == ErrorKind::StorageBusy && attempt + 1 < WRITE_ATTEMPTS => {
                    attempt += 1;
                    let backoff = Duration::from_millis(100 << attempt);
                    warn!(op, attempt, "lock contention; retrying in {backoff:?}");
                    self.clocks.sleep(backoff);
                }
                Err(e) if e.kind() == ErrorKind::StorageFatal => {
                    error!(op, err = %e.chain(), "fatal storage error");
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// Read-only access, outside any explicit transaction.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, Error>) -> Result<T, Error> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Creates a trip with `end_time = null`. Fails with `AlreadyExists` if
    /// another trip is still active.
    pub fn start_trip(
        &self,
        start_lat: Option<f64>,
        start_lon: Option<f64>,
        planned_trip_id: Option<&str>,
    ) -> Result<i64, Error> {
        if let (Some(lat), Some(lon)) = (start_lat, start_lon) {
            if !geo::valid_coords(lat, lon) {
                return Err(err!(InvalidArgument, msg("invalid start coordinates")));
            }
        }
        let now = ts_to_micros(self.clocks.realtime());
        self.transact("start_trip", |tx| {
            let active: Option<i64> = tx
                .query_row(
                    "select id from trips where end_time is null",
                    params![],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql)?;
            if let Some(id) = active {
                return Err(err!(AlreadyExists, msg("trip {id} is still active")));
            }
            tx.execute(
                r#"
                insert into trips (start_time, start_lat, start_lon, video_files, planned_trip_id)
                           values (?1, ?2, ?3, '[]', ?4)
                "#,
                params![now, start_lat, start_lon, planned_trip_id],
            )
            .map_err(sql)?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Ends a trip, filling in end coordinates and the track distance.
    /// Ending an already-ended trip is a no-op success.
    pub fn end_trip(
        &self,
        trip_id: i64,
        end_lat: Option<f64>,
        end_lon: Option<f64>,
    ) -> Result<bool, Error> {
        let now = ts_to_micros(self.clocks.realtime());
        self.transact("end_trip", |tx| {
            let end: Option<Option<i64>> = tx
                .query_row(
                    "select end_time from trips where id = ?1",
                    params![trip_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql)?;
            match end {
                None => return Err(err!(NotFound, msg("no trip with id {trip_id}"))),
                Some(Some(_)) => return Ok(true), // already ended
                Some(None) => {}
            }
            let distance_km = track_distance_km(tx, trip_id)?;
            tx.execute(
                r#"
                update trips
                   set end_time = ?2,
                       end_lat = coalesce(?3, end_lat),
                       end_lon = coalesce(?4, end_lon),
                       distance_km = ?5
                 where id = ?1
                "#,
                params![trip_id, now, end_lat, end_lon, distance_km],
            )
            .map_err(sql)?;
            Ok(true)
        })
    }

    /// Finalizes a trip left active by a prior run. The recovered `end_time`
    /// is `start_time` plus the database age, capped at 24 hours. Returns the
    /// recovered trip id, if any.
    pub fn recover_orphan_trip(&self) -> Result<Option<i64>, Error> {
        let now = self.clocks.realtime();
        self.transact("recover_orphan_trip", |tx| {
            let row: Option<(i64, i64)> = tx
                .query_row(
                    "select id, start_time from trips where end_time is null",
                    params![],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql)?;
            let Some((id, start_micros)) = row else {
                return Ok(None);
            };
            let start = micros_to_ts(start_micros);
            let age = now.duration_since(start).max(jiff::SignedDuration::ZERO);
            let capped = age.min(jiff::SignedDuration::from_hours(24));
            let end = ts_to_micros(start + capped);
            let distance_km = track_distance_km(tx, id)?;
            tx.execute(
                "update trips set end_time = ?2, distance_km = ?3 where id = ?1",
                params![id, end, distance_km],
            )
            .map_err(sql)?;
            Ok(Some(id))
        })
    }

    pub fn update_trip_location(
        &self,
        trip_id: i64,
        lat: f64,
        lon: f64,
        is_start: bool,
    ) -> Result<bool, Error> {
        if !geo::valid_coords(lat, lon) {
            return Err(err!(InvalidArgument, msg("invalid coordinates")));
        }
        self.transact("update_trip_location", |tx| {
            let n = if is_start {
                tx.execute(
                    "update trips set start_lat = ?2, start_lon = ?3 where id = ?1",
                    params![trip_id, lat, lon],
                )
            } else {
                tx.execute(
                    "update trips set end_lat = ?2, end_lon = ?3 where id = ?1",
                    params![trip_id, lat, lon],
                )
            }
            .map_err(sql)?;
            Ok(n > 0)
        })
    }

    /// Appends a GPS row to a trip's track.
    pub fn log_gps(&self, trip_id: Option<i64>, sample: &GpsSample) -> Result<i64, Error> {
        sample.validate()?;
        self.transact("log_gps", |tx| {
            tx.execute(
                INSERT_GPS_SQL,
                rusqlite::named_params! {
                    ":trip_id": trip_id,
                    ":timestamp": ts_to_micros(sample.timestamp),
                    ":latitude": sample.latitude,
                    ":longitude": sample.longitude,
                    ":altitude": sample.altitude,
                    ":speed": sample.speed,
                    ":heading": sample.heading,
                    ":satellites": sample.satellites,
                    ":fix_quality": sample.fix_quality,
                },
            )
            .map_err(sql)?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn add_landmark_encounter(
        &self,
        trip_id: i64,
        enc: &EncounterInsert,
    ) -> Result<i64, Error> {
        let now = ts_to_micros(self.clocks.realtime());
        self.transact("add_landmark_encounter", |tx| {
            tx.execute(
                r#"
                insert into landmark_encounters
                    (trip_id, landmark_id, landmark_name, lat, lon, encounter_time,
                     landmark_type, is_priority_landmark)
                    values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    trip_id,
                    enc.landmark_id,
                    enc.landmark_name,
                    enc.lat,
                    enc.lon,
                    now,
                    enc.landmark_type,
                    enc.is_priority_landmark,
                ],
            )
            .map_err(sql)?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Inserts a clip row and, in the same transaction, appends its files to
    /// the owning trip's aggregate `video_files` list.
    pub fn record_clip(&self, trip_id: i64, clip: &ClipInsert) -> Result<i64, Error> {
        let start = clip
            .start_time
            .ok_or_else(|| err!(InvalidArgument, msg("clip without start_time")))?;
        let end = clip
            .end_time
            .ok_or_else(|| err!(InvalidArgument, msg("clip without end_time")))?;
        if end <= start {
            return Err(err!(InvalidArgument, msg("clip end_time <= start_time")));
        }
        if clip.sequence_num < 1 {
            return Err(err!(
                InvalidArgument,
                msg("clip sequence_num {} < 1", clip.sequence_num)
            ));
        }
        self.transact("record_clip", |tx| {
            tx.execute(
                INSERT_CLIP_SQL,
                rusqlite::named_params! {
                    ":trip_id": trip_id,
                    ":start_time": ts_to_micros(start),
                    ":end_time": ts_to_micros(end),
                    ":start_lat": clip.start_lat,
                    ":start_lon": clip.start_lon,
                    ":end_lat": clip.end_lat,
                    ":end_lon": clip.end_lon,
                    ":sequence_num": clip.sequence_num,
                    ":quality": clip.quality.map(Quality::as_str),
                    ":road_video_file": clip.road_video_file,
                    ":interior_video_file": clip.interior_video_file,
                    ":near_landmark": clip.near_landmark,
                    ":landmark_id": clip.landmark_id,
                    ":landmark_type": clip.landmark_type,
                    ":location": clip.location.as_ref().map(|v| v.to_string()),
                },
            )
            .map_err(sql)?;
            let clip_id = tx.last_insert_rowid();

            let files: Option<String> = tx
                .query_row(
                    "select video_files from trips where id = ?1",
                    params![trip_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql)?
                .flatten();
            let mut list: Vec<String> = files
                .as_deref()
                .and_then(|f| serde_json::from_str(f).ok())
                .unwrap_or_default();
            for f in [&clip.road_video_file, &clip.interior_video_file]
                .into_iter()
                .flatten()
            {
                if !list.contains(f) {
                    list.push(f.clone());
                }
            }
            tx.execute(
                "update trips set video_files = ?2 where id = ?1",
                params![trip_id, serde_json::to_string(&list).unwrap()],
            )
            .map_err(sql)?;
            Ok(clip_id)
        })
    }

    pub fn log_quality_upgrade(&self, trip_id: i64, up: &UpgradeInsert) -> Result<i64, Error> {
        let now = ts_to_micros(self.clocks.realtime());
        self.transact("log_quality_upgrade", |tx| {
            tx.execute(
                r#"
                insert into quality_upgrades
                    (trip_id, timestamp, landmark_id, landmark_name, distance_meters, reason)
                    values (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    trip_id,
                    now,
                    up.landmark_id,
                    up.landmark_name,
                    up.distance_meters,
                    up.reason,
                ],
            )
            .map_err(sql)?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn get_active_trip(&self) -> Result<Option<Trip>, Error> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("select {TRIP_COLUMNS} from trips where end_time is null"),
                params![],
                trip_from_row,
            )
            .optional()
            .map_err(sql)
        })
    }

    pub fn get_trip(&self, trip_id: i64) -> Result<Option<Trip>, Error> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("select {TRIP_COLUMNS} from trips where id = ?1"),
                params![trip_id],
                trip_from_row,
            )
            .optional()
            .map_err(sql)
        })
    }

    /// Returns the trip joined with all its child collections.
    pub fn get_trip_with_details(&self, trip_id: i64) -> Result<Option<TripDetails>, Error> {
        let Some(trip) = self.get_trip(trip_id)? else {
            return Ok(None);
        };
        Ok(Some(TripDetails {
            gps_points: self.gps_track(trip_id)?,
            encounters: self.trip_encounters(trip_id)?,
            clips: self.trip_clips(trip_id)?,
            upgrades: self.trip_quality_upgrades(trip_id)?,
            trip,
        }))
    }

    /// Most recent trips first.
    pub fn get_all_trips(&self, limit: Option<usize>) -> Result<Vec<Trip>, Error> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "select {TRIP_COLUMNS} from trips order by start_time desc limit ?1"
                ))
                .map_err(sql)?;
            let limit = limit.map(|l| l as i64).unwrap_or(-1);
            let rows = stmt
                .query_map(params![limit], trip_from_row)
                .map_err(sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql)?;
            Ok(rows)
        })
    }

    /// Trips whose `start_time` falls in `[start, end)`.
    pub fn get_trips_between(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Trip>, Error> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "select {TRIP_COLUMNS} from trips \
                     where start_time >= ?1 and start_time < ?2 order by start_time"
                ))
                .map_err(sql)?;
            let rows = stmt
                .query_map(
                    params![ts_to_micros(start), ts_to_micros(end)],
                    trip_from_row,
                )
                .map_err(sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql)?;
            Ok(rows)
        })
    }

    pub fn get_trips_by_planned_trip_id(&self, planned: &str) -> Result<Vec<Trip>, Error> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "select {TRIP_COLUMNS} from trips \
                     where planned_trip_id = ?1 order by start_time"
                ))
                .map_err(sql)?;
            let rows = stmt
                .query_map(params![planned], trip_from_row)
                .map_err(sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql)?;
            Ok(rows)
        })
    }

    /// Returns `day-of-month → trip count` for the given UTC month.
    pub fn get_calendar(&self, year: i16, month: i8) -> Result<BTreeMap<u8, u32>, Error> {
        let first = civil::date(year, month, 1)
            .in_tz("UTC")
            .map_err(|e| err!(InvalidArgument, source(e), msg("bad year/month")))?;
        let next = first
            .checked_add(jiff::Span::new().months(1))
            .map_err(|e| err!(InvalidArgument, source(e)))?;
        let trips = self.get_trips_between(first.timestamp(), next.timestamp())?;
        let mut days: BTreeMap<u8, u32> = BTreeMap::new();
        for t in trips {
            let day = t.start_time.to_zoned(jiff::tz::TimeZone::UTC).day() as u8;
            *days.entry(day).or_default() += 1;
        }
        Ok(days)
    }

    /// A trip's full GPS track, in timestamp order.
    pub fn gps_track(&self, trip_id: i64) -> Result<Vec<GpsPoint>, Error> {
        self.gps_query(
            "where trip_id = ?1 order by timestamp, id",
            params![trip_id],
        )
    }

    /// GPS rows of a trip within `[start, end)`, in timestamp order.
    pub fn gps_in_range(
        &self,
        trip_id: i64,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<GpsPoint>, Error> {
        self.gps_query(
            "where trip_id = ?1 and timestamp >= ?2 and timestamp < ?3 order by timestamp, id",
            params![trip_id, ts_to_micros(start), ts_to_micros(end)],
        )
    }

    fn gps_query(
        &self,
        tail: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<GpsPoint>, Error> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "select id, trip_id, timestamp, latitude, longitude, altitude, speed, \
                     heading, satellites, fix_quality from gps_coordinates {tail}"
                ))
                .map_err(sql)?;
            let rows = stmt
                .query_map(params, |row| {
                    Ok(GpsPoint {
                        id: row.get(0)?,
                        trip_id: row.get(1)?,
                        timestamp: micros_to_ts(row.get(2)?),
                        latitude: row.get(3)?,
                        longitude: row.get(4)?,
                        altitude: row.get(5)?,
                        speed: row.get(6)?,
                        heading: row.get(7)?,
                        satellites: row.get(8)?,
                        fix_quality: row.get(9)?,
                    })
                })
                .map_err(sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql)?;
            Ok(rows)
        })
    }

    pub fn gps_statistics(&self, trip_id: i64) -> Result<GpsStatistics, Error> {
        let track = self.gps_track(trip_id)?;
        let speeds: Vec<f64> = track.iter().filter_map(|p| p.speed).collect();
        let distance_km = track
            .windows(2)
            .map(|w| geo::haversine_km(w[0].latitude, w[0].longitude, w[1].latitude, w[1].longitude))
            .sum();
        Ok(GpsStatistics {
            point_count: track.len() as i64,
            avg_speed: (!speeds.is_empty())
                .then(|| speeds.iter().sum::<f64>() / speeds.len() as f64),
            max_speed: speeds.iter().copied().fold(None, |m: Option<f64>, s| {
                Some(m.map_or(s, |m| m.max(s)))
            }),
            distance_km,
        })
    }

    /// Deletes GPS rows strictly older than `cutoff`; returns the count.
    pub fn cleanup_gps_before(&self, cutoff: Timestamp) -> Result<usize, Error> {
        self.transact("cleanup_gps_before", |tx| {
            tx.execute(
                "delete from gps_coordinates where timestamp < ?1",
                params![ts_to_micros(cutoff)],
            )
            .map_err(sql)
        })
    }

    pub fn trip_encounters(&self, trip_id: i64) -> Result<Vec<Encounter>, Error> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "select id, trip_id, landmark_id, landmark_name, lat, lon, encounter_time, \
                     landmark_type, is_priority_landmark from landmark_encounters \
                     where trip_id = ?1 order by encounter_time",
                )
                .map_err(sql)?;
            let rows = stmt
                .query_map(params![trip_id], |row| {
                    Ok(Encounter {
                        id: row.get(0)?,
                        trip_id: row.get(1)?,
                        landmark_id: row.get(2)?,
                        landmark_name: row.get(3)?,
                        lat: row.get(4)?,
                        lon: row.get(5)?,
                        encounter_time: micros_to_ts(row.get(6)?),
                        landmark_type: row.get(7)?,
                        is_priority_landmark: row.get(8)?,
                    })
                })
                .map_err(sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql)?;
            Ok(rows)
        })
    }

    pub fn trip_clips(&self, trip_id: i64) -> Result<Vec<Clip>, Error> {
        self.clip_query("where trip_id = ?1 order by sequence_num", params![trip_id])
    }

    /// Clips whose `end_time` is strictly older than `cutoff`. Used by the
    /// disk manager's retention sweep.
    pub fn clips_older_than(&self, cutoff: Timestamp) -> Result<Vec<Clip>, Error> {
        self.clip_query(
            "where end_time < ?1 order by end_time",
            params![ts_to_micros(cutoff)],
        )
    }

    fn clip_query(&self, tail: &str, params: impl rusqlite::Params) -> Result<Vec<Clip>, Error> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "select id, trip_id, start_time, end_time, start_lat, start_lon, end_lat, \
                     end_lon, sequence_num, quality, road_video_file, interior_video_file, \
                     near_landmark, landmark_id, landmark_type, location from video_clips {tail}"
                ))
                .map_err(sql)?;
            let rows = stmt
                .query_map(params, |row| {
                    Ok(Clip {
                        id: row.get(0)?,
                        trip_id: row.get(1)?,
                        start_time: micros_to_ts(row.get(2)?),
                        end_time: micros_to_ts(row.get(3)?),
                        start_lat: row.get(4)?,
                        start_lon: row.get(5)?,
                        end_lat: row.get(6)?,
                        end_lon: row.get(7)?,
                        sequence_num: row.get(8)?,
                        quality: row
                            .get::<_, Option<String>>(9)?
                            .as_deref()
                            .and_then(Quality::parse),
                        road_video_file: row.get(10)?,
                        interior_video_file: row.get(11)?,
                        near_landmark: row.get(12)?,
                        landmark_id: row.get(13)?,
                        landmark_type: row.get(14)?,
                        location: row.get(15)?,
                    })
                })
                .map_err(sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql)?;
            Ok(rows)
        })
    }

    /// Deletes one clip row. Returns false if it didn't exist.
    pub fn delete_clip(&self, clip_id: i64) -> Result<bool, Error> {
        self.transact("delete_clip", |tx| {
            let n = tx
                .execute("delete from video_clips where id = ?1", params![clip_id])
                .map_err(sql)?;
            Ok(n > 0)
        })
    }

    pub fn trip_quality_upgrades(&self, trip_id: i64) -> Result<Vec<QualityUpgrade>, Error> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "select id, trip_id, timestamp, landmark_id, landmark_name, \
                     distance_meters, reason from quality_upgrades \
                     where trip_id = ?1 order by timestamp",
                )
                .map_err(sql)?;
            let rows = stmt
                .query_map(params![trip_id], |row| {
                    Ok(QualityUpgrade {
                        id: row.get(0)?,
                        trip_id: row.get(1)?,
                        timestamp: micros_to_ts(row.get(2)?),
                        landmark_id: row.get(3)?,
                        landmark_name: row.get(4)?,
                        distance_meters: row.get(5)?,
                        reason: row.get(6)?,
                    })
                })
                .map_err(sql)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql)?;
            Ok(rows)
        })
    }

    pub fn add_external_video(&self, video: &ExternalVideoInsert) -> Result<i64, Error> {
        let now = ts_to_micros(self.clocks.realtime());
        self.transact("add_external_video", |tx| {
            tx.execute(
                r#"
                insert into external_videos (date, file_path, lat, lon, source, tags, upload_time)
                                     values (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    video.date.map(ts_to_micros),
                    video.file_path,
                    video.lat,
                    video.lon,
                    video.source,
                    serde_json::to_string(&video.tags).unwrap(),
                    now,
                ],
            )
            .map_err(sql)?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn get_external_video(&self, id: i64) -> Result<Option<ExternalVideo>, Error> {
        self.with_conn(|conn| {
            conn.query_row(
                "select id, date, file_path, lat, lon, source, tags, upload_time \
                 from external_videos where id = ?1",
                params![id],
                |row| {
                    Ok(ExternalVideo {
                        id: row.get(0)?,
                        date: row.get::<_, Option<i64>>(1)?.map(micros_to_ts),
                        file_path: row.get(2)?,
                        lat: row.get(3)?,
                        lon: row.get(4)?,
                        source: row.get(5)?,
                        tags: row
                            .get::<_, Option<String>>(6)?
                            .as_deref()
                            .and_then(|t| serde_json::from_str(t).ok())
                            .unwrap_or_default(),
                        upload_time: micros_to_ts(row.get(7)?),
                    })
                },
            )
            .optional()
            .map_err(sql)
        })
    }
}

fn trip_from_row(row: &rusqlite::Row) -> Result<Trip, rusqlite::Error> {
    Ok(Trip {
        id: row.get(0)?,
        start_time: micros_to_ts(row.get(1)?),
        end_time: row.get::<_, Option<i64>>(2)?.map(micros_to_ts),
        start_lat: row.get(3)?,
        start_lon: row.get(4)?,
        end_lat: row.get(5)?,
        end_lon: row.get(6)?,
        distance_km: row.get(7)?,
        video_files: row
            .get::<_, Option<String>>(8)?
            .as_deref()
            .and_then(|f| serde_json::from_str(f).ok())
            .unwrap_or_default(),
        planned_trip_id: row.get(9)?,
    })
}

/// Sum of Haversine segment lengths over a trip's stored track.
fn track_distance_km(tx: &rusqlite::Transaction, trip_id: i64) -> Result<f64, Error> {
    let mut stmt = tx
        .prepare(
            "select latitude, longitude from gps_coordinates \
             where trip_id = ?1 order by timestamp, id",
        )
        .map_err(sql)?;
    let points = stmt
        .query_map(params![trip_id], |row| {
            Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?))
        })
        .map_err(sql)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql)?;
    Ok(points
        .windows(2)
        .map(|w| geo::haversine_km(w[0].0, w[0].1, w[1].0, w[1].1))
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestDb;
    use std::time::Duration as StdDuration;

    #[test]
    fn trip_round_trip() {
        let t = TestDb::new();
        let id = t.db.start_trip(Some(40.0), Some(-3.7), None).unwrap();
        t.clocks.sleep(StdDuration::from_secs(120));
        assert!(t.db.end_trip(id, Some(40.1), Some(-3.6)).unwrap());
        let trip = t.db.get_trip(id).unwrap().unwrap();
        let end = trip.end_time.expect("trip must be ended");
        assert!(trip.start_time <= end);
        assert_eq!(trip.start_lat, Some(40.0));
        assert_eq!(trip.end_lon, Some(-3.6));
    }

    #[test]
    fn end_trip_is_idempotent() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        assert!(t.db.end_trip(id, Some(1.0), Some(2.0)).unwrap());
        let first = t.db.get_trip(id).unwrap().unwrap();
        t.clocks.sleep(StdDuration::from_secs(60));
        assert!(t.db.end_trip(id, Some(9.0), Some(9.0)).unwrap());
        let second = t.db.get_trip(id).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn end_trip_missing_is_not_found() {
        let t = TestDb::new();
        let e = t.db.end_trip(999, None, None).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn at_most_one_active_trip() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        let e = t.db.start_trip(None, None, None).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);
        t.db.end_trip(id, None, None).unwrap();
        t.db.start_trip(None, None, None).unwrap();
    }

    #[test]
    fn active_trip_none_after_stop() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        assert_eq!(t.db.get_active_trip().unwrap().unwrap().id, id);
        t.db.end_trip(id, None, None).unwrap();
        assert!(t.db.get_active_trip().unwrap().is_none());
    }

    #[test]
    fn gps_rows_keep_insertion_order() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        for i in 0..10 {
            let mut s = t.sample(40.0 + i as f64 * 0.001, -3.7);
            s.timestamp = t.db.clocks().realtime();
            t.db.log_gps(Some(id), &s).unwrap();
            t.clocks.sleep(StdDuration::from_secs(2));
        }
        let track = t.db.gps_track(id).unwrap();
        assert_eq!(track.len(), 10);
        for w in track.windows(2) {
            assert!(w[0].timestamp <= w[1].timestamp);
        }
    }

    #[test]
    fn gps_validation() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        let mut s = t.sample(91.0, 0.0);
        assert_eq!(
            t.db.log_gps(Some(id), &s).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        s.latitude = 40.0;
        s.heading = Some(360.0);
        assert_eq!(
            t.db.log_gps(Some(id), &s).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        s.heading = Some(359.9);
        s.fix_quality = 9;
        assert_eq!(
            t.db.log_gps(Some(id), &s).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        s.fix_quality = 1;
        t.db.log_gps(Some(id), &s).unwrap();
    }

    #[test]
    fn gps_in_range_is_half_open() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        let t0 = t.db.clocks().realtime();
        for _ in 0..5 {
            t.db.log_gps(Some(id), &t.sample(40.0, -3.7)).unwrap();
            t.clocks.sleep(StdDuration::from_secs(10));
        }
        // Rows at t0, t0+10, ..., t0+40. [t0+10, t0+30) must return exactly 2.
        let rows =
            t.db.gps_in_range(
                id,
                t0 + jiff::SignedDuration::from_secs(10),
                t0 + jiff::SignedDuration::from_secs(30),
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn end_trip_computes_distance() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        // Two points one degree of latitude apart: ~111 km.
        t.db.log_gps(Some(id), &t.sample(40.0, -3.7)).unwrap();
        t.clocks.sleep(StdDuration::from_secs(2));
        t.db.log_gps(Some(id), &t.sample(41.0, -3.7)).unwrap();
        t.db.end_trip(id, None, None).unwrap();
        let d = t.db.get_trip(id).unwrap().unwrap().distance_km.unwrap();
        assert!((d - 111.2).abs() < 1.0, "got {d}");
    }

    #[test]
    fn record_clip_updates_video_files() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        let t0 = t.db.clocks().realtime();
        let clip = ClipInsert {
            start_time: Some(t0),
            end_time: Some(t0 + jiff::SignedDuration::from_secs(60)),
            sequence_num: 1,
            quality: Some(Quality::Normal),
            road_video_file: Some("videos/2024-05-01/09-00-00_seq001_NQ_road.mp4".into()),
            interior_video_file: Some("videos/2024-05-01/09-00-00_seq001_NQ_interior.mp4".into()),
            ..Default::default()
        };
        t.db.record_clip(id, &clip).unwrap();
        let trip = t.db.get_trip(id).unwrap().unwrap();
        assert_eq!(trip.video_files.len(), 2);
        assert!(trip.video_files[0].ends_with("road.mp4"));
        let clips = t.db.trip_clips(id).unwrap();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].sequence_num, Some(1));
        assert_eq!(clips[0].quality, Some(Quality::Normal));
    }

    #[test]
    fn record_clip_validates() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        let t0 = t.db.clocks().realtime();
        let mut clip = ClipInsert {
            start_time: Some(t0),
            end_time: Some(t0),
            sequence_num: 1,
            ..Default::default()
        };
        assert_eq!(
            t.db.record_clip(id, &clip).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        clip.end_time = Some(t0 + jiff::SignedDuration::from_secs(1));
        clip.sequence_num = 0;
        assert_eq!(
            t.db.record_clip(id, &clip).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn clip_sequence_nums_are_consecutive() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        let t0 = t.db.clocks().realtime();
        for seq in 1..=4 {
            let offset = jiff::SignedDuration::from_secs((seq as i64 - 1) * 60);
            t.db.record_clip(
                id,
                &ClipInsert {
                    start_time: Some(t0 + offset),
                    end_time: Some(t0 + offset + jiff::SignedDuration::from_secs(60)),
                    sequence_num: seq,
                    ..Default::default()
                },
            )
            .unwrap();
        }
        let clips = t.db.trip_clips(id).unwrap();
        let seqs: Vec<i32> = clips.iter().filter_map(|c| c.sequence_num).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        // Intervals are pairwise disjoint.
        for w in clips.windows(2) {
            assert!(w[0].end_time <= w[1].start_time);
        }
    }

    #[test]
    fn calendar_counts_trips_per_day() {
        let t = TestDb::new();
        // Clock starts 1970-01-01. Two trips on the 1st, one on the 3rd.
        for _ in 0..2 {
            let id = t.db.start_trip(None, None, None).unwrap();
            t.clocks.sleep(StdDuration::from_secs(60));
            t.db.end_trip(id, None, None).unwrap();
        }
        t.clocks.sleep(StdDuration::from_secs(2 * 86_400));
        let id = t.db.start_trip(None, None, None).unwrap();
        t.db.end_trip(id, None, None).unwrap();

        let cal = t.db.get_calendar(1970, 1).unwrap();
        assert_eq!(cal.get(&1), Some(&2));
        assert_eq!(cal.get(&3), Some(&1));
        assert_eq!(cal.get(&2), None);
        assert!(t.db.get_calendar(1970, 2).unwrap().is_empty());
    }

    #[test]
    fn cleanup_gps_before_deletes_strictly_older() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        for _ in 0..5 {
            t.db.log_gps(Some(id), &t.sample(40.0, -3.7)).unwrap();
            t.clocks.sleep(StdDuration::from_secs(10));
        }
        // Rows at t0..t0+40; cutoff at t0+20 must delete exactly the first 2.
        let cutoff = Timestamp::UNIX_EPOCH + jiff::SignedDuration::from_secs(20);
        assert_eq!(t.db.cleanup_gps_before(cutoff).unwrap(), 2);
        assert_eq!(t.db.gps_track(id).unwrap().len(), 3);
        assert_eq!(t.db.cleanup_gps_before(cutoff).unwrap(), 0);
    }

    #[test]
    fn orphan_trip_recovery_caps_at_24h() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        // Simulate a crash: 3 days pass with the trip still open.
        t.clocks.sleep(StdDuration::from_secs(3 * 86_400));
        assert_eq!(t.db.recover_orphan_trip().unwrap(), Some(id));
        let trip = t.db.get_trip(id).unwrap().unwrap();
        let dur = trip.end_time.unwrap().duration_since(trip.start_time);
        assert_eq!(dur, jiff::SignedDuration::from_hours(24));
        // Nothing left to recover.
        assert_eq!(t.db.recover_orphan_trip().unwrap(), None);
    }

    #[test]
    fn quality_upgrades_append() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        t.db.log_quality_upgrade(
            id,
            &UpgradeInsert {
                landmark_id: Some("lm1".into()),
                landmark_name: Some("Alhambra".into()),
                distance_meters: 420.0,
                reason: "priority_landmark_approach".into(),
            },
        )
        .unwrap();
        let ups = t.db.trip_quality_upgrades(id).unwrap();
        assert_eq!(ups.len(), 1);
        assert_eq!(ups[0].landmark_name.as_deref(), Some("Alhambra"));
    }

    #[test]
    fn trip_details_joins_children() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        t.db.log_gps(Some(id), &t.sample(40.0, -3.7)).unwrap();
        t.db.add_landmark_encounter(
            id,
            &EncounterInsert {
                landmark_id: "lm1".into(),
                landmark_name: "Mirador".into(),
                lat: 40.0,
                lon: -3.7,
                landmark_type: "viewpoint".into(),
                is_priority_landmark: true,
            },
        )
        .unwrap();
        let t0 = t.db.clocks().realtime();
        t.db.record_clip(
            id,
            &ClipInsert {
                start_time: Some(t0),
                end_time: Some(t0 + jiff::SignedDuration::from_secs(5)),
                sequence_num: 1,
                ..Default::default()
            },
        )
        .unwrap();
        let details = t.db.get_trip_with_details(id).unwrap().unwrap();
        assert_eq!(details.trip.id, id);
        assert_eq!(details.gps_points.len(), 1);
        assert_eq!(details.encounters.len(), 1);
        assert!(details.encounters[0].is_priority_landmark);
        assert_eq!(details.clips.len(), 1);
        assert!(details.upgrades.is_empty());
        assert!(t.db.get_trip_with_details(id + 1).unwrap().is_none());
    }

    #[test]
    fn external_video_round_trip() {
        let t = TestDb::new();
        let id =
            t.db.add_external_video(&ExternalVideoInsert {
                date: Some(t.db.clocks().realtime()),
                file_path: "uploads/insta.mp4".into(),
                lat: Some(40.0),
                lon: Some(-3.7),
                source: Some("insta360".into()),
                tags: vec!["vacation".into(), "mountains".into()],
            })
            .unwrap();
        let v = t.db.get_external_video(id).unwrap().unwrap();
        assert_eq!(v.file_path.as_deref(), Some("uploads/insta.mp4"));
        assert_eq!(v.tags, vec!["vacation", "mountains"]);
        assert!(t.db.get_external_video(id + 1).unwrap().is_none());
    }

    #[test]
    fn gps_statistics() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        for (i, speed) in [5.0, 15.0, 10.0].iter().enumerate() {
            let mut s = t.sample(40.0 + i as f64, -3.7);
            s.speed = Some(*speed);
            t.db.log_gps(Some(id), &s).unwrap();
            t.clocks.sleep(StdDuration::from_secs(2));
        }
        let stats = t.db.gps_statistics(id).unwrap();
        assert_eq!(stats.point_count, 3);
        assert_eq!(stats.max_speed, Some(15.0));
        assert_eq!(stats.avg_speed, Some(10.0));
        assert!(stats.distance_km > 200.0);
    }

    #[test]
    fn clips_older_than_and_delete() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, None).unwrap();
        let t0 = t.db.clocks().realtime();
        for seq in 1..=3 {
            let offset = jiff::SignedDuration::from_secs((seq as i64 - 1) * 60);
            t.db.record_clip(
                id,
                &ClipInsert {
                    start_time: Some(t0 + offset),
                    end_time: Some(t0 + offset + jiff::SignedDuration::from_secs(60)),
                    sequence_num: seq,
                    ..Default::default()
                },
            )
            .unwrap();
        }
        let cutoff = t0 + jiff::SignedDuration::from_secs(130);
        let old = t.db.clips_older_than(cutoff).unwrap();
        assert_eq!(old.len(), 2);
        for c in &old {
            assert!(t.db.delete_clip(c.id).unwrap());
        }
        assert_eq!(t.db.trip_clips(id).unwrap().len(), 1);
        assert!(!t.db.delete_clip(old[0].id).unwrap());
    }

    #[test]
    fn trips_by_planned_id() {
        let t = TestDb::new();
        let id = t.db.start_trip(None, None, Some("route-7")).unwrap();
        t.db.end_trip(id, None, None).unwrap();
        let id2 = t.db.start_trip(None, None, None).unwrap();
        t.db.end_trip(id2, None, None).unwrap();
        let found = t.db.get_trips_by_planned_trip_id("route-7").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
    }
}

