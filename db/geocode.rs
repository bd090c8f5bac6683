// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Offline reverse-geocoding store (`geocoding_offline.db`).
//!
//! The geodata downloader enriches this database ahead of a trip so that
//! location names resolve without connectivity. Records are deduplicated on
//! `(lat, lon, trip_id)`: re-downloading a circle replaces rather than
//! duplicates.

use base::clock::{Clocks, RealClocks};
use base::{err, geo, Error};
use jiff::Timestamp;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use crate::db::{micros_to_ts, sql, ts_to_micros};

const SCHEMA: &str = r#"
    create table if not exists detailed_geocoding (
      id integer primary key autoincrement,
      lat real not null,
      lon real not null,
      trip_id text,
      location_type text,
      place_id integer,
      osm_type text,
      osm_id integer,
      name text,
      display_name text,
      road text,
      house_number text,
      neighbourhood text,
      suburb text,
      village text,
      town text,
      city text,
      county text,
      state text,
      postcode text,
      country text,
      country_code text,
      boundingbox_south real,
      boundingbox_north real,
      boundingbox_west real,
      boundingbox_east real,
      source text,
      raw_response text,
      created_at integer not null,
      unique (lat, lon, trip_id) on conflict replace
    );
    create index if not exists detailed_geocoding_pos on detailed_geocoding (lat, lon);
"#;

/// One enriched reverse-geocoding record, flattened from a Nominatim
/// response plus its raw JSON.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeocodeRecord {
    pub lat: f64,
    pub lon: f64,
    pub trip_id: Option<String>,
    /// `center_waypoint` or `grid_point`.
    pub location_type: Option<String>,
    pub place_id: Option<i64>,
    pub osm_type: Option<String>,
    pub osm_id: Option<i64>,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub road: Option<String>,
    pub house_number: Option<String>,
    pub neighbourhood: Option<String>,
    pub suburb: Option<String>,
    pub village: Option<String>,
    pub town: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub bbox: Option<[f64; 4]>,
    pub source: Option<String>,
    pub raw_response: Option<String>,
}

impl GeocodeRecord {
    /// Flattens a raw Nominatim reverse response.
    pub fn from_nominatim(
        lat: f64,
        lon: f64,
        trip_id: Option<&str>,
        location_type: &str,
        response: &serde_json::Value,
    ) -> Self {
        let addr = &response["address"];
        let s = |v: &serde_json::Value| v.as_str().map(str::to_owned);
        let bbox = response["boundingbox"].as_array().and_then(|b| {
            let f = |i: usize| b.get(i)?.as_str()?.parse::<f64>().ok();
            Some([f(0)?, f(1)?, f(2)?, f(3)?])
        });
        GeocodeRecord {
            lat,
            lon,
            trip_id: trip_id.map(str::to_owned),
            location_type: Some(location_type.to_owned()),
            place_id: response["place_id"].as_i64(),
            osm_type: s(&response["osm_type"]),
            osm_id: response["osm_id"].as_i64(),
            name: s(&response["name"]),
            display_name: s(&response["display_name"]),
            road: s(&addr["road"]),
            house_number: s(&addr["house_number"]),
            neighbourhood: s(&addr["neighbourhood"]),
            suburb: s(&addr["suburb"]),
            village: s(&addr["village"]),
            town: s(&addr["town"]),
            city: s(&addr["city"]),
            county: s(&addr["county"]),
            state: s(&addr["state"]),
            postcode: s(&addr["postcode"]),
            country: s(&addr["country"]),
            country_code: s(&addr["country_code"]),
            bbox,
            source: Some("nominatim_online".to_owned()),
            raw_response: Some(response.to_string()),
        }
    }
}

/// Handle to the offline geocoding database.
pub struct GeocodeDb<C: Clocks + Clone = RealClocks> {
    conn: Mutex<Connection>,
    clocks: C,
}

impl<C: Clocks + Clone> GeocodeDb<C> {
    pub fn open(clocks: C, path: &Path) -> Result<Self, Error> {
        info!(path = %path.display(), "opening offline geocoding store");
        let conn = Connection::open(path).map_err(sql)?;
        Self::new(clocks, conn)
    }

    pub fn open_in_memory(clocks: C) -> Result<Self, Error> {
        Self::new(clocks, Connection::open_in_memory().map_err(sql)?)
    }

    fn new(clocks: C, conn: Connection) -> Result<Self, Error> {
        conn.execute_batch(SCHEMA).map_err(sql)?;
        Ok(GeocodeDb {
            conn: Mutex::new(conn),
            clocks,
        })
    }

    /// Stores a record, replacing any existing `(lat, lon, trip_id)` entry.
    pub fn store(&self, rec: &GeocodeRecord) -> Result<(), Error> {
        if !geo::valid_coords(rec.lat, rec.lon) {
            return Err(err!(InvalidArgument, msg("invalid record coordinates")));
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            insert or replace into detailed_geocoding
                (lat, lon, trip_id, location_type, place_id, osm_type, osm_id, name,
                 display_name, road, house_number, neighbourhood, suburb, village, town,
                 city, county, state, postcode, country, country_code,
                 boundingbox_south, boundingbox_north, boundingbox_west, boundingbox_east,
                 source, raw_response, created_at)
                values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                        ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)
            "#,
            params![
                rec.lat,
                rec.lon,
                rec.trip_id,
                rec.location_type,
                rec.place_id,
                rec.osm_type,
                rec.osm_id,
                rec.name,
                rec.display_name,
                rec.road,
                rec.house_number,
                rec.neighbourhood,
                rec.suburb,
                rec.village,
                rec.town,
                rec.city,
                rec.county,
                rec.state,
                rec.postcode,
                rec.country,
                rec.country_code,
                rec.bbox.map(|b| b[0]),
                rec.bbox.map(|b| b[1]),
                rec.bbox.map(|b| b[2]),
                rec.bbox.map(|b| b[3]),
                rec.source,
                rec.raw_response,
                ts_to_micros(self.clocks.realtime()),
            ],
        )
        .map_err(sql)?;
        Ok(())
    }

    pub fn record_count(&self) -> Result<i64, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "select count(*) from detailed_geocoding",
            params![],
            |row| row.get(0),
        )
        .map_err(sql)
    }

    /// Number of records stored for one trip.
    pub fn trip_record_count(&self, trip_id: &str) -> Result<i64, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "select count(*) from detailed_geocoding where trip_id = ?1",
            params![trip_id],
            |row| row.get(0),
        )
        .map_err(sql)
    }

    /// Finds the stored record closest to `(lat, lon)` within ~`radius_km`,
    /// for offline reverse lookups.
    pub fn lookup(&self, lat: f64, lon: f64, radius_km: f64) -> Result<Option<GeocodeRecord>, Error> {
        let radius_deg = radius_km / 111.0;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "select lat, lon, trip_id, location_type, display_name, road, village, town, \
                 city, county, state, postcode, country, country_code, raw_response, created_at \
                 from detailed_geocoding \
                 where lat between ?1 - ?3 and ?1 + ?3 \
                   and lon between ?2 - ?3 and ?2 + ?3",
            )
            .map_err(sql)?;
        let rows = stmt
            .query_map(params![lat, lon, radius_deg], |row| {
                Ok(GeocodeRecord {
                    lat: row.get(0)?,
                    lon: row.get(1)?,
                    trip_id: row.get(2)?,
                    location_type: row.get(3)?,
                    display_name: row.get(4)?,
                    road: row.get(5)?,
                    village: row.get(6)?,
                    town: row.get(7)?,
                    city: row.get(8)?,
                    county: row.get(9)?,
                    state: row.get(10)?,
                    postcode: row.get(11)?,
                    country: row.get(12)?,
                    country_code: row.get(13)?,
                    raw_response: row.get(14)?,
                    ..Default::default()
                })
            })
            .map_err(sql)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql)?;
        Ok(rows.into_iter().min_by(|a, b| {
            let da = geo::haversine_m(lat, lon, a.lat, a.lon);
            let db = geo::haversine_m(lat, lon, b.lat, b.lon);
            da.partial_cmp(&db).unwrap()
        }))
    }

    /// Most recent `created_at`, if any. Used for status reporting.
    pub fn last_update(&self) -> Result<Option<Timestamp>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "select max(created_at) from detailed_geocoding",
            params![],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()
        .map_err(sql)
        .map(|v| v.flatten().map(micros_to_ts))
    }
}
