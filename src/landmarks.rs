// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! In-memory landmark index.
//!
//! Loaded once from a JSON source file and held read-only. The index answers
//! two queries: the closest landmark whose own radius covers a position
//! ([`LandmarkIndex::nearby`]), and all landmarks within a scan radius
//! ([`LandmarkIndex::nearby_within`]). It also owns the notify-cooldown map
//! that limits encounter notifications to one per landmark per 300 s.

use base::clock::Clocks;
use base::{err, geo, Error};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// Cooldown between notifications for the same landmark.
const NOTIFY_COOLDOWN: Duration = Duration::from_secs(300);

/// Default trigger radius when a landmark doesn't carry one.
const DEFAULT_RADIUS_M: f64 = 500.0;

/// Categories that may trigger a recording quality upgrade.
const PRIORITY_CATEGORIES: &[&str] = &[
    "tourist_attraction",
    "tourism",
    "monument",
    "museum",
    "castle",
    "viewpoint",
    "attraction",
    "trip_point",
    "manual_waypoint",
    "heritage",
    "archaeological_site",
    "historic",
];

pub fn is_priority_category(category: &str) -> bool {
    PRIORITY_CATEGORIES.contains(&category)
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
pub struct Landmark {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub radius_m: Option<f64>,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "standard".to_owned()
}

impl Landmark {
    pub fn radius_m(&self) -> f64 {
        self.radius_m.unwrap_or(DEFAULT_RADIUS_M)
    }

    pub fn is_priority(&self) -> bool {
        is_priority_category(&self.category)
    }
}

/// Result of a [`LandmarkIndex::nearby`] query.
#[derive(Clone, Debug)]
pub struct LandmarkHit {
    pub landmark: Landmark,
    pub distance_m: f64,
    /// True iff the cooldown permitted a notification for this hit. At most
    /// one hit per landmark returns `notify = true` per 300 s window.
    pub notify: bool,
}

pub struct LandmarkIndex<C: Clocks> {
    landmarks: Vec<Landmark>,
    last_notified: Mutex<HashMap<String, Duration>>,
    clocks: C,
}

impl<C: Clocks> LandmarkIndex<C> {
    pub fn new(clocks: C, mut landmarks: Vec<Landmark>) -> Self {
        // Deterministic tie-break for equidistant hits: smaller id wins.
        landmarks.sort_by(|a, b| a.id.cmp(&b.id));
        LandmarkIndex {
            landmarks,
            last_notified: Mutex::new(HashMap::new()),
            clocks,
        }
    }

    /// Loads the index from a JSON array file. A missing file yields an
    /// empty index.
    pub fn load(clocks: C, path: &Path) -> Result<Self, Error> {
        let landmarks = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                err!(
                    InvalidArgument,
                    source(e),
                    msg("malformed landmarks file {}", path.display())
                )
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no landmarks file; using empty index");
                Vec::new()
            }
            Err(e) => return Err(err!(Internal, source(e))),
        };
        info!(count = landmarks.len(), "landmark index loaded");
        Ok(Self::new(clocks, landmarks))
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    /// Returns the closest landmark whose Haversine distance is within its
    /// own radius, with the notify-cooldown evaluated for the winner.
    /// Equidistant candidates resolve to the smaller id.
    pub fn nearby(&self, lat: f64, lon: f64) -> Option<LandmarkHit> {
        if !geo::valid_coords(lat, lon) {
            return None;
        }
        let mut closest: Option<(&Landmark, f64)> = None;
        for lm in &self.landmarks {
            let d = geo::haversine_m(lat, lon, lm.lat, lm.lon);
            if d > lm.radius_m() {
                continue;
            }
            // The list is id-ordered, so strict `<` keeps the smaller id on
            // ties.
            if closest.is_none_or(|(_, best)| d < best) {
                closest = Some((lm, d));
            }
        }
        let (landmark, distance_m) = closest?;
        let notify = self.check_cooldown(&landmark.id);
        Some(LandmarkHit {
            landmark: landmark.clone(),
            distance_m,
            notify,
        })
    }

    /// All landmarks within `radius_km`, sorted ascending by distance.
    pub fn nearby_within(&self, lat: f64, lon: f64, radius_km: f64) -> Vec<(Landmark, f64)> {
        if !geo::valid_coords(lat, lon) {
            return Vec::new();
        }
        let radius_m = radius_km * 1000.0;
        let mut hits: Vec<(Landmark, f64)> = self
            .landmarks
            .iter()
            .filter_map(|lm| {
                let d = geo::haversine_m(lat, lon, lm.lat, lm.lon);
                (d <= radius_m).then(|| (lm.clone(), d))
            })
            .collect();
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        hits
    }

    /// Consumes the notify budget for `landmark_id` if available: returns
    /// true (and arms the cooldown) iff no notification has fired for this
    /// landmark in the last 300 s. Both encounter recording and audio
    /// announcements are gated on this one budget.
    pub fn notify_permitted(&self, landmark_id: &str) -> bool {
        self.check_cooldown(landmark_id)
    }

    fn check_cooldown(&self, landmark_id: &str) -> bool {
        let now = self.clocks.monotonic();
        let mut last = self.last_notified.lock().unwrap();
        match last.get(landmark_id) {
            Some(&prev) if now.saturating_sub(prev) <= NOTIFY_COOLDOWN => false,
            _ => {
                last.insert(landmark_id.to_owned(), now);
                true
            }
        }
    }
}
