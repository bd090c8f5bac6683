// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Utilities for tests of the persistence layer.

use crate::db::{Database, GpsSample};
use base::clock::SimulatedClocks;
use jiff::Timestamp;

/// A fresh in-memory trip store on a simulated clock starting at the epoch.
pub struct TestDb {
    pub db: Database<SimulatedClocks>,
    pub clocks: SimulatedClocks,
}

impl TestDb {
    pub fn new() -> Self {
        let clocks = SimulatedClocks::new(Timestamp::UNIX_EPOCH);
        let db = Database::open_in_memory(clocks.clone()).unwrap();
        TestDb { db, clocks }
    }

    /// A valid sample at the given position, timestamped "now".
    pub fn sample(&self, lat: f64, lon: f64) -> GpsSample {
        GpsSample {
            timestamp: self.db.clocks().realtime(),
            latitude: lat,
            longitude: lon,
            altitude: Some(650.0),
            speed: Some(13.9),
            heading: Some(90.0),
            satellites: Some(9),
            fix_quality: 1,
        }
    }
}
