// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

pub mod db;
pub mod geocode;
#[cfg(test)]
mod testutil;
pub mod upgrade;

pub use crate::db::{
    Clip, ClipInsert, Database, Encounter, EncounterInsert, ExternalVideo, ExternalVideoInsert,
    GpsPoint, GpsSample, GpsStatistics, Quality, QualityUpgrade, Trip, TripDetails, UpgradeInsert,
};
pub use crate::geocode::{GeocodeDb, GeocodeRecord};
