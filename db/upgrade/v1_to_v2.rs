// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Upgrades a version 1 schema to a version 2 schema: columns added after
//! the initial release.
//!
//! * `trips.planned_trip_id`: link to a planned route.
//! * `video_clips.location`: reverse-geocoded names, JSON.
//! * `external_videos.tags`: JSON array.

use crate::db::sql;
use base::Error;

pub fn run(tx: &rusqlite::Transaction) -> Result<(), Error> {
    tx.execute_batch(
        r#"
        alter table trips add column planned_trip_id text;
        alter table video_clips add column location text;
        alter table external_videos add column tags text;
        "#,
    )
    .map_err(sql)
}
