// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Subcommand to create the data directory and databases.

use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

/// Initializes the data directory, trip store, and offline geocoding
/// database. Running `init` on an existing installation is a no-op.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    /// Directory holding recordings, databases, and settings.
    #[bpaf(external(crate::parse_data_dir))]
    data_dir: Option<PathBuf>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let paths = crate::config::Paths::resolve(args.data_dir)?;
    if paths.db_path().exists() {
        info!(path = %paths.db_path().display(), "trip store already exists");
    } else {
        let mut conn = super::open_raw_conn(paths.db_path(), true)?;
        db::db::init(&mut conn)?;
        info!(path = %paths.db_path().display(), "trip store created");
    }
    db::GeocodeDb::open(RealClocks {}, paths.geocoding_db_path())?;
    paths.videos_dir()?;
    paths.thumbnails_dir()?;
    paths.offline_maps_dir()?;
    info!(data = %paths.data().display(), "initialized");
    Ok(0)
}
