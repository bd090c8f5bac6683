// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

use base::clock::RealClocks;
use base::{err, Error};
use std::path::Path;
use tracing::info;

pub mod init;
pub mod run;
pub mod upgrade;

/// Opens the trip store database file directly (for init/upgrade); the
/// running server goes through [`db::Database`] instead.
fn open_raw_conn(db_path: &Path, create: bool) -> Result<rusqlite::Connection, Error> {
    let mut flags =
        rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX;
    if create {
        flags |= rusqlite::OpenFlags::SQLITE_OPEN_CREATE;
    }
    info!(
        path = %db_path.display(),
        sqlite = rusqlite::version(),
        "opening database"
    );
    rusqlite::Connection::open_with_flags(db_path, flags).map_err(|e| {
        err!(
            StorageFatal,
            source(e),
            msg("unable to open {}", db_path.display())
        )
    })
}

/// Opens (creating if needed) the trip store for the server.
fn open_database(paths: &crate::config::Paths) -> Result<db::Database<RealClocks>, Error> {
    let create = !paths.db_path().exists();
    if create {
        let mut conn = open_raw_conn(paths.db_path(), true)?;
        db::db::init(&mut conn)?;
    }
    db::Database::open(RealClocks {}, paths.db_path(), false)
}
