// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Upgrades the trip store schema.
//!
//! Migration is forward-only: each step adds what later code expects (new
//! columns via `alter table`) and never rewrites or drops user data.

use crate::db;
use base::{err, Error};
use rusqlite::params;
use tracing::info;

mod v1_to_v2;

const UPGRADE_NOTES: &str = concat!("upgraded using dashcam-db ", env!("CARGO_PKG_VERSION"));

fn set_journal_mode(conn: &rusqlite::Connection, requested: &str) -> Result<(), Error> {
    assert!(!requested.contains(';')); // quick check for accidental sql injection.
    let actual = conn
        .query_row(
            &format!("pragma journal_mode = {requested}"),
            params![],
            |row| row.get::<_, String>(0),
        )
        .map_err(db::sql)?;
    info!("database now in journal_mode {actual} (requested {requested})");
    Ok(())
}

fn upgrade(target_ver: i32, conn: &mut rusqlite::Connection) -> Result<(), Error> {
    // Upgrader `i` moves version `i + 1` to `i + 2`.
    let upgraders = [v1_to_v2::run];
    assert_eq!(upgraders.len() as i32, db::EXPECTED_VERSION - 1);

    let old_ver = match db::get_schema_version(conn)? {
        None => return Err(err!(FailedPrecondition, msg("empty database; run init"))),
        Some(v) => v,
    };
    if old_ver > db::EXPECTED_VERSION {
        return Err(err!(
            InvalidArgument,
            msg("database at version {old_ver}, later than expected {}", db::EXPECTED_VERSION)
        ));
    }
    if old_ver < 1 {
        return Err(err!(InvalidArgument, msg("database at version {old_ver}?")));
    }
    info!("upgrading database from version {old_ver} to version {target_ver}");
    for ver in old_ver..target_ver {
        info!("...from version {ver} to version {}", ver + 1);
        let tx = conn.transaction().map_err(db::sql)?;
        upgraders[(ver - 1) as usize](&tx)?;
        tx.execute(
            r#"
            insert into version (id, unix_time, notes)
                         values (?1, cast(strftime('%s', 'now') as integer), ?2)
            "#,
            params![ver + 1, UPGRADE_NOTES],
        )
        .map_err(db::sql)?;
        tx.commit().map_err(db::sql)?;
    }
    Ok(())
}

pub fn run(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    db::set_integrity_pragmas(conn)?;
    set_journal_mode(conn, "delete")?;
    upgrade(db::EXPECTED_VERSION, conn)?;
    set_journal_mode(conn, "wal")?;
    info!("...done");
    Ok(())
}
