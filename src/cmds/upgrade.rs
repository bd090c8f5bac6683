// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Subcommand to upgrade the trip store schema in place.

use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;

/// Upgrades the trip store to the current schema version. Forward-only;
/// take a backup first.
#[derive(Bpaf, Debug)]
#[bpaf(command("upgrade"))]
pub struct Args {
    /// Directory holding recordings, databases, and settings.
    #[bpaf(external(crate::parse_data_dir))]
    data_dir: Option<PathBuf>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let paths = crate::config::Paths::resolve(args.data_dir)?;
    let mut conn = super::open_raw_conn(paths.db_path(), false)?;
    db::upgrade::run(&mut conn)?;
    Ok(0)
}
