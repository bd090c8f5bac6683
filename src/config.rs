// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Storage locations and the persisted storage settings file.
//!
//! Everything lives under one data directory:
//!
//! ```text
//! data/
//!   recordings.db           trip store
//!   geocoding_offline.db    offline reverse geocoding
//!   storage_settings.json   disk manager config
//!   landmarks.json          landmark index source
//!   videos/YYYY-MM-DD/      clips
//!   thumbnails/
//!   offline_maps/
//! ```
//!
//! `DASHCAM_DATA_PATH`, `DASHCAM_DB_PATH`, and `DASHCAM_SETTINGS_PATH`
//! override the resolved locations.

use base::{err, Error, ErrorKind, ResultExt as _};
use std::path::{Path, PathBuf};

pub const DEFAULT_DATA_DIR: &str = "/var/lib/dashcam/data";

/// Resolved absolute locations under the data directory.
#[derive(Clone, Debug)]
pub struct Paths {
    data: PathBuf,
    db_path: PathBuf,
    geocoding_db_path: PathBuf,
    settings_path: PathBuf,
    landmarks_path: PathBuf,
}

fn absolute(p: PathBuf) -> Result<PathBuf, Error> {
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().err_kind(ErrorKind::Internal)?;
    Ok(cwd.join(p))
}

impl Paths {
    /// Resolves all locations, applying environment overrides. Creates the
    /// data directory; subdirectories are created lazily.
    pub fn resolve(data_dir: Option<PathBuf>) -> Result<Self, Error> {
        let data = std::env::var_os("DASHCAM_DATA_PATH")
            .map(PathBuf::from)
            .or(data_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let data = absolute(data)?;
        std::fs::create_dir_all(&data).map_err(|e| {
            err!(
                StorageFatal,
                source(e),
                msg("unable to create data dir {}", data.display())
            )
        })?;
        let db_path = std::env::var_os("DASHCAM_DB_PATH")
            .map(PathBuf::from)
            .map(absolute)
            .transpose()?
            .unwrap_or_else(|| data.join("recordings.db"));
        let settings_path = std::env::var_os("DASHCAM_SETTINGS_PATH")
            .map(PathBuf::from)
            .map(absolute)
            .transpose()?
            .unwrap_or_else(|| data.join("storage_settings.json"));
        Ok(Paths {
            geocoding_db_path: data.join("geocoding_offline.db"),
            landmarks_path: data.join("landmarks.json"),
            data,
            db_path,
            settings_path,
        })
    }

    pub fn data(&self) -> &Path {
        &self.data
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn geocoding_db_path(&self) -> &Path {
        &self.geocoding_db_path
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub fn landmarks_path(&self) -> &Path {
        &self.landmarks_path
    }

    fn subdir(&self, name: &str) -> Result<PathBuf, Error> {
        let dir = self.data.join(name);
        std::fs::create_dir_all(&dir).map_err(|e| {
            err!(
                StorageFatal,
                source(e),
                msg("unable to create {}", dir.display())
            )
        })?;
        Ok(dir)
    }

    pub fn videos_dir(&self) -> Result<PathBuf, Error> {
        self.subdir("videos")
    }

    /// The daily clip folder `videos/YYYY-MM-DD/`, created on demand.
    pub fn daily_videos_dir(&self, date: jiff::civil::Date) -> Result<PathBuf, Error> {
        self.subdir(&format!("videos/{}", date.strftime("%Y-%m-%d")))
    }

    pub fn thumbnails_dir(&self) -> Result<PathBuf, Error> {
        self.subdir("thumbnails")
    }

    pub fn offline_maps_dir(&self) -> Result<PathBuf, Error> {
        self.subdir("offline_maps")
    }

    /// Makes a path under the data dir relative to it, for storage in the
    /// trip store.
    pub fn relativize<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.data).unwrap_or(path)
    }
}

/// `storage_settings.json`, shared with the web UI.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub auto_clean_enabled: bool,
    /// Free-space percentage below which the retention sweep runs.
    pub auto_clean_threshold: u8,
    /// Clips strictly older than this many days are eligible for deletion.
    pub auto_clean_days: u32,
    pub main_drive: Option<String>,
    pub mount_point: PathBuf,
    pub auto_detect_drives: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            auto_clean_enabled: false,
            auto_clean_threshold: 90,
            auto_clean_days: 30,
            main_drive: None,
            mount_point: PathBuf::from("/mnt/dashcam_storage"),
            auto_detect_drives: true,
        }
    }
}

impl StorageSettings {
    /// Loads settings, falling back to defaults when the file is missing.
    pub fn load(path: &Path) -> Result<Self, Error> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                err!(
                    InvalidArgument,
                    source(e),
                    msg("malformed settings file {}", path.display())
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StorageSettings::default()),
            Err(e) => Err(err!(StorageFatal, source(e))),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let json = serde_json::to_vec_pretty(self).expect("settings always serialize");
        std::fs::write(path, json).map_err(|e| {
            err!(
                StorageFatal,
                source(e),
                msg("unable to write {}", path.display())
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_creates_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        let paths = Paths::resolve(Some(data.clone())).unwrap();
        assert!(data.is_dir());
        assert!(paths.db_path().is_absolute());
        assert_eq!(paths.db_path(), data.join("recordings.db"));
        assert_eq!(paths.settings_path(), data.join("storage_settings.json"));
    }

    #[test]
    fn daily_dir_is_date_stamped() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::resolve(Some(tmp.path().join("d"))).unwrap();
        let date = jiff::civil::date(2024, 5, 1);
        let dir = paths.daily_videos_dir(date).unwrap();
        assert!(dir.ends_with("videos/2024-05-01"));
        assert!(dir.is_dir());
    }

    #[test]
    fn relativize_strips_data_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::resolve(Some(tmp.path().join("d"))).unwrap();
        let abs = paths.data().join("videos/2024-05-01/a.mp4");
        assert_eq!(
            paths.relativize(&abs),
            Path::new("videos/2024-05-01/a.mp4")
        );
    }

    #[test]
    fn settings_round_trip_and_default() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("storage_settings.json");
        let missing = StorageSettings::load(&path).unwrap();
        assert_eq!(missing, StorageSettings::default());

        let mut s = StorageSettings::default();
        s.auto_clean_enabled = true;
        s.auto_clean_threshold = 85;
        s.save(&path).unwrap();
        assert_eq!(StorageSettings::load(&path).unwrap(), s);

        // Keys are camelCase on disk, as the UI expects.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("autoCleanThreshold"), "{raw}");
    }
}
