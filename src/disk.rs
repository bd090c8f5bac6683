// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Disk and USB storage management.
//!
//! Enumerates block devices through sysfs, mounts/unmounts removable
//! storage (with a sudo fallback chain and ntfs-3g for NTFS), reports disk
//! usage, and enforces the retention policy: when used space crosses the
//! configured threshold, clips older than the configured age are deleted
//! together with their database rows, one transaction per clip.

use crate::config::{Paths, StorageSettings};
use base::clock::Clocks;
use base::{err, Error, ErrorKind, ResultExt as _};
use db::Database;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub name: String,
    pub device_path: PathBuf,
    pub mounted_at: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDevice {
    pub name: String,
    pub device_path: PathBuf,
    /// From the sysfs `removable` flag.
    pub removable: bool,
    pub size_bytes: u64,
    pub partitions: Vec<Partition>,
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub used_percent: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub examined: usize,
    pub deleted_clips: usize,
    pub freed_bytes: u64,
}

pub struct DiskManager<C: Clocks + Clone> {
    paths: Paths,
    db: Arc<Database<C>>,
    settings: Mutex<StorageSettings>,
    /// Overridable for tests; `/sys/block` in production.
    sysfs_block: PathBuf,
    /// Overridable for tests; `/proc/mounts` in production.
    mounts_file: PathBuf,
}

impl<C: Clocks + Clone> DiskManager<C> {
    pub fn new(paths: Paths, db: Arc<Database<C>>, settings: StorageSettings) -> Self {
        DiskManager {
            paths,
            db,
            settings: Mutex::new(settings),
            sysfs_block: PathBuf::from("/sys/block"),
            mounts_file: PathBuf::from("/proc/mounts"),
        }
    }

    #[cfg(test)]
    fn with_roots(mut self, sysfs_block: PathBuf, mounts_file: PathBuf) -> Self {
        self.sysfs_block = sysfs_block;
        self.mounts_file = mounts_file;
        self
    }

    pub fn settings(&self) -> StorageSettings {
        self.settings.lock().unwrap().clone()
    }

    /// Applies and persists new settings.
    pub fn apply_settings(&self, new: StorageSettings) -> Result<(), Error> {
        new.save(self.paths.settings_path())?;
        *self.settings.lock().unwrap() = new;
        Ok(())
    }

    /// Enumerates block devices from sysfs, marking USB/removable ones.
    pub fn list_block_devices(&self) -> Result<Vec<BlockDevice>, Error> {
        let mounts = self.read_mounts();
        let mut devices = Vec::new();
        let entries = match std::fs::read_dir(&self.sysfs_block) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(err!(Internal, source(e))),
        };
        for entry in entries {
            let entry = entry.err_kind(ErrorKind::Internal)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Skip virtual devices.
            if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
                continue;
            }
            let sys = entry.path();
            let removable = std::fs::read_to_string(sys.join("removable"))
                .map(|s| s.trim() == "1")
                .unwrap_or(false);
            let size_bytes = std::fs::read_to_string(sys.join("size"))
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|sectors| sectors * 512)
                .unwrap_or(0);
            let mut partitions = Vec::new();
            if let Ok(subs) = std::fs::read_dir(&sys) {
                for sub in subs.flatten() {
                    let pname = sub.file_name().to_string_lossy().into_owned();
                    if pname.starts_with(&name) && sub.path().join("partition").exists() {
                        let device_path = PathBuf::from(format!("/dev/{pname}"));
                        partitions.push(Partition {
                            mounted_at: mounts.get(&device_path).cloned(),
                            name: pname,
                            device_path,
                        });
                    }
                }
            }
            partitions.sort_by(|a, b| a.name.cmp(&b.name));
            devices.push(BlockDevice {
                device_path: PathBuf::from(format!("/dev/{name}")),
                name,
                removable,
                size_bytes,
                partitions,
            });
        }
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(devices)
    }

    /// Removable devices only.
    pub fn list_usb_drives(&self) -> Result<Vec<BlockDevice>, Error> {
        Ok(self
            .list_block_devices()?
            .into_iter()
            .filter(|d| d.removable)
            .collect())
    }

    fn read_mounts(&self) -> std::collections::HashMap<PathBuf, PathBuf> {
        let mut map = std::collections::HashMap::new();
        let Ok(contents) = std::fs::read_to_string(&self.mounts_file) else {
            return map;
        };
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            if let (Some(dev), Some(mountpoint)) = (fields.next(), fields.next()) {
                if dev.starts_with("/dev/") {
                    // Octal escapes (e.g. \040 for space) in mount points.
                    let decoded = mountpoint.replace("\\040", " ");
                    map.insert(PathBuf::from(dev), PathBuf::from(decoded));
                }
            }
        }
        map
    }

    /// Filesystem type via blkid.
    pub fn detect_filesystem(&self, device: &Path) -> Option<String> {
        let output = Command::new("blkid")
            .args(["-o", "value", "-s", "TYPE"])
            .arg(device)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let fs = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        (!fs.is_empty()).then_some(fs)
    }

    /// Mounts a partition: ntfs-3g for NTFS, plain mount otherwise, each
    /// with a sudo fallback.
    pub fn mount_drive(&self, device: &Path, mount_point: &Path) -> Result<(), Error> {
        std::fs::create_dir_all(mount_point).map_err(|e| {
            err!(
                Internal,
                source(e),
                msg("unable to create mount point {}", mount_point.display())
            )
        })?;
        let fs = self.detect_filesystem(device);
        let commands: Vec<Vec<String>> = match fs.as_deref() {
            Some("ntfs") => vec![
                vec!["ntfs-3g".into()],
                vec!["sudo".into(), "ntfs-3g".into()],
            ],
            _ => vec![vec!["mount".into()], vec!["sudo".into(), "mount".into()]],
        };
        for cmd in commands {
            let (program, rest) = cmd.split_first().unwrap();
            let status = Command::new(program)
                .args(rest)
                .arg(device)
                .arg(mount_point)
                .status();
            match status {
                Ok(s) if s.success() => {
                    info!(
                        device = %device.display(),
                        mount_point = %mount_point.display(),
                        ?fs,
                        "mounted"
                    );
                    return Ok(());
                }
                Ok(s) => debug!(program, status = %s, "mount attempt failed"),
                Err(e) => debug!(program, err = %e, "mount command not runnable"),
            }
        }
        Err(err!(
            Internal,
            msg("unable to mount {} at {}", device.display(), mount_point.display())
        ))
    }

    /// Unmounts; mirrors the mount fallback chain.
    pub fn unmount_drive(&self, mount_point: &Path) -> Result<(), Error> {
        for cmd in [vec!["umount"], vec!["sudo", "umount"]] {
            let (program, rest) = cmd.split_first().unwrap();
            let status = Command::new(program).args(rest).arg(mount_point).status();
            if matches!(status, Ok(s) if s.success()) {
                info!(mount_point = %mount_point.display(), "unmounted");
                return Ok(());
            }
        }
        Err(err!(
            Internal,
            msg("unable to unmount {}", mount_point.display())
        ))
    }

    /// Unmounts every mounted partition of the device, then asks udisks to
    /// power it off if available.
    pub fn safe_eject(&self, device: &BlockDevice) -> Result<(), Error> {
        for p in &device.partitions {
            if let Some(at) = &p.mounted_at {
                self.unmount_drive(at)?;
            }
        }
        let status = Command::new("udisksctl")
            .args(["power-off", "-b"])
            .arg(&device.device_path)
            .status();
        match status {
            Ok(s) if s.success() => info!(device = %device.name, "powered off"),
            _ => debug!(device = %device.name, "udisksctl unavailable; unmount-only eject"),
        }
        Ok(())
    }

    /// Usage of the filesystem holding the data directory.
    pub fn data_usage(&self) -> Result<DiskUsage, Error> {
        self.disk_usage(self.paths.data())
    }

    /// Usage of the filesystem containing `path`.
    pub fn disk_usage(&self, path: &Path) -> Result<DiskUsage, Error> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|e| err!(Internal, source(e), msg("statvfs {}", path.display())))?;
        let frag = stat.fragment_size() as u64;
        let total_bytes = stat.blocks() as u64 * frag;
        let free_bytes = stat.blocks_available() as u64 * frag;
        let used_bytes = total_bytes.saturating_sub(stat.blocks_free() as u64 * frag);
        let used_percent = if total_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / total_bytes as f64 * 100.0
        };
        Ok(DiskUsage {
            total_bytes,
            free_bytes,
            used_bytes,
            used_percent,
        })
    }

    /// Runs the retention sweep if enabled and the usage threshold is
    /// crossed.
    pub fn maybe_clean(&self) -> Result<CleanupReport, Error> {
        let settings = self.settings();
        if !settings.auto_clean_enabled {
            return Ok(CleanupReport::default());
        }
        let usage = self.data_usage()?;
        if usage.used_percent < settings.auto_clean_threshold as f64 {
            debug!(
                used_percent = usage.used_percent,
                threshold = settings.auto_clean_threshold,
                "below cleanup threshold"
            );
            return Ok(CleanupReport::default());
        }
        self.clean_older_than_days(settings.auto_clean_days)
    }

    /// Deletes every clip strictly older than `days` days: its files first,
    /// then its database row, one transaction per clip. Reports how much
    /// was freed.
    pub fn clean_older_than_days(&self, days: u32) -> Result<CleanupReport, Error> {
        let cutoff = self.db.clocks().realtime()
            - jiff::SignedDuration::from_hours(24 * i64::from(days));
        let old = self.db.clips_older_than(cutoff)?;
        let mut report = CleanupReport {
            examined: old.len(),
            ..CleanupReport::default()
        };
        for clip in &old {
            let mut freed = 0u64;
            let mut failed = false;
            for rel in [&clip.road_video_file, &clip.interior_video_file]
                .into_iter()
                .flatten()
            {
                let path = self.paths.data().join(rel);
                match std::fs::metadata(&path) {
                    Ok(m) => {
                        if let Err(e) = std::fs::remove_file(&path) {
                            warn!(path = %path.display(), err = %e, "unable to delete clip file");
                            failed = true;
                        } else {
                            freed += m.len();
                        }
                    }
                    Err(_) => debug!(path = %path.display(), "clip file already gone"),
                }
            }
            if failed {
                continue; // keep the row so a later sweep retries
            }
            if self.db.delete_clip(clip.id)? {
                report.deleted_clips += 1;
                report.freed_bytes += freed;
            }
        }
        if report.deleted_clips > 0 {
            info!(
                deleted = report.deleted_clips,
                freed_bytes = report.freed_bytes,
                "retention cleanup complete"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use db::ClipInsert;
    use jiff::Timestamp;
    use std::time::Duration;

    struct Fixture {
        manager: DiskManager<SimulatedClocks>,
        db: Arc<Database<SimulatedClocks>>,
        clocks: SimulatedClocks,
        paths: Paths,
        _tmp: tempfile::TempDir,
    }

    fn fixture(settings: StorageSettings) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let clocks = SimulatedClocks::new(Timestamp::UNIX_EPOCH);
        let paths = Paths::resolve(Some(tmp.path().join("data"))).unwrap();
        let db = Arc::new(Database::open_in_memory(clocks.clone()).unwrap());
        let manager = DiskManager::new(paths.clone(), db.clone(), settings).with_roots(
            tmp.path().join("sys_block"),
            tmp.path().join("mounts"),
        );
        Fixture {
            manager,
            db,
            clocks,
            paths,
            _tmp: tmp,
        }
    }

    fn fake_sysfs(f: &Fixture) {
        let block = f.manager.sysfs_block.clone();
        // sda: fixed disk with one partition, mounted.
        std::fs::create_dir_all(block.join("sda/sda1")).unwrap();
        std::fs::write(block.join("sda/removable"), "0\n").unwrap();
        std::fs::write(block.join("sda/size"), "976773168\n").unwrap();
        std::fs::write(block.join("sda/sda1/partition"), "1\n").unwrap();
        // sdb: removable USB stick with one partition.
        std::fs::create_dir_all(block.join("sdb/sdb1")).unwrap();
        std::fs::write(block.join("sdb/removable"), "1\n").unwrap();
        std::fs::write(block.join("sdb/size"), "60549120\n").unwrap();
        std::fs::write(block.join("sdb/sdb1/partition"), "1\n").unwrap();
        // loop devices are ignored.
        std::fs::create_dir_all(block.join("loop0")).unwrap();
        std::fs::write(block.join("loop0/removable"), "0\n").unwrap();
        std::fs::write(
            &f.manager.mounts_file,
            "/dev/sda1 / ext4 rw 0 0\n/dev/sdb1 /mnt/dashcam\\040storage vfat rw 0 0\n",
        )
        .unwrap();
    }

    fn add_clip(f: &Fixture, trip_id: i64, seq: i32, rel: &str, age: Duration) -> i64 {
        let path = f.paths.data().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![0u8; 1000]).unwrap();
        let now = f.clocks.realtime();
        let start = now - jiff::SignedDuration::try_from(age).unwrap();
        f.db
            .record_clip(
                trip_id,
                &ClipInsert {
                    start_time: Some(start),
                    end_time: Some(start + jiff::SignedDuration::from_secs(60)),
                    sequence_num: seq,
                    road_video_file: Some(rel.to_owned()),
                    ..ClipInsert::default()
                },
            )
            .unwrap()
    }

    #[test]
    fn block_device_enumeration_reads_sysfs() {
        let f = fixture(StorageSettings::default());
        fake_sysfs(&f);
        let devices = f.manager.list_block_devices().unwrap();
        assert_eq!(devices.len(), 2, "loop device must be skipped: {devices:?}");

        let sda = &devices[0];
        assert_eq!(sda.name, "sda");
        assert!(!sda.removable);
        assert_eq!(sda.size_bytes, 976773168 * 512);
        assert_eq!(sda.partitions.len(), 1);
        assert_eq!(sda.partitions[0].mounted_at, Some(PathBuf::from("/")));

        let sdb = &devices[1];
        assert!(sdb.removable);
        assert_eq!(
            sdb.partitions[0].mounted_at,
            Some(PathBuf::from("/mnt/dashcam storage"))
        );

        let usb = f.manager.list_usb_drives().unwrap();
        assert_eq!(usb.len(), 1);
        assert_eq!(usb[0].name, "sdb");
    }

    #[test]
    fn missing_sysfs_yields_empty() {
        let f = fixture(StorageSettings::default());
        assert!(f.manager.list_block_devices().unwrap().is_empty());
    }

    #[test]
    fn disk_usage_reports_plausible_numbers() {
        let f = fixture(StorageSettings::default());
        let usage = f.manager.disk_usage(f.paths.data()).unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.used_bytes <= usage.total_bytes);
        assert!((0.0..=100.0).contains(&usage.used_percent));
    }

    #[test]
    fn retention_deletes_old_clips_and_rows() {
        let f = fixture(StorageSettings::default());
        // Give the clock a realistic present so "40 days old" exists.
        f.clocks.sleep(Duration::from_secs(100 * 86_400));
        let trip = f.db.start_trip(None, None, None).unwrap();
        f.db.end_trip(trip, None, None).unwrap();
        let old_id = add_clip(
            &f,
            trip,
            1,
            "videos/1970-02-01/a.mp4",
            Duration::from_secs(40 * 86_400),
        );
        let new_id = add_clip(
            &f,
            trip,
            2,
            "videos/1970-04-01/b.mp4",
            Duration::from_secs(5 * 86_400),
        );

        let report = f.manager.clean_older_than_days(30).unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.deleted_clips, 1);
        assert_eq!(report.freed_bytes, 1000);
        assert!(!f.paths.data().join("videos/1970-02-01/a.mp4").exists());
        assert!(f.paths.data().join("videos/1970-04-01/b.mp4").exists());
        let remaining = f.db.trip_clips(trip).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, new_id);
        assert_ne!(remaining[0].id, old_id);
    }

    #[test]
    fn retention_survives_already_deleted_files() {
        let f = fixture(StorageSettings::default());
        f.clocks.sleep(Duration::from_secs(100 * 86_400));
        let trip = f.db.start_trip(None, None, None).unwrap();
        f.db.end_trip(trip, None, None).unwrap();
        add_clip(
            &f,
            trip,
            1,
            "videos/1970-02-01/gone.mp4",
            Duration::from_secs(40 * 86_400),
        );
        std::fs::remove_file(f.paths.data().join("videos/1970-02-01/gone.mp4")).unwrap();
        let report = f.manager.clean_older_than_days(30).unwrap();
        // The row is still removed; no bytes were freed.
        assert_eq!(report.deleted_clips, 1);
        assert_eq!(report.freed_bytes, 0);
    }

    #[test]
    fn maybe_clean_respects_enable_flag_and_threshold() {
        let mut settings = StorageSettings::default();
        settings.auto_clean_enabled = false;
        let f = fixture(settings);
        assert_eq!(f.manager.maybe_clean().unwrap(), CleanupReport::default());

        // Enabled but the threshold is unreachable: no cleanup.
        let mut settings = StorageSettings::default();
        settings.auto_clean_enabled = true;
        settings.auto_clean_threshold = 101;
        let f = fixture(settings);
        assert_eq!(f.manager.maybe_clean().unwrap(), CleanupReport::default());

        // Enabled with a zero threshold: the sweep always runs.
        let mut settings = StorageSettings::default();
        settings.auto_clean_enabled = true;
        settings.auto_clean_threshold = 0;
        let f = fixture(settings);
        f.clocks.sleep(Duration::from_secs(100 * 86_400));
        let trip = f.db.start_trip(None, None, None).unwrap();
        f.db.end_trip(trip, None, None).unwrap();
        add_clip(
            &f,
            trip,
            1,
            "videos/1970-02-01/x.mp4",
            Duration::from_secs(40 * 86_400),
        );
        let report = f.manager.maybe_clean().unwrap();
        assert_eq!(report.deleted_clips, 1);
    }

    #[test]
    fn settings_apply_persists() {
        let f = fixture(StorageSettings::default());
        let mut s = StorageSettings::default();
        s.auto_clean_days = 7;
        f.manager.apply_settings(s.clone()).unwrap();
        assert_eq!(f.manager.settings().auto_clean_days, 7);
        assert_eq!(StorageSettings::load(f.paths.settings_path()).unwrap(), s);
    }
}
