// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! GPS metadata for finished clip files.
//!
//! When ffmpeg is available, tags are injected as container-level metadata
//! (stream copy, no re-encode). Otherwise the same information is written as
//! sidecar files sharing the video's stem: a GPX 1.1 track (`.gpx`) and a
//! JSON tag dump (`_metadata.json`).

use crate::tools;
use base::clock::Clocks;
use base::{err, Error};
use db::{ClipInsert, GpsPoint};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, info, warn};

/// Every Nth track point goes into the compressed `gps_track` tag.
const TRACK_STRIDE: usize = 10;

pub struct MetadataInjector {
    ffmpeg: bool,
}

impl MetadataInjector {
    pub fn new() -> Self {
        let ffmpeg = tools::ffmpeg_available();
        if !ffmpeg {
            info!("ffmpeg unavailable; clip metadata will be written as sidecar files");
        }
        MetadataInjector { ffmpeg }
    }

    #[cfg(test)]
    pub fn without_ffmpeg() -> Self {
        MetadataInjector { ffmpeg: false }
    }

    /// Attaches GPS metadata to a clip file: container tags when possible,
    /// sidecars otherwise. Injection failures fall back to sidecars.
    pub fn process_clip<C: Clocks>(
        &self,
        clocks: &C,
        video_path: &Path,
        gps: &[GpsPoint],
        clip: &ClipInsert,
    ) -> Result<(), Error> {
        let tags = prepare_tags(clocks, gps, clip);
        if self.ffmpeg {
            match inject_with_ffmpeg(video_path, &tags) {
                Ok(()) => {
                    debug!(path = %video_path.display(), "injected GPS metadata");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        path = %video_path.display(),
                        err = %e.chain(),
                        "metadata injection failed; writing sidecars"
                    );
                }
            }
        }
        write_sidecars(video_path, gps, &tags)
    }
}

/// Builds the tag map defined by the recording pipeline's file contract.
pub fn prepare_tags<C: Clocks>(
    clocks: &C,
    gps: &[GpsPoint],
    clip: &ClipInsert,
) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    if let (Some(first), Some(last)) = (gps.first(), gps.last()) {
        tags.insert("gps_start_lat".into(), format!("{:.8}", first.latitude));
        tags.insert("gps_start_lon".into(), format!("{:.8}", first.longitude));
        tags.insert("gps_end_lat".into(), format!("{:.8}", last.latitude));
        tags.insert("gps_end_lon".into(), format!("{:.8}", last.longitude));
        tags.insert("gps_point_count".into(), gps.len().to_string());
        let track: Vec<String> = gps
            .iter()
            .step_by(TRACK_STRIDE)
            .map(|p| format!("{:.6},{:.6}", p.latitude, p.longitude))
            .collect();
        tags.insert("gps_track".into(), track.join("|"));
    }
    tags.insert("clip_sequence".into(), clip.sequence_num.to_string());
    if let Some(q) = clip.quality {
        tags.insert("recording_quality".into(), q.as_str().to_owned());
    }
    if let Some(id) = &clip.landmark_id {
        tags.insert("landmark_id".into(), id.clone());
    }
    tags.insert("landmark_nearby".into(), clip.near_landmark.to_string());
    if let Some(t) = &clip.landmark_type {
        tags.insert("landmark_type".into(), t.clone());
    }
    if let Some(t) = clip.start_time {
        tags.insert("clip_start_time".into(), t.to_string());
    }
    if let Some(t) = clip.end_time {
        tags.insert("clip_end_time".into(), t.to_string());
    }
    tags.insert("gps_injection_time".into(), clocks.realtime().to_string());
    tags.insert("dashcam_system".into(), "dashcam-v2".into());
    tags
}

/// Stream-copies the file through ffmpeg with `-metadata` tags, then
/// replaces the original atomically.
fn inject_with_ffmpeg(video_path: &Path, tags: &BTreeMap<String, String>) -> Result<(), Error> {
    let tmp = video_path.with_extension("tagged.mp4");
    let mut cmd = std::process::Command::new(tools::ffmpeg_path());
    cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
        .arg("-i")
        .arg(video_path)
        .args(["-c", "copy", "-map_metadata", "0"]);
    for (k, v) in tags {
        cmd.arg("-metadata").arg(format!("{k}={v}"));
    }
    cmd.arg(&tmp);
    let output = cmd
        .output()
        .map_err(|e| err!(Internal, source(e), msg("unable to run ffmpeg")))?;
    if !output.status.success() {
        let _ = std::fs::remove_file(&tmp);
        return Err(err!(
            Internal,
            msg(
                "ffmpeg metadata injection failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )
        ));
    }
    match std::fs::metadata(&tmp) {
        Ok(m) if m.len() > 0 => {
            std::fs::rename(&tmp, video_path)
                .map_err(|e| err!(StorageFatal, source(e), msg("unable to replace clip file")))
        }
        _ => {
            let _ = std::fs::remove_file(&tmp);
            Err(err!(Internal, msg("ffmpeg produced an empty output file")))
        }
    }
}

/// Writes `<stem>.gpx` and `<stem>_metadata.json` next to the video.
fn write_sidecars(
    video_path: &Path,
    gps: &[GpsPoint],
    tags: &BTreeMap<String, String>,
) -> Result<(), Error> {
    let stem = video_path.with_extension("");
    let stem = stem.to_string_lossy();

    if !gps.is_empty() {
        let gpx_path = format!("{stem}.gpx");
        std::fs::write(&gpx_path, render_gpx(gps))
            .map_err(|e| err!(StorageFatal, source(e), msg("unable to write {gpx_path}")))?;
        debug!(path = %gpx_path, "wrote GPX sidecar");
    }

    let json_path = format!("{stem}_metadata.json");
    let json = serde_json::to_string_pretty(tags).expect("string map always serializes");
    std::fs::write(&json_path, json)
        .map_err(|e| err!(StorageFatal, source(e), msg("unable to write {json_path}")))?;
    debug!(path = %json_path, "wrote metadata sidecar");
    Ok(())
}

/// GPX 1.1 with a single track segment.
fn render_gpx(gps: &[GpsPoint]) -> String {
    let mut out = String::new();
    out.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    out.push('\n');
    out.push_str(r#"<gpx version="1.1" creator="dashcam" xmlns="http://www.topografix.com/GPX/1/1">"#);
    out.push_str("\n  <trk>\n    <name>Dashcam clip track</name>\n    <trkseg>\n");
    for p in gps {
        let _ = write!(
            out,
            "      <trkpt lat=\"{:.8}\" lon=\"{:.8}\">",
            p.latitude, p.longitude
        );
        if let Some(ele) = p.altitude {
            let _ = write!(out, "<ele>{ele:.1}</ele>");
        }
        let _ = write!(out, "<time>{}</time>", p.timestamp);
        out.push_str("</trkpt>\n");
    }
    out.push_str("    </trkseg>\n  </trk>\n</gpx>\n");
    out
}
