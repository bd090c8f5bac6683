// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Camera drivers.
//!
//! Two implementations share one capability set ([`CameraDriver`]): the road
//! camera uses the platform's hardware H.264 encoder and records on its own
//! ([`road::RoadCamera`]); the interior USB camera is software-encoded and
//! frame-driven, so the recording task must poll
//! [`CameraDriver::record_frame`] at ~30 fps ([`interior::InteriorCamera`]).
//!
//! Drivers are single-consumer: `capture_frame` and `record_frame` must not
//! be called concurrently from different tasks on the same driver. The
//! capture manager enforces ownership (recording vs. preview) with one mutex
//! per driver.

use base::Error;
use db::Quality;
use std::path::Path;

mod ffmpeg;
pub mod interior;
pub mod road;

/// Consecutive frame failures that trigger a driver reset.
pub const RESET_THRESHOLD: u32 = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    Road,
    Interior,
}

impl CameraKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CameraKind::Road => "road",
            CameraKind::Interior => "interior",
        }
    }

    /// Overlay label drawn on preview frames.
    pub fn label(self) -> &'static str {
        match self {
            CameraKind::Road => "ROAD CAMERA",
            CameraKind::Interior => "INTERIOR CAMERA",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "road" => Some(CameraKind::Road),
            "interior" => Some(CameraKind::Interior),
            _ => None,
        }
    }
}

impl std::fmt::Display for CameraKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured frame, packed RGB8.
#[derive(Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Encoder parameters for one camera at one quality level.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QualityConfig {
    pub width: u32,
    pub height: u32,
    /// bits per second.
    pub bitrate: u32,
}

impl QualityConfig {
    pub fn size_arg(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Encoder parameters per camera and quality level.
pub fn quality_config(kind: CameraKind, quality: Quality) -> QualityConfig {
    match (kind, quality) {
        (CameraKind::Road, Quality::Normal) => QualityConfig {
            width: 1280,
            height: 720,
            bitrate: 1_500_000,
        },
        (CameraKind::Road, Quality::High) => QualityConfig {
            width: 1920,
            height: 1080,
            bitrate: 3_000_000,
        },
        (CameraKind::Interior, Quality::Normal) => QualityConfig {
            width: 640,
            height: 480,
            bitrate: 800_000,
        },
        (CameraKind::Interior, Quality::High) => QualityConfig {
            width: 1280,
            height: 720,
            bitrate: 2_000_000,
        },
    }
}

/// The capability set shared by both drivers.
pub trait CameraDriver: Send {
    fn kind(&self) -> CameraKind;

    fn initialize(&mut self) -> Result<(), Error>;

    fn release(&mut self);

    fn is_initialized(&self) -> bool;

    /// Captures a single frame for preview. `None` on failure; the caller
    /// counts failures toward [`RESET_THRESHOLD`].
    fn capture_frame(&mut self) -> Option<Frame>;

    fn start_recording(&mut self, path: &Path, quality: &QualityConfig) -> Result<(), Error>;

    fn stop_recording(&mut self) -> Result<(), Error>;

    fn is_recording(&self) -> bool;

    /// True iff the recording task must poll [`Self::record_frame`].
    fn is_frame_driven(&self) -> bool {
        false
    }

    /// Feeds one frame to the encoder. Only meaningful for frame-driven
    /// drivers; the default is a no-op.
    fn record_frame(&mut self) -> Result<(), Error> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_configs_match_encoder_settings() {
        let road_nq = quality_config(CameraKind::Road, Quality::Normal);
        assert_eq!((road_nq.width, road_nq.height), (1280, 720));
        assert_eq!(road_nq.bitrate, 1_500_000);
        let road_hq = quality_config(CameraKind::Road, Quality::High);
        assert_eq!((road_hq.width, road_hq.height), (1920, 1080));
        assert_eq!(road_hq.bitrate, 3_000_000);
        let int_nq = quality_config(CameraKind::Interior, Quality::Normal);
        assert_eq!((int_nq.width, int_nq.height), (640, 480));
        assert_eq!(int_nq.size_arg(), "640x480");
    }

    #[test]
    fn camera_kind_round_trip() {
        assert_eq!(CameraKind::parse("road"), Some(CameraKind::Road));
        assert_eq!(CameraKind::parse("interior"), Some(CameraKind::Interior));
        assert_eq!(CameraKind::parse("exterior"), None);
        assert_eq!(CameraKind::Road.label(), "ROAD CAMERA");
        assert_eq!(CameraKind::Interior.to_string(), "interior");
    }
}
