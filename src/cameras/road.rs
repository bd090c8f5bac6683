// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Road-facing camera on the platform ISP, recorded by the hardware H.264
//! encoder (`h264_v4l2m2m` on the Pi).
//!
//! The recorder child reads the device directly, so preview capture and
//! recording are mutually exclusive on this driver: while a clip is being
//! encoded, `capture_frame` returns `None`.

use super::ffmpeg::{self, CaptureStream};
use super::{CameraDriver, CameraKind, Frame, QualityConfig};
use base::{err, Error};
use db::Quality;
use std::path::Path;
use std::process::Child;
use std::time::Duration;
use tracing::{info, warn};

/// Keyframe interval: one per second at 30 fps.
const GOP: u32 = 30;

/// Initialization attempts before reporting fatal.
const INIT_ATTEMPTS: u32 = 3;

const FRAMERATE: u32 = 30;

#[derive(Clone, Debug)]
pub struct RoadConfig {
    /// V4L2 node of the CSI-attached ISP.
    pub device: String,
    /// Hardware encoder name.
    pub encoder: String,
    /// Preview capture size; recording sizes come from [`QualityConfig`].
    pub preview_width: u32,
    pub preview_height: u32,
}

impl Default for RoadConfig {
    fn default() -> Self {
        RoadConfig {
            device: "/dev/video0".into(),
            encoder: "h264_v4l2m2m".into(),
            preview_width: 640,
            preview_height: 480,
        }
    }
}

pub struct RoadCamera {
    config: RoadConfig,
    preview: Option<CaptureStream>,
    recorder: Option<Child>,
    initialized: bool,
}

impl RoadCamera {
    pub fn new(config: RoadConfig) -> Self {
        RoadCamera {
            config,
            preview: None,
            recorder: None,
            initialized: false,
        }
    }

    fn spawn_preview(&mut self) -> Result<CaptureStream, Error> {
        CaptureStream::spawn(
            &self.config.device,
            self.config.preview_width,
            self.config.preview_height,
            FRAMERATE,
        )
    }

    /// Starts a native MJPEG child encoding the device straight to JPEG
    /// parts on stdout. The returned reader yields raw MJPEG bytes. Mutually
    /// exclusive with recording and preview. The fan-out hub prefers the
    /// capture path (it re-encodes with annotations); this exists for
    /// direct-passthrough consumers.
    #[allow(dead_code)]
    pub fn start_native_mjpeg(&mut self, quality: Quality) -> Result<NativeMjpeg, Error> {
        if self.recorder.is_some() {
            return Err(err!(CameraContention, msg("road camera is recording")));
        }
        self.preview = None;
        let qc = super::quality_config(CameraKind::Road, quality);
        let mut child = std::process::Command::new(crate::tools::ffmpeg_path())
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "v4l2"])
            .args(["-framerate", &FRAMERATE.to_string()])
            .args(["-video_size", &qc.size_arg()])
            .args(["-i", &self.config.device])
            .args(["-f", "mjpeg", "pipe:1"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| err!(EncoderError, source(e), msg("unable to start native MJPEG")))?;
        let stdout = child.stdout.take().expect("stdout was piped");
        Ok(NativeMjpeg { child, stdout })
    }
}

/// Handle to a native MJPEG stream. Dropping it stops the child.
pub struct NativeMjpeg {
    child: Child,
    stdout: std::process::ChildStdout,
}

impl NativeMjpeg {
    #[allow(dead_code)]
    pub fn reader(&mut self) -> &mut impl std::io::Read {
        &mut self.stdout
    }
}

impl Drop for NativeMjpeg {
    fn drop(&mut self) {
        ffmpeg::stop_child(&mut self.child, Duration::from_secs(1));
    }
}

impl CameraDriver for RoadCamera {
    fn kind(&self) -> CameraKind {
        CameraKind::Road
    }

    fn initialize(&mut self) -> Result<(), Error> {
        self.release();
        for attempt in 1..=INIT_ATTEMPTS {
            match self.spawn_preview() {
                Ok(mut stream) => {
                    if let Some(_frame) = stream.read_frame() {
                        info!(device = %self.config.device, "road camera initialized");
                        self.preview = Some(stream);
                        self.initialized = true;
                        return Ok(());
                    }
                    warn!(attempt, "road camera opened but produced no test frame");
                }
                Err(e) => {
                    warn!(attempt, err = %e.chain(), "road camera initialization failed");
                }
            }
            if attempt < INIT_ATTEMPTS {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        self.initialized = false;
        Err(err!(
            DeviceUnavailable,
            msg(
                "road camera {} failed to initialize after {INIT_ATTEMPTS} attempts",
                self.config.device
            )
        ))
    }

    fn release(&mut self) {
        if let Some(mut child) = self.recorder.take() {
            ffmpeg::stop_child(&mut child, Duration::from_secs(5));
        }
        self.preview = None;
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn capture_frame(&mut self) -> Option<Frame> {
        if !self.initialized || self.recorder.is_some() {
            return None;
        }
        if self.preview.is_none() {
            match self.spawn_preview() {
                Ok(s) => self.preview = Some(s),
                Err(e) => {
                    warn!(err = %e.chain(), "road preview respawn failed");
                    return None;
                }
            }
        }
        let frame = self.preview.as_mut().and_then(CaptureStream::read_frame);
        if frame.is_none() {
            self.preview = None;
        }
        frame
    }

    fn start_recording(&mut self, path: &Path, quality: &QualityConfig) -> Result<(), Error> {
        if !self.initialized {
            return Err(err!(DeviceUnavailable, msg("road camera not initialized")));
        }
        if let Some(mut prev) = self.recorder.take() {
            warn!("stopping previous road recording before starting a new one");
            ffmpeg::stop_child(&mut prev, Duration::from_secs(5));
        }
        // The device has a single user: hand it from preview to the encoder.
        self.preview = None;
        let child = ffmpeg::spawn_device_recorder(
            &self.config.device,
            &self.config.encoder,
            quality.width,
            quality.height,
            FRAMERATE,
            quality.bitrate,
            GOP,
            path,
        )?;
        info!(
            path = %path.display(),
            bitrate = quality.bitrate,
            "road recording started"
        );
        self.recorder = Some(child);
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<(), Error> {
        let Some(mut child) = self.recorder.take() else {
            return Ok(()); // was not recording
        };
        if ffmpeg::stop_child(&mut child, Duration::from_secs(5)) {
            info!("road recording stopped");
            Ok(())
        } else {
            Err(err!(EncoderError, msg("road encoder had to be killed")))
        }
    }

    fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }
}
