// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Interior USB camera, software-encoded and frame-driven.
//!
//! A long-lived capture child decodes the V4L2 device to RGB frames. While
//! recording, the recording task polls [`CameraDriver::record_frame`] at
//! ~30 fps; each poll moves one frame from the capture child into the
//! encoder child's stdin. Codec fallback: `libx264` (avc1/X264), then
//! `mpeg4` (mp4v).

use super::ffmpeg::{CaptureStream, EncoderSink};
use super::{CameraDriver, CameraKind, Frame, QualityConfig};
use base::{err, Error};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const FRAMERATE: u32 = 30;
const INIT_ATTEMPTS: u32 = 3;

/// Software encoders to try, most preferred first.
const CODEC_CHAIN: &[&str] = &["libx264", "mpeg4"];

#[derive(Clone, Debug)]
pub struct InteriorConfig {
    /// V4L2 device index; the device path is `/dev/video{index}`.
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
    /// Kill a stale holder of the device (via `sudo fuser -k`) before
    /// retrying initialization.
    pub force_release: bool,
}

impl Default for InteriorConfig {
    fn default() -> Self {
        InteriorConfig {
            device_index: 0,
            width: 640,
            height: 480,
            force_release: false,
        }
    }
}

impl InteriorConfig {
    pub fn device_path(&self) -> String {
        format!("/dev/video{}", self.device_index)
    }
}

pub struct InteriorCamera {
    config: InteriorConfig,
    capture: Option<CaptureStream>,
    encoder: Option<EncoderSink>,
    initialized: bool,
}

impl InteriorCamera {
    pub fn new(config: InteriorConfig) -> Self {
        InteriorCamera {
            config,
            capture: None,
            encoder: None,
            initialized: false,
        }
    }

    /// Kills whatever process holds the device. Requires sudo; best-effort.
    fn force_release_device(&self) {
        let device = self.config.device_path();
        if !std::path::Path::new(&device).exists() {
            warn!(device, "device does not exist; skipping force release");
            return;
        }
        info!(device, "forcing release of device");
        let _ = std::process::Command::new("sudo")
            .args(["fuser", "-k", &device])
            .status();
        std::thread::sleep(Duration::from_secs(1));
    }

    fn spawn_capture(&self) -> Result<CaptureStream, Error> {
        CaptureStream::spawn(
            &self.config.device_path(),
            self.config.width,
            self.config.height,
            FRAMERATE,
        )
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if self.capture.is_none() {
            match self.spawn_capture() {
                Ok(s) => self.capture = Some(s),
                Err(e) => {
                    warn!(err = %e.chain(), "interior capture respawn failed");
                    return None;
                }
            }
        }
        let frame = self.capture.as_mut().and_then(CaptureStream::read_frame);
        if frame.is_none() {
            self.capture = None;
        }
        frame
    }
}

impl CameraDriver for InteriorCamera {
    fn kind(&self) -> CameraKind {
        CameraKind::Interior
    }

    fn initialize(&mut self) -> Result<(), Error> {
        self.release();
        std::thread::sleep(Duration::from_millis(500));
        for attempt in 1..=INIT_ATTEMPTS {
            info!(
                attempt,
                device = %self.config.device_path(),
                "initializing interior camera"
            );
            match self.spawn_capture() {
                Ok(mut stream) => {
                    if stream.read_frame().is_some() {
                        info!("interior camera initialized");
                        self.capture = Some(stream);
                        self.initialized = true;
                        return Ok(());
                    }
                    warn!("interior camera opened but cannot capture valid frames");
                }
                Err(e) => warn!(attempt, err = %e.chain(), "interior camera open failed"),
            }
            if attempt < INIT_ATTEMPTS {
                if self.config.force_release {
                    self.force_release_device();
                }
                std::thread::sleep(Duration::from_millis(500 * attempt as u64));
            }
        }
        self.initialized = false;
        Err(err!(
            DeviceUnavailable,
            msg(
                "interior camera {} failed to initialize after {INIT_ATTEMPTS} attempts",
                self.config.device_path()
            )
        ))
    }

    fn release(&mut self) {
        if let Some(enc) = self.encoder.take() {
            if let Err(e) = enc.finish() {
                warn!(err = %e.chain(), "error releasing interior encoder");
            }
        }
        self.capture = None;
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn capture_frame(&mut self) -> Option<Frame> {
        if !self.initialized {
            return None;
        }
        self.next_frame()
    }

    fn start_recording(&mut self, path: &Path, quality: &QualityConfig) -> Result<(), Error> {
        if !self.initialized {
            return Err(err!(DeviceUnavailable, msg("interior camera not initialized")));
        }
        if let Some(prev) = self.encoder.take() {
            warn!("stopping previous interior recording before starting a new one");
            let _ = prev.finish();
        }
        // The capture child keeps running at its native size; ffmpeg scales
        // on the encoder side only when the quality asks for it.
        for &codec in CODEC_CHAIN {
            match EncoderSink::spawn(
                codec,
                self.config.width,
                self.config.height,
                FRAMERATE,
                quality.bitrate,
                path,
            ) {
                Ok(mut sink) => {
                    // An unavailable codec makes ffmpeg exit immediately.
                    std::thread::sleep(Duration::from_millis(100));
                    if sink.is_dead() {
                        warn!(codec, "encoder exited at startup; trying next codec");
                        continue;
                    }
                    info!(path = %path.display(), codec, "interior recording started");
                    self.encoder = Some(sink);
                    return Ok(());
                }
                Err(e) => warn!(codec, err = %e, "unable to spawn encoder"),
            }
        }
        Err(err!(
            EncoderError,
            msg("no working software encoder among {CODEC_CHAIN:?}")
        ))
    }

    fn stop_recording(&mut self) -> Result<(), Error> {
        let Some(enc) = self.encoder.take() else {
            return Ok(()); // was not recording
        };
        enc.finish()?;
        info!("interior recording stopped");
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.encoder.is_some()
    }

    fn is_frame_driven(&self) -> bool {
        true
    }

    /// Moves one frame from the capture child into the encoder.
    fn record_frame(&mut self) -> Result<(), Error> {
        let Some(frame) = self.next_frame() else {
            return Err(err!(FrameCaptureFailed, msg("no frame from interior camera")));
        };
        let Some(enc) = self.encoder.as_mut() else {
            return Ok(()); // not recording
        };
        debug_assert_eq!(frame.data.len(), enc.frame_len);
        enc.write_frame(&frame.data)
            .map_err(|e| err!(EncoderError, source(e), msg("encoder write failed")))
    }
}
