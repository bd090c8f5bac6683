// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Recording engine: segments continuous recording into fixed-duration
//! clips.
//!
//! State machine: `Idle → Recording → Stopping → Idle`. While recording, a
//! dedicated thread polls frame-driven cameras at ~30 fps and rolls to a new
//! clip when the clip timer expires or a quality change requests it.
//! Completed clips are verified (files exist, non-zero size) and handed to
//! the registered [`ClipSink`]; the clip still open at stop time is instead
//! returned from [`Recorder::stop_recording`], which never invokes the sink
//! for it.

use crate::cameras::{quality_config, CameraDriver, CameraKind};
use crate::config::Paths;
use base::clock::Clocks;
use base::{err, Error};
use db::Quality;
use jiff::Timestamp;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// A camera under the recorder's control.
pub type CameraHandle = (CameraKind, Arc<Mutex<dyn CameraDriver>>);

/// A completed, verified clip.
#[derive(Clone, Debug)]
pub struct ClipRecord {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    /// 1-based, consecutive within the session.
    pub sequence_num: i32,
    pub quality: Quality,
    /// Absolute paths of the files that exist with non-zero size. A camera
    /// that failed for this clip is simply absent.
    pub files: HashMap<CameraKind, PathBuf>,
    /// Landmark id attached via [`Recorder::mark_landmark_proximity`].
    pub marked_landmark: Option<String>,
}

/// Receives each completed clip while recording continues. Panics in the
/// sink are caught and logged, never propagated into the recording loop.
pub trait ClipSink: Send + Sync {
    fn clip_completed(&self, clip: ClipRecord);
}

#[derive(Clone, Copy, Debug)]
pub struct RecorderOptions {
    pub clip_duration: Duration,
    /// Poll cadence for frame-driven cameras.
    pub frame_interval: Duration,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        RecorderOptions {
            clip_duration: Duration::from_secs(60),
            frame_interval: Duration::from_millis(33),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Idle,
    Recording,
    Stopping,
}

struct Control {
    state: State,
    quality: Quality,
    /// Set by `set_recording_quality` while recording; the loop rolls the
    /// clip at its next iteration so the new quality takes effect.
    roll_requested: bool,
    /// Landmark to stamp onto the clip currently being written.
    pending_landmark: Option<String>,
    completed: Vec<ClipRecord>,
}

pub struct Recorder<C: Clocks + Clone> {
    clocks: C,
    paths: Paths,
    options: RecorderOptions,
    cameras: Vec<CameraHandle>,
    control: Arc<Mutex<Control>>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<C: Clocks + Clone> Recorder<C> {
    pub fn new(
        clocks: C,
        paths: Paths,
        cameras: Vec<CameraHandle>,
        options: RecorderOptions,
    ) -> Self {
        Recorder {
            clocks,
            paths,
            options,
            cameras,
            control: Arc::new(Mutex::new(Control {
                state: State::Idle,
                quality: Quality::Normal,
                roll_requested: false,
                pending_landmark: None,
                completed: Vec::new(),
            })),
            join: Mutex::new(None),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.control.lock().unwrap().state == State::Recording
    }

    pub fn current_quality(&self) -> Quality {
        self.control.lock().unwrap().quality
    }

    /// Starts a recording session: resets sequence numbering, opens the
    /// first clip synchronously, and launches the recording thread.
    pub fn start_recording(&self, sink: Arc<dyn ClipSink>) -> Result<(), Error> {
        {
            let mut c = self.control.lock().unwrap();
            if c.state != State::Idle {
                return Err(err!(FailedPrecondition, msg("recording already in progress")));
            }
            c.state = State::Recording;
            c.roll_requested = false;
            c.pending_landmark = None;
            c.completed = Vec::new();
        }
        let mut session = Session {
            clocks: self.clocks.clone(),
            paths: self.paths.clone(),
            options: self.options,
            cameras: self.cameras.clone(),
            control: self.control.clone(),
            sink,
            sequence: 0,
            clip_start: self.clocks.realtime(),
            clip_quality: Quality::Normal,
            output_files: HashMap::new(),
        };
        if let Err(e) = session.begin_clip() {
            self.control.lock().unwrap().state = State::Idle;
            self.stop_cameras();
            return Err(e);
        }
        info!("recording started");
        let handle = std::thread::Builder::new()
            .name("recorder".to_owned())
            .spawn(move || session.run())
            .map_err(|e| err!(Internal, source(e)))?;
        *self.join.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stops the session and returns all clips of the session: the ones
    /// already delivered through the sink, plus the final clip (which never
    /// goes through the sink).
    pub fn stop_recording(&self) -> Result<Vec<ClipRecord>, Error> {
        {
            let mut c = self.control.lock().unwrap();
            match c.state {
                State::Idle => {
                    warn!("no recording in progress");
                    return Ok(Vec::new());
                }
                State::Stopping => {
                    return Err(err!(FailedPrecondition, msg("stop already in progress")))
                }
                State::Recording => c.state = State::Stopping,
            }
        }
        if let Some(handle) = self.join.lock().unwrap().take() {
            if handle.join().is_err() {
                error!("recording thread panicked");
            }
        }
        let mut c = self.control.lock().unwrap();
        c.state = State::Idle;
        info!("recording stopped with {} clips", c.completed.len());
        Ok(std::mem::take(&mut c.completed))
    }

    /// Changes the recording quality. While recording, a differing quality
    /// rolls to a new clip immediately so the change takes effect on the
    /// next file.
    pub fn set_recording_quality(&self, quality: Quality) {
        let mut c = self.control.lock().unwrap();
        if c.quality == quality {
            return;
        }
        info!(from = %c.quality, to = %quality, "changing recording quality");
        c.quality = quality;
        if c.state == State::Recording {
            c.roll_requested = true;
        }
    }

    /// Stamps the clip currently being written with a landmark id.
    pub fn mark_landmark_proximity(&self, landmark_id: &str) {
        let mut c = self.control.lock().unwrap();
        if c.state == State::Recording {
            c.pending_landmark = Some(landmark_id.to_owned());
        }
    }

    fn stop_cameras(&self) {
        for (kind, cam) in &self.cameras {
            let mut cam = cam.lock().unwrap();
            if cam.is_recording() {
                if let Err(e) = cam.stop_recording() {
                    warn!(camera = %kind, err = %e.chain(), "error stopping camera");
                }
            }
        }
    }
}

/// State owned by the recording thread.
struct Session<C: Clocks> {
    clocks: C,
    paths: Paths,
    options: RecorderOptions,
    cameras: Vec<CameraHandle>,
    control: Arc<Mutex<Control>>,
    sink: Arc<dyn ClipSink>,
    sequence: i32,
    clip_start: Timestamp,
    /// Quality the open clip was started with; a concurrent quality change
    /// only affects the next clip.
    clip_quality: Quality,
    output_files: HashMap<CameraKind, PathBuf>,
}

impl<C: Clocks> Session<C> {
    fn run(mut self) {
        loop {
            let (stopping, roll) = {
                let mut c = self.control.lock().unwrap();
                (c.state == State::Stopping, std::mem::take(&mut c.roll_requested))
            };
            if stopping {
                break;
            }
            let timer_expired = self
                .clocks
                .realtime()
                .duration_since(self.clip_start)
                .unsigned_abs()
                >= self.options.clip_duration;
            if roll || timer_expired {
                if let Err(e) = self.roll_clip() {
                    error!(err = %e.chain(), "unable to start next clip; ending session");
                    self.stop_all_cameras();
                    self.control.lock().unwrap().state = State::Idle;
                    return;
                }
            }
            self.drive_frame_cameras();
            self.clocks.sleep(self.options.frame_interval);
        }

        // Stopping: close the open clip and leave it for stop_recording()
        // to return. It deliberately bypasses the sink.
        let final_clip = self.close_clip();
        let mut c = self.control.lock().unwrap();
        c.completed.push(final_clip);
        info!(
            clips = c.completed.len(),
            "recording thread finished"
        );
    }

    /// One poll cycle for frame-driven cameras. A failed camera leaves its
    /// file short; the clip itself continues.
    fn drive_frame_cameras(&mut self) {
        for (kind, cam) in &self.cameras {
            let mut cam = cam.lock().unwrap();
            if cam.is_frame_driven() && cam.is_recording() {
                if let Err(e) = cam.record_frame() {
                    warn!(camera = %kind, err = %e.chain(), "record_frame failed");
                }
            }
        }
    }

    /// Closes the current clip and opens the next one.
    fn roll_clip(&mut self) -> Result<(), Error> {
        let clip = self.close_clip();
        info!(sequence = clip.sequence_num, "completed clip, starting new clip");
        self.control.lock().unwrap().completed.push(clip.clone());
        let sink = self.sink.clone();
        if let Err(panic) =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
                sink.clip_completed(clip)
            }))
        {
            error!(?panic, "clip sink panicked");
        }
        self.begin_clip()
    }

    /// Starts encoders for the next clip: bumps the sequence number,
    /// composes `HH-MM-SS_seqNNN_{HQ|NQ}_{camera}.mp4` names in today's
    /// folder, and starts each camera (one retry per camera).
    fn begin_clip(&mut self) -> Result<(), Error> {
        let quality = self.control.lock().unwrap().quality;
        self.sequence += 1;
        let now = self.clocks.realtime();
        let zoned = now.to_zoned(jiff::tz::TimeZone::system());
        let folder = self.paths.daily_videos_dir(zoned.date())?;
        let stamp = zoned.strftime("%H-%M-%S");
        self.output_files.clear();
        for (kind, cam) in &self.cameras {
            let filename = format!(
                "{stamp}_seq{:03}_{}_{kind}.mp4",
                self.sequence,
                quality.file_suffix()
            );
            let path = folder.join(filename);
            let qc = quality_config(*kind, quality);
            let mut cam = cam.lock().unwrap();
            let started = cam.start_recording(&path, &qc).or_else(|e| {
                warn!(camera = %kind, err = %e.chain(), "start_recording failed; retrying once");
                cam.start_recording(&path, &qc)
            });
            match started {
                Ok(()) => {
                    self.output_files.insert(*kind, path);
                }
                Err(e) => {
                    return Err(err!(
                        EncoderError,
                        source(e),
                        msg("camera {kind} failed to start clip {}", self.sequence)
                    ));
                }
            }
        }
        self.clip_start = now;
        self.clip_quality = quality;
        info!(
            sequence = self.sequence,
            quality = %quality,
            "started clip"
        );
        Ok(())
    }

    /// Stops every camera and builds the record for the clip that just
    /// closed, keeping only files that exist with non-zero size.
    fn close_clip(&mut self) -> ClipRecord {
        self.stop_all_cameras();
        let end_time = self.clocks.realtime();
        let mut files = HashMap::new();
        for (kind, path) in self.output_files.drain() {
            match std::fs::metadata(&path) {
                Ok(m) if m.len() > 0 => {
                    files.insert(kind, path);
                }
                _ => warn!(
                    camera = %kind,
                    path = %path.display(),
                    "video file is missing or empty"
                ),
            }
        }
        let marked_landmark = self.control.lock().unwrap().pending_landmark.take();
        ClipRecord {
            start_time: self.clip_start,
            end_time,
            sequence_num: self.sequence,
            quality: self.clip_quality,
            files,
            marked_landmark,
        }
    }

    fn stop_all_cameras(&self) {
        for (kind, cam) in &self.cameras {
            let mut cam = cam.lock().unwrap();
            if cam.is_recording() {
                if let Err(e) = cam.stop_recording() {
                    warn!(camera = %kind, err = %e.chain(), "error stopping camera");
                }
            }
        }
    }
}
