// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! ffmpeg child-process plumbing shared by the two drivers.
//!
//! Capture runs one long-lived child per device decoding to packed RGB8 on
//! stdout; recording runs one child per clip. Children are stopped with
//! SIGINT first so ffmpeg writes the container trailer, then killed if they
//! don't exit within the deadline.

use super::Frame;
use crate::tools;
use base::{err, Error};
use std::io::Read as _;
use std::io::Write as _;
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long to wait for a child to exit after SIGINT / stdin EOF.
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// A long-lived ffmpeg child decoding a V4L2 device to rgb24 frames.
pub(super) struct CaptureStream {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
}

impl CaptureStream {
    pub fn spawn(device: &str, width: u32, height: u32, fps: u32) -> Result<Self, Error> {
        let mut child = Command::new(tools::ffmpeg_path())
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "v4l2"])
            .args(["-framerate", &fps.to_string()])
            .args(["-video_size", &format!("{width}x{height}")])
            .args(["-i", device])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                err!(
                    DeviceUnavailable,
                    source(e),
                    msg("unable to spawn capture for {device}")
                )
            })?;
        let stdout = child.stdout.take().expect("stdout was piped");
        Ok(CaptureStream {
            child,
            stdout,
            width,
            height,
        })
    }

    /// Blocks until the next frame arrives. `None` on EOF or IO error, which
    /// usually means the child died.
    pub fn read_frame(&mut self) -> Option<Frame> {
        let len = (self.width * self.height * 3) as usize;
        let mut data = vec![0u8; len];
        match self.stdout.read_exact(&mut data) {
            Ok(()) => Some(Frame {
                width: self.width,
                height: self.height,
                data,
            }),
            Err(e) => {
                debug!(err = %e, "capture stream ended");
                None
            }
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        stop_child(&mut self.child, Duration::from_secs(1));
    }
}

/// An ffmpeg child encoding rgb24 frames fed through stdin into a clip file.
pub(super) struct EncoderSink {
    child: Child,
    stdin: Option<ChildStdin>,
    pub frame_len: usize,
}

impl EncoderSink {
    pub fn spawn(
        codec: &str,
        in_width: u32,
        in_height: u32,
        fps: u32,
        bitrate: u32,
        path: &Path,
    ) -> std::io::Result<Self> {
        let mut child = Command::new(tools::ffmpeg_path())
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-video_size", &format!("{in_width}x{in_height}")])
            .args(["-framerate", &fps.to_string()])
            .args(["-i", "pipe:0"])
            .args(["-c:v", codec])
            .args(["-b:v", &bitrate.to_string()])
            .args(["-pix_fmt", "yuv420p", "-y"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child.stdin.take();
        Ok(EncoderSink {
            child,
            stdin,
            frame_len: (in_width * in_height * 3) as usize,
        })
    }

    /// True iff the child died already (e.g. the codec is unavailable).
    pub fn is_dead(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)) | Err(_))
    }

    pub fn write_frame(&mut self, data: &[u8]) -> std::io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| std::io::Error::other("encoder already finishing"))?;
        stdin.write_all(data)
    }

    /// Closes stdin so ffmpeg finalizes the file, then waits for exit.
    pub fn finish(mut self) -> Result<(), Error> {
        drop(self.stdin.take());
        if !wait_with_deadline(&mut self.child, STOP_DEADLINE) {
            warn!("encoder did not exit after stdin close; killing");
            let _ = self.child.kill();
            let _ = self.child.wait();
            return Err(err!(EncoderError, msg("encoder had to be killed")));
        }
        Ok(())
    }
}

impl Drop for EncoderSink {
    fn drop(&mut self) {
        drop(self.stdin.take());
        stop_child(&mut self.child, Duration::from_secs(1));
    }
}

/// Spawns the self-driving recorder child used by the road camera: device in,
/// hardware H.264 out, one keyframe per second at 30 fps.
pub(super) fn spawn_device_recorder(
    device: &str,
    encoder: &str,
    width: u32,
    height: u32,
    fps: u32,
    bitrate: u32,
    gop: u32,
    path: &Path,
) -> Result<Child, Error> {
    Command::new(tools::ffmpeg_path())
        .args(["-hide_banner", "-loglevel", "error"])
        .args(["-f", "v4l2"])
        .args(["-framerate", &fps.to_string()])
        .args(["-video_size", &format!("{width}x{height}")])
        .args(["-i", device])
        .args(["-c:v", encoder])
        .args(["-b:v", &bitrate.to_string()])
        .args(["-g", &gop.to_string()])
        .args(["-pix_fmt", "yuv420p", "-y"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| err!(EncoderError, source(e), msg("unable to spawn recorder")))
}

/// SIGINT then wait; SIGKILL on deadline. Returns true on clean exit.
pub(super) fn stop_child(child: &mut Child, deadline: Duration) -> bool {
    if let Ok(Some(_)) = child.try_wait() {
        return true;
    }
    let pid = nix::unistd::Pid::from_raw(child.id() as i32);
    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGINT);
    if wait_with_deadline(child, deadline) {
        return true;
    }
    warn!("ffmpeg child {pid} ignored SIGINT; killing");
    let _ = child.kill();
    let _ = child.wait();
    false
}

fn wait_with_deadline(child: &mut Child, deadline: Duration) -> bool {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {
                if start.elapsed() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return false,
        }
    }
}
