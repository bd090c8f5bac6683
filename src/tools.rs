// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! External tool resolution.
//!
//! The drivers and the metadata injector shell out to `ffmpeg`. Resolution
//! order: `DASHCAM_FFMPEG_PATH` override, a sidecar binary next to the
//! executable, then `PATH`.

use std::env;
use std::path::PathBuf;

fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

fn resolve_tool(env_key: &str, default_name: &str) -> PathBuf {
    if let Ok(v) = env::var(env_key) {
        let p = PathBuf::from(&v);
        if p.exists() {
            return p;
        }
    }
    if let Some(dir) = exe_dir() {
        let candidate = dir.join(default_name);
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from(default_name)
}

pub fn ffmpeg_path() -> PathBuf {
    resolve_tool("DASHCAM_FFMPEG_PATH", "ffmpeg")
}

/// True iff ffmpeg resolves and runs.
pub fn ffmpeg_available() -> bool {
    let path = ffmpeg_path();
    std::process::Command::new(&path)
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_falls_back_to_path() {
        // Without the env override the result is at least a bare name that
        // can be handed to Command.
        std::env::remove_var("DASHCAM_FFMPEG_PATH");
        let p = ffmpeg_path();
        assert!(!p.as_os_str().is_empty());
    }
}
