// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

pub mod clock;
mod error;
pub mod geo;
pub mod shutdown;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};
