// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! MJPEG fan-out engine.
//!
//! A single capture worker per process reads preview frames, annotates and
//! JPEG-encodes them once, and multiplexes the encoded part to every HTTP
//! client of that camera. Per-client queues are bounded to one frame and
//! latency-first: a new frame replaces an unconsumed old one, so a client
//! never sees an older frame after a newer one and queue length never
//! exceeds one.
//!
//! The worker adapts both its capture rate (queue saturation → target FPS
//! bucket) and the JPEG encoding (client count + saturation → quality level
//! and downscale). An idle reaper removes clients whose heartbeat went
//! silent.

use crate::cameras::{CameraKind, Frame};
use base::clock::Clocks;
use base::shutdown;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Base target FPS with unsaturated queues.
const BASE_FPS: f64 = 12.0;
/// Keep-alive capture rate with zero clients.
const IDLE_FPS: f64 = 4.0;

/// Hard cap on simultaneous clients per camera.
pub const MAX_CLIENTS_PER_CAMERA: usize = 5;
/// Hard cap on simultaneous connections per remote IP.
pub const MAX_CONNECTIONS_PER_IP: usize = 3;

/// A client whose heartbeat has been silent this long is reaped.
pub const CLIENT_IDLE_CUTOFF: Duration = Duration::from_secs(20);
/// Reaper period.
pub const REAPER_PERIOD: Duration = Duration::from_secs(5);

/// Generator wait on the per-client queue before emitting a keep-alive.
pub const GENERATOR_TIMEOUT: Duration = Duration::from_secs(1);
/// With a hidden tab, one placeholder roughly every this many timeouts.
pub const HIDDEN_KEEPALIVE_EVERY: u32 = 24;

const JPEG_QUALITY_LEVELS: [u8; 4] = [88, 80, 70, 60];
const RESIZE_FACTORS: [f64; 4] = [1.0, 0.9, 0.8, 0.7];
const MIN_WIDTH: u32 = 320;
const MIN_HEIGHT: u32 = 240;

/// Target FPS for the capture worker given the number of active clients and
/// the fraction of their queues that were full at the last broadcast.
pub fn target_fps(active_clients: usize, saturation: f64) -> f64 {
    if active_clients == 0 {
        IDLE_FPS
    } else if saturation > 0.30 {
        6.0
    } else if saturation > 0.15 {
        8.0
    } else if saturation > 0.05 {
        10.0
    } else {
        BASE_FPS
    }
}

/// Optimization level 0..=3; rises with client count and queue saturation.
pub fn quality_level(active_clients: usize, saturation: f64) -> usize {
    let by_saturation = if saturation > 0.7 {
        3
    } else if saturation > 0.4 {
        2
    } else if saturation > 0.2 {
        1
    } else {
        0
    };
    let by_clients = match active_clients {
        0..=2 => 0,
        3..=4 => 1,
        _ => 2,
    };
    by_saturation.max(by_clients)
}

/// JPEG quality and resize factor for a level.
pub fn jpeg_params(level: usize) -> (u8, f64) {
    let level = level.min(3);
    (JPEG_QUALITY_LEVELS[level], RESIZE_FACTORS[level])
}

/// A bounded(1), latency-first frame queue. `push_latest` discards any
/// unconsumed frame before inserting and never blocks.
pub struct FrameQueue {
    slot: Mutex<Option<Bytes>>,
    notify: Notify,
}

impl FrameQueue {
    pub fn new() -> Self {
        FrameQueue {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Returns true iff an unconsumed frame was replaced.
    pub fn push_latest(&self, frame: Bytes) -> bool {
        let was_full = {
            let mut s = self.slot.lock().unwrap();
            let was_full = s.is_some();
            *s = Some(frame);
            was_full
        };
        self.notify.notify_one();
        was_full
    }

    pub fn is_full(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    pub fn take(&self) -> Option<Bytes> {
        self.slot.lock().unwrap().take()
    }

    /// Waits until a frame is available and takes it.
    pub async fn recv(&self) -> Bytes {
        loop {
            if let Some(f) = self.take() {
                return f;
            }
            self.notify.notified().await;
        }
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("full", &self.is_full())
            .finish()
    }
}

struct Client {
    queue: Arc<FrameQueue>,
    camera: CameraKind,
    remote_ip: IpAddr,
    active: bool,
    visible: bool,
    /// Monotonic instants.
    last_activity: Duration,
    connection_time: Duration,
    frames_sent: u64,
}

#[derive(Default)]
pub struct Stats {
    pub frames_served: AtomicU64,
    pub frames_captured: AtomicU64,
}

/// Point-in-time view for the status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub clients_connected: usize,
    pub active_clients_road: usize,
    pub active_clients_interior: usize,
    pub frames_served: u64,
    pub frames_captured: u64,
    pub target_fps: f64,
}

/// The shared fan-out hub: client table, per-camera frame cache, stats.
pub struct MjpegHub<C: Clocks> {
    clients: Mutex<HashMap<String, Client>>,
    last_frames: Mutex<HashMap<CameraKind, (Bytes, jiff::Timestamp)>>,
    current_fps: Mutex<f64>,
    pub stats: Stats,
    clocks: C,
    annotator: Annotator,
    next_client: AtomicU64,
}

/// Why a client registration was refused.
#[derive(Debug, Eq, PartialEq)]
pub enum RegisterError {
    /// Too many viewers on this camera; the stream should send one
    /// informative frame and close.
    CameraBusy,
    /// HTTP 429 for this IP.
    TooManyFromIp,
}

/// A registered client, held by its HTTP generator.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: String,
    pub camera: CameraKind,
    pub queue: Arc<FrameQueue>,
}

impl<C: Clocks> MjpegHub<C> {
    pub fn new(clocks: C, font_path: Option<&std::path::Path>) -> Self {
        MjpegHub {
            clients: Mutex::new(HashMap::new()),
            last_frames: Mutex::new(HashMap::new()),
            current_fps: Mutex::new(IDLE_FPS),
            stats: Stats::default(),
            clocks,
            annotator: Annotator::new(font_path),
            next_client: AtomicU64::new(1),
        }
    }

    fn active_count(&self, camera: CameraKind) -> usize {
        self.clients
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.active && c.camera == camera)
            .count()
    }

    pub fn has_clients(&self, camera: CameraKind) -> bool {
        self.active_count(camera) > 0
    }

    /// Registers a new streaming client, enforcing the per-camera and
    /// per-IP caps.
    pub fn register_client(
        &self,
        camera: CameraKind,
        remote_ip: IpAddr,
    ) -> Result<ClientHandle, RegisterError> {
        let now = self.clocks.monotonic();
        let mut clients = self.clients.lock().unwrap();
        let from_ip = clients
            .values()
            .filter(|c| c.active && c.remote_ip == remote_ip)
            .count();
        if from_ip >= MAX_CONNECTIONS_PER_IP {
            return Err(RegisterError::TooManyFromIp);
        }
        let on_camera = clients
            .values()
            .filter(|c| c.active && c.camera == camera)
            .count();
        if on_camera >= MAX_CLIENTS_PER_CAMERA {
            return Err(RegisterError::CameraBusy);
        }
        let id = format!(
            "{camera}-{}",
            self.next_client.fetch_add(1, Ordering::Relaxed)
        );
        let queue = Arc::new(FrameQueue::new());
        clients.insert(
            id.clone(),
            Client {
                queue: queue.clone(),
                camera,
                remote_ip,
                active: true,
                visible: true,
                last_activity: now,
                connection_time: now,
                frames_sent: 0,
            },
        );
        info!(client = %id, %camera, clients = on_camera + 1, "MJPEG client connected");
        Ok(ClientHandle { id, camera, queue })
    }

    /// Marks the client inactive, drains its queue, and removes the entry.
    /// Idempotent.
    pub fn cleanup_client(&self, client_id: &str, reason: &str) {
        let mut clients = self.clients.lock().unwrap();
        let Some(mut client) = clients.remove(client_id) else {
            return;
        };
        client.active = false;
        client.queue.take();
        let duration = self
            .clocks
            .monotonic()
            .saturating_sub(client.connection_time);
        info!(
            client = client_id,
            camera = %client.camera,
            reason,
            ?duration,
            frames = client.frames_sent,
            "MJPEG client cleaned up"
        );
    }

    /// Heartbeat: refreshes activity, optionally toggles tab visibility,
    /// optionally disconnects. Returns false for an unknown client.
    pub fn heartbeat(&self, client_id: &str, visible: Option<bool>, disconnect: bool) -> bool {
        if disconnect {
            let known = self.clients.lock().unwrap().contains_key(client_id);
            if known {
                self.cleanup_client(client_id, "heartbeat disconnect");
            }
            return known;
        }
        let mut clients = self.clients.lock().unwrap();
        let Some(client) = clients.get_mut(client_id) else {
            return false;
        };
        client.last_activity = self.clocks.monotonic();
        if let Some(v) = visible {
            client.visible = v;
        }
        true
    }

    /// True iff the client exists, is active, and reports a visible tab.
    pub fn is_visible(&self, client_id: &str) -> bool {
        self.clients
            .lock()
            .unwrap()
            .get(client_id)
            .map(|c| c.active && c.visible)
            .unwrap_or(false)
    }

    pub fn is_active(&self, client_id: &str) -> bool {
        self.clients
            .lock()
            .unwrap()
            .get(client_id)
            .map(|c| c.active)
            .unwrap_or(false)
    }

    /// Records generator-side progress for the reaper.
    pub fn note_frame_sent(&self, client_id: &str) {
        let mut clients = self.clients.lock().unwrap();
        if let Some(c) = clients.get_mut(client_id) {
            c.frames_sent += 1;
            c.last_activity = self.clocks.monotonic();
        }
    }

    /// Annotates, encodes, and enqueues one captured frame to every active
    /// client of `camera`. Returns the saturation observed before the
    /// broadcast, for FPS adaptation.
    pub fn broadcast_frame(&self, camera: CameraKind, frame: &Frame) -> f64 {
        let (active, full) = {
            let clients = self.clients.lock().unwrap();
            let mut active = 0;
            let mut full = 0;
            for c in clients.values() {
                if c.active && c.camera == camera {
                    active += 1;
                    if c.queue.is_full() {
                        full += 1;
                    }
                }
            }
            (active, full)
        };
        if active == 0 {
            return 0.0;
        }
        let saturation = full as f64 / active as f64;
        if saturation > 0.1 {
            debug!(%camera, full, active, "saturated MJPEG queues");
        }

        let level = quality_level(active, saturation);
        let (quality, scale) = jpeg_params(level);
        let now = self.clocks.realtime();
        let Some(jpeg) = self.annotator.annotate_and_encode(frame, camera, now, quality, scale)
        else {
            return saturation;
        };
        let part = make_part(&jpeg);
        self.last_frames
            .lock()
            .unwrap()
            .insert(camera, (part.clone(), now));

        let mut sent = 0u64;
        {
            let mut clients = self.clients.lock().unwrap();
            for c in clients.values_mut() {
                if c.active && c.camera == camera {
                    c.queue.push_latest(part.clone());
                    c.frames_sent += 1;
                    sent += 1;
                }
            }
        }
        self.stats.frames_served.fetch_add(sent, Ordering::Relaxed);
        self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
        saturation
    }

    /// The most recently broadcast part for a camera, if fresh enough to be
    /// worth sending as the immediate first frame.
    pub fn cached_frame(&self, camera: CameraKind) -> Option<Bytes> {
        let frames = self.last_frames.lock().unwrap();
        let (part, at) = frames.get(&camera)?;
        let age = self.clocks.realtime().duration_since(*at);
        (age.unsigned_abs() < Duration::from_secs(5)).then(|| part.clone())
    }

    /// An MJPEG part holding a placeholder image with a message. Used as
    /// the immediate frame when no capture is cached and as generator
    /// keep-alive.
    pub fn placeholder_part(&self, camera: CameraKind, message: &str) -> Bytes {
        let jpeg = self
            .annotator
            .placeholder(camera, message, self.clocks.realtime());
        make_part(&jpeg)
    }

    /// Removes every client idle past [`CLIENT_IDLE_CUTOFF`]. Returns the
    /// number reaped.
    pub fn reap_idle_clients(&self) -> usize {
        let now = self.clocks.monotonic();
        let idle: Vec<String> = {
            let clients = self.clients.lock().unwrap();
            clients
                .iter()
                .filter(|(_, c)| now.saturating_sub(c.last_activity) > CLIENT_IDLE_CUTOFF)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &idle {
            warn!(client = %id, "reaping idle MJPEG client");
            self.cleanup_client(id, "idle timeout");
        }
        idle.len()
    }

    pub fn status(&self) -> StatusSnapshot {
        let clients_connected = self.clients.lock().unwrap().len();
        let active_clients_road = self.active_count(CameraKind::Road);
        let active_clients_interior = self.active_count(CameraKind::Interior);
        let target_fps = *self.current_fps.lock().unwrap();
        StatusSnapshot {
            clients_connected,
            active_clients_road,
            active_clients_interior,
            frames_served: self.stats.frames_served.load(Ordering::Relaxed),
            frames_captured: self.stats.frames_captured.load(Ordering::Relaxed),
            target_fps,
        }
    }

    fn set_current_fps(&self, fps: f64) {
        *self.current_fps.lock().unwrap() = fps;
    }
}

fn make_part(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

/// The shared capture loop: the only preview reader of the cameras. Runs on
/// a blocking thread until shutdown.
pub fn capture_worker<C: Clocks + Clone>(
    hub: Arc<MjpegHub<C>>,
    mut grab: impl FnMut(CameraKind) -> Option<Frame>,
    shutdown_rx: shutdown::Receiver,
    clocks: C,
) {
    info!("MJPEG capture worker starting");
    while shutdown_rx.check().is_ok() {
        let started = clocks.monotonic();
        let mut max_saturation: f64 = 0.0;
        let mut total_active = 0;
        for camera in [CameraKind::Road, CameraKind::Interior] {
            let active = hub.active_count(camera);
            total_active += active;
            if active == 0 {
                continue;
            }
            match grab(camera) {
                Some(frame) => {
                    let sat = hub.broadcast_frame(camera, &frame);
                    max_saturation = max_saturation.max(sat);
                }
                None => debug!(%camera, "no preview frame"),
            }
        }
        let fps = target_fps(total_active, max_saturation);
        hub.set_current_fps(fps);
        let frame_interval = Duration::from_secs_f64(1.0 / fps);
        let elapsed = clocks.monotonic().saturating_sub(started);
        if let Some(remaining) = frame_interval.checked_sub(elapsed) {
            if shutdown_rx.wait_for(remaining).is_err() {
                break;
            }
        }
    }
    info!("MJPEG capture worker ending");
}

/// The idle reaper loop. Runs on a blocking thread until shutdown.
pub fn reaper<C: Clocks>(hub: Arc<MjpegHub<C>>, shutdown_rx: shutdown::Receiver) {
    info!("MJPEG reaper starting");
    while shutdown_rx.wait_for(REAPER_PERIOD).is_ok() {
        hub.reap_idle_clients();
    }
    info!("MJPEG reaper ending");
}

/// Draws the UTC timestamp (bottom-left) and camera label (top-left) and
/// encodes to JPEG. Text needs a TTF font; without one, only the darkened
/// label bands are drawn.
struct Annotator {
    font: Option<ab_glyph::FontVec>,
}

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
];

impl Annotator {
    fn new(font_path: Option<&std::path::Path>) -> Self {
        let mut candidates: Vec<std::path::PathBuf> =
            font_path.map(|p| p.to_owned()).into_iter().collect();
        candidates.extend(FONT_CANDIDATES.iter().map(std::path::PathBuf::from));
        for path in candidates {
            if let Ok(data) = std::fs::read(&path) {
                if let Ok(font) = ab_glyph::FontVec::try_from_vec(data) {
                    debug!(path = %path.display(), "annotation font loaded");
                    return Annotator { font: Some(font) };
                }
            }
        }
        warn!("no annotation font found; frame labels will be blank bands");
        Annotator { font: None }
    }

    fn annotate_and_encode(
        &self,
        frame: &Frame,
        camera: CameraKind,
        now: jiff::Timestamp,
        quality: u8,
        scale: f64,
    ) -> Option<Vec<u8>> {
        let img = image::RgbImage::from_raw(frame.width, frame.height, frame.data.clone())?;
        let mut img = resize_for_level(img, scale);
        self.draw_overlays(&mut img, camera, now);
        encode_jpeg(&img, quality)
    }

    fn placeholder(&self, camera: CameraKind, message: &str, now: jiff::Timestamp) -> Vec<u8> {
        let mut img = image::RgbImage::from_pixel(MIN_WIDTH, MIN_HEIGHT, image::Rgb([24, 24, 24]));
        if let Some(font) = &self.font {
            let scale = ab_glyph::PxScale::from(18.0);
            let x = (MIN_WIDTH as i32 - message.len() as i32 * 9).max(4) / 2;
            imageproc::drawing::draw_text_mut(
                &mut img,
                image::Rgb([255, 255, 255]),
                x,
                (MIN_HEIGHT / 2) as i32 - 9,
                scale,
                font,
                message,
            );
        }
        self.draw_overlays(&mut img, camera, now);
        encode_jpeg(&img, JPEG_QUALITY_LEVELS[0]).unwrap_or_default()
    }

    fn draw_overlays(&self, img: &mut image::RgbImage, camera: CameraKind, now: jiff::Timestamp) {
        let (w, h) = img.dimensions();
        darken_band(img, 0, 0, w.min(220), 26);
        darken_band(img, 0, h.saturating_sub(26), w.min(240), 26);
        let Some(font) = &self.font else {
            return;
        };
        let scale = ab_glyph::PxScale::from(16.0);
        imageproc::drawing::draw_text_mut(
            img,
            image::Rgb([255, 160, 40]),
            6,
            5,
            scale,
            font,
            camera.label(),
        );
        let stamp = format!("{}", now.strftime("%Y-%m-%d %H:%M:%S%.3f"));
        imageproc::drawing::draw_text_mut(
            img,
            image::Rgb([230, 230, 230]),
            6,
            h as i32 - 21,
            scale,
            font,
            &stamp,
        );
    }
}

fn resize_for_level(img: image::RgbImage, scale: f64) -> image::RgbImage {
    if scale >= 1.0 {
        return img;
    }
    let (w, h) = img.dimensions();
    let nw = ((w as f64 * scale) as u32).max(MIN_WIDTH);
    let nh = ((h as f64 * scale) as u32).max(MIN_HEIGHT);
    if nw >= w || nh >= h {
        return img;
    }
    image::imageops::resize(&img, nw, nh, image::imageops::FilterType::Triangle)
}

fn darken_band(img: &mut image::RgbImage, x0: u32, y0: u32, w: u32, h: u32) {
    let (iw, ih) = img.dimensions();
    for y in y0..(y0 + h).min(ih) {
        for x in x0..(x0 + w).min(iw) {
            let p = img.get_pixel_mut(x, y);
            p.0 = [p.0[0] / 3, p.0[1] / 3, p.0[2] / 3];
        }
    }
}

fn encode_jpeg(img: &image::RgbImage, quality: u8) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(std::io::Cursor::new(&mut buf), quality);
    match img.write_with_encoder(encoder) {
        Ok(()) => Some(buf),
        Err(e) => {
            warn!(err = %e, "JPEG encode failed");
            None
        }
    }
}
