// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! HTTP glue for the subsystems the core owns: MJPEG preview fan-out (with
//! heartbeat and status), geodata download control (with an SSE progress
//! stream), storage management, and the settings bus. Everything else the
//! original web UI talks to lives outside this crate.

use crate::body::{Body, BodySender};
use crate::cameras::CameraKind;
use crate::capture::CaptureManager;
use crate::config::StorageSettings;
use crate::disk::DiskManager;
use crate::geodata::{self, GeodataDownloader, GeodataJob, Waypoint};
use crate::mjpeg::{
    ClientHandle, MjpegHub, RegisterError, GENERATOR_TIMEOUT, HIDDEN_KEEPALIVE_EVERY,
};
use base::clock::Clocks;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt as _;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// SSE progress poll cadence.
const SSE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Eq, PartialEq)]
enum Path {
    StreamCamera(CameraKind),     // "/api/stream/{road|interior}"
    StreamHeartbeat(String),      // "/api/stream/heartbeat/<client>"
    StreamStatus,                 // "/api/stream/status"
    GeodataDownload(String),      // "/api/geodata/<trip>/download"
    GeodataPause(String),         // "/api/geodata/<trip>/pause"
    GeodataResume(String),        // "/api/geodata/<trip>/resume"
    GeodataCancel(String),        // "/api/geodata/<trip>/cancel"
    GeodataStatus(String),        // "/api/geodata/<trip>/status"
    GeodataStream(String),        // "/api/geodata/<trip>/stream"
    StorageStatus,                // "/api/storage/status"
    StorageDevices,               // "/api/storage/devices"
    StorageSettingsSet,           // "/api/storage/settings"
    StorageClean,                 // "/api/storage/clean"
    StorageMount(String),         // "/api/storage/mount/<device>"
    StorageEject(String),         // "/api/storage/eject/<device>"
    CameraSettingsSet,            // "/api/settings"
    NotFound,
}

impl Path {
    fn decode(path: &str) -> Self {
        let Some(path) = path.strip_prefix("/api/") else {
            return Path::NotFound;
        };
        if path == "settings" {
            return Path::CameraSettingsSet;
        }
        if let Some(rest) = path.strip_prefix("stream/") {
            if rest == "status" {
                return Path::StreamStatus;
            }
            if let Some(client) = rest.strip_prefix("heartbeat/") {
                if !client.is_empty() && !client.contains('/') {
                    return Path::StreamHeartbeat(client.to_owned());
                }
                return Path::NotFound;
            }
            if let Some(camera) = CameraKind::parse(rest) {
                return Path::StreamCamera(camera);
            }
            return Path::NotFound;
        }
        if let Some(rest) = path.strip_prefix("storage/") {
            match rest {
                "status" => return Path::StorageStatus,
                "devices" => return Path::StorageDevices,
                "settings" => return Path::StorageSettingsSet,
                "clean" => return Path::StorageClean,
                _ => {}
            }
            if let Some(dev) = rest.strip_prefix("mount/") {
                if !dev.is_empty() && !dev.contains('/') {
                    return Path::StorageMount(dev.to_owned());
                }
            }
            if let Some(dev) = rest.strip_prefix("eject/") {
                if !dev.is_empty() && !dev.contains('/') {
                    return Path::StorageEject(dev.to_owned());
                }
            }
            return Path::NotFound;
        }
        if let Some(rest) = path.strip_prefix("geodata/") {
            let Some(slash) = rest.find('/') else {
                return Path::NotFound;
            };
            let (trip, op) = rest.split_at(slash);
            if trip.is_empty() {
                return Path::NotFound;
            }
            let trip = trip.to_owned();
            return match &op[1..] {
                "download" => Path::GeodataDownload(trip),
                "pause" => Path::GeodataPause(trip),
                "resume" => Path::GeodataResume(trip),
                "cancel" => Path::GeodataCancel(trip),
                "status" => Path::GeodataStatus(trip),
                "stream" => Path::GeodataStream(trip),
                _ => Path::NotFound,
            };
        }
        Path::NotFound
    }
}

/// What the settings endpoint needs from the capture side. A trait so web
/// tests don't have to assemble the full camera stack.
pub trait CaptureControl: Send + Sync {
    fn apply_settings(&self, settings: &serde_json::Map<String, serde_json::Value>);
}

impl<C: Clocks + Clone> CaptureControl for CaptureManager<C> {
    fn apply_settings(&self, settings: &serde_json::Map<String, serde_json::Value>) {
        CaptureManager::apply_settings(self, settings)
    }
}

/// Request body of `POST /api/geodata/<trip>/download`.
#[derive(Debug, serde::Deserialize)]
struct DownloadRequest {
    waypoints: Vec<WaypointBody>,
    #[serde(default)]
    radius_km: Option<f64>,
    #[serde(default)]
    use_single_center: bool,
    #[serde(default)]
    single_center: Option<CenterBody>,
}

#[derive(Debug, serde::Deserialize)]
struct WaypointBody {
    lat: f64,
    lon: f64,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct CenterBody {
    lat: f64,
    lon: f64,
    radius_km: f64,
}

/// Shared context of the HTTP handlers.
pub struct WebContext<C: Clocks + Clone> {
    pub hub: Arc<MjpegHub<C>>,
    pub downloader: Arc<GeodataDownloader<C>>,
    pub disk: Arc<DiskManager<C>>,
    pub capture: Arc<dyn CaptureControl>,
}

fn json_response(status: StatusCode, body: &impl serde::Serialize) -> Response<Body> {
    let json = serde_json::to_string(body).expect("responses always serialize");
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from(json))
        .expect("valid response")
}

fn plain_response(status: StatusCode, msg: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(msg))
        .expect("valid response")
}

fn stream_headers(builder: http::response::Builder) -> http::response::Builder {
    builder
        .header(
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate",
        )
        .header(header::CONNECTION, "close")
        .header("X-Accel-Buffering", "no")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
}

/// Dispatches one request. `remote_ip` feeds the per-IP connection cap.
pub async fn serve<C, B>(
    ctx: Arc<WebContext<C>>,
    remote_ip: IpAddr,
    req: Request<B>,
) -> Response<Body>
where
    C: Clocks + Clone,
    B: http_body::Body + Unpin,
    B::Error: std::fmt::Display,
{
    let path = Path::decode(req.uri().path());
    let method = req.method().clone();
    debug!(%method, path = ?path, "request");
    match (&method, path) {
        (&Method::GET, Path::StreamCamera(camera)) => stream_camera(ctx, remote_ip, camera),
        (&Method::POST, Path::StreamHeartbeat(client)) => heartbeat(ctx, &client, req.uri().query()),
        (&Method::GET, Path::StreamStatus) => json_response(StatusCode::OK, &ctx.hub.status()),
        (&Method::POST, Path::GeodataDownload(trip)) => geodata_download(ctx, trip, req).await,
        (&Method::POST, Path::GeodataPause(trip)) => geodata_control(ctx, &trip, "pause"),
        (&Method::POST, Path::GeodataResume(trip)) => geodata_control(ctx, &trip, "resume"),
        (&Method::POST, Path::GeodataCancel(trip)) => geodata_control(ctx, &trip, "cancel"),
        (&Method::GET, Path::GeodataStatus(trip)) => geodata_status(ctx, &trip),
        (&Method::GET, Path::GeodataStream(trip)) => geodata_stream(ctx, trip),
        (&Method::GET, Path::StorageStatus) => storage_status(ctx),
        (&Method::GET, Path::StorageDevices) => storage_devices(ctx),
        (&Method::POST, Path::StorageSettingsSet) => storage_settings_set(ctx, req).await,
        (&Method::POST, Path::StorageClean) => storage_clean(ctx),
        (&Method::POST, Path::StorageMount(dev)) => storage_mount(ctx, &dev),
        (&Method::POST, Path::StorageEject(dev)) => storage_eject(ctx, &dev),
        (&Method::POST, Path::CameraSettingsSet) => camera_settings_set(ctx, req).await,
        (_, Path::NotFound) => plain_response(StatusCode::NOT_FOUND, "no such endpoint"),
        _ => plain_response(StatusCode::METHOD_NOT_ALLOWED, "bad method"),
    }
}

fn storage_status<C: Clocks + Clone>(ctx: Arc<WebContext<C>>) -> Response<Body> {
    match ctx.disk.data_usage() {
        Ok(usage) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "usage": usage,
                "settings": ctx.disk.settings(),
            }),
        ),
        Err(e) => {
            warn!(err = %e.chain(), "disk usage failed");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "disk usage failed")
        }
    }
}

fn storage_devices<C: Clocks + Clone>(ctx: Arc<WebContext<C>>) -> Response<Body> {
    match ctx.disk.list_block_devices() {
        Ok(devices) => json_response(StatusCode::OK, &devices),
        Err(e) => {
            warn!(err = %e.chain(), "device enumeration failed");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "device enumeration failed")
        }
    }
}

async fn storage_settings_set<C, B>(ctx: Arc<WebContext<C>>, req: Request<B>) -> Response<Body>
where
    C: Clocks + Clone,
    B: http_body::Body + Unpin,
    B::Error: std::fmt::Display,
{
    let Some(bytes) = read_body(req).await else {
        return plain_response(StatusCode::BAD_REQUEST, "unreadable body");
    };
    let settings: StorageSettings = match serde_json::from_slice(&bytes) {
        Ok(s) => s,
        Err(e) => {
            warn!(err = %e, "malformed storage settings");
            return plain_response(StatusCode::BAD_REQUEST, "malformed settings");
        }
    };
    match ctx.disk.apply_settings(settings) {
        Ok(()) => json_response(StatusCode::OK, &ctx.disk.settings()),
        Err(e) => {
            warn!(err = %e.chain(), "unable to persist settings");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "unable to persist settings")
        }
    }
}

/// Manual retention sweep, ignoring the usage threshold.
fn storage_clean<C: Clocks + Clone>(ctx: Arc<WebContext<C>>) -> Response<Body> {
    let days = ctx.disk.settings().auto_clean_days;
    match ctx.disk.clean_older_than_days(days) {
        Ok(report) => json_response(StatusCode::OK, &report),
        Err(e) => {
            warn!(err = %e.chain(), "manual cleanup failed");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "cleanup failed")
        }
    }
}

fn storage_mount<C: Clocks + Clone>(ctx: Arc<WebContext<C>>, device: &str) -> Response<Body> {
    let dev_path = std::path::PathBuf::from(format!("/dev/{device}"));
    let mount_point = ctx.disk.settings().mount_point;
    match ctx.disk.mount_drive(&dev_path, &mount_point) {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "status": "mounted" })),
        Err(e) => {
            warn!(err = %e.chain(), "mount failed");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "mount failed")
        }
    }
}

fn storage_eject<C: Clocks + Clone>(ctx: Arc<WebContext<C>>, device: &str) -> Response<Body> {
    let drives = match ctx.disk.list_usb_drives() {
        Ok(d) => d,
        Err(e) => {
            warn!(err = %e.chain(), "device enumeration failed");
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "device enumeration failed");
        }
    };
    let Some(drive) = drives.iter().find(|d| d.name == device) else {
        return plain_response(StatusCode::NOT_FOUND, "no such removable device");
    };
    match ctx.disk.safe_eject(drive) {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "status": "ejected" })),
        Err(e) => {
            warn!(err = %e.chain(), "eject failed");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "eject failed")
        }
    }
}

/// `POST /api/settings`: forwards a settings map to the capture side.
async fn camera_settings_set<C, B>(ctx: Arc<WebContext<C>>, req: Request<B>) -> Response<Body>
where
    C: Clocks + Clone,
    B: http_body::Body + Unpin,
    B::Error: std::fmt::Display,
{
    let Some(bytes) = read_body(req).await else {
        return plain_response(StatusCode::BAD_REQUEST, "unreadable body");
    };
    let map: serde_json::Map<String, serde_json::Value> = match serde_json::from_slice(&bytes) {
        Ok(m) => m,
        Err(e) => {
            warn!(err = %e, "malformed settings map");
            return plain_response(StatusCode::BAD_REQUEST, "malformed settings");
        }
    };
    ctx.capture.apply_settings(&map);
    json_response(StatusCode::OK, &serde_json::json!({ "status": "applied" }))
}

async fn read_body<B>(req: Request<B>) -> Option<bytes::Bytes>
where
    B: http_body::Body + Unpin,
    B::Error: std::fmt::Display,
{
    match req.into_body().collect().await {
        Ok(b) => Some(b.to_bytes()),
        Err(e) => {
            warn!(err = %e, "unable to read request body");
            None
        }
    }
}

/// `GET /api/stream/{camera}`: registers the client and spawns its
/// generator, returning the multipart stream.
fn stream_camera<C: Clocks + Clone>(
    ctx: Arc<WebContext<C>>,
    remote_ip: IpAddr,
    camera: CameraKind,
) -> Response<Body> {
    let builder = stream_headers(Response::builder()).header(
        header::CONTENT_TYPE,
        HeaderValue::from_static("multipart/x-mixed-replace; boundary=frame"),
    );
    match ctx.hub.register_client(camera, remote_ip) {
        Ok(handle) => {
            let (sender, body) = Body::channel();
            tokio::spawn(mjpeg_generator(ctx, handle, sender));
            builder.body(body).expect("valid response")
        }
        Err(RegisterError::TooManyFromIp) => {
            plain_response(StatusCode::TOO_MANY_REQUESTS, "too many connections")
        }
        Err(RegisterError::CameraBusy) => {
            // One informative frame, then close.
            let part = ctx
                .hub
                .placeholder_part(camera, "Too many viewers on this camera");
            builder.body(Body::from(part)).expect("valid response")
        }
    }
}

/// Per-client generator: immediate frame, then queue reads with 1 s
/// timeouts and placeholder keep-alives. Every error path funnels into the
/// idempotent cleanup.
async fn mjpeg_generator<C: Clocks + Clone>(
    ctx: Arc<WebContext<C>>,
    handle: ClientHandle,
    sender: BodySender,
) {
    let hub = &ctx.hub;
    let first = hub
        .cached_frame(handle.camera)
        .unwrap_or_else(|| hub.placeholder_part(handle.camera, "Waiting for camera"));
    if sender.send(first).await.is_err() {
        hub.cleanup_client(&handle.id, "disconnected before first frame");
        return;
    }
    let mut timeouts = 0u32;
    loop {
        if !hub.is_active(&handle.id) {
            break;
        }
        match tokio::time::timeout(GENERATOR_TIMEOUT, handle.queue.recv()).await {
            Ok(part) => {
                if sender.send(part).await.is_err() {
                    break;
                }
                hub.note_frame_sent(&handle.id);
                timeouts = 0;
            }
            Err(_) => {
                timeouts += 1;
                // Hidden tabs only get an occasional placeholder to keep
                // the connection alive.
                let send_placeholder = if hub.is_visible(&handle.id) {
                    true
                } else {
                    timeouts % HIDDEN_KEEPALIVE_EVERY == 0
                };
                if send_placeholder {
                    let part = hub.placeholder_part(handle.camera, "Waiting for camera");
                    if sender.send(part).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    hub.cleanup_client(&handle.id, "stream ended");
}

/// `POST /api/stream/heartbeat/{client}?visible=&disconnect=`.
fn heartbeat<C: Clocks + Clone>(
    ctx: Arc<WebContext<C>>,
    client: &str,
    query: Option<&str>,
) -> Response<Body> {
    let mut visible = None;
    let mut disconnect = false;
    for pair in query.unwrap_or("").split('&') {
        match pair.split_once('=') {
            Some(("visible", v)) => visible = Some(v == "true"),
            Some(("disconnect", v)) => disconnect = v == "true",
            _ => {}
        }
    }
    if ctx.hub.heartbeat(client, visible, disconnect) {
        json_response(StatusCode::OK, &serde_json::json!({ "status": "ok" }))
    } else {
        json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({ "status": "unknown client" }),
        )
    }
}

async fn geodata_download<C, B>(
    ctx: Arc<WebContext<C>>,
    trip_id: String,
    req: Request<B>,
) -> Response<Body>
where
    C: Clocks + Clone,
    B: http_body::Body + Unpin,
    B::Error: std::fmt::Display,
{
    let Some(body) = read_body(req).await else {
        return plain_response(StatusCode::BAD_REQUEST, "unreadable body");
    };
    let request: DownloadRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(err = %e, "malformed download request");
            return plain_response(StatusCode::BAD_REQUEST, "malformed request");
        }
    };
    if request.waypoints.is_empty() && request.single_center.is_none() {
        return plain_response(StatusCode::BAD_REQUEST, "no waypoints");
    }
    if let Some(p) = ctx.downloader.registry().get(&trip_id) {
        if p.status == geodata::Status::Downloading || p.status == geodata::Status::Paused {
            return json_response(
                StatusCode::CONFLICT,
                &serde_json::json!({ "status": "in_progress" }),
            );
        }
    }
    let job = GeodataJob {
        trip_id: trip_id.clone(),
        waypoints: request
            .waypoints
            .into_iter()
            .map(|w| Waypoint {
                lat: w.lat,
                lon: w.lon,
                name: w.name,
            })
            .collect(),
        radius_km: request.radius_km,
        single_center: request.single_center.map(|c| (c.lat, c.lon, c.radius_km)),
        use_single_center: request.use_single_center,
    };
    let downloader = ctx.downloader.clone();
    info!(%trip_id, "starting geodata download");
    tokio::spawn(async move { downloader.run(job).await });
    json_response(
        StatusCode::OK,
        &serde_json::json!({ "status": "started", "trip_id": trip_id }),
    )
}

fn geodata_control<C: Clocks + Clone>(
    ctx: Arc<WebContext<C>>,
    trip_id: &str,
    op: &'static str,
) -> Response<Body> {
    let registry = ctx.downloader.registry();
    let ok = match op {
        "pause" => registry.pause(trip_id),
        "resume" => registry.resume(trip_id),
        "cancel" => registry.cancel(trip_id),
        _ => unreachable!("ops are fixed at the call sites"),
    };
    if ok {
        json_response(StatusCode::OK, &serde_json::json!({ "status": op }))
    } else {
        json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({ "status": "not_found" }),
        )
    }
}

fn geodata_status<C: Clocks + Clone>(ctx: Arc<WebContext<C>>, trip_id: &str) -> Response<Body> {
    match ctx.downloader.registry().get(trip_id) {
        Some(p) => json_response(StatusCode::OK, &p),
        None => json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({ "status": "not_found" }),
        ),
    }
}

/// `GET /api/geodata/{trip}/stream`: SSE progress until a terminal event.
fn geodata_stream<C: Clocks + Clone>(ctx: Arc<WebContext<C>>, trip_id: String) -> Response<Body> {
    let (sender, body) = Body::channel();
    tokio::spawn(async move {
        let registry = ctx.downloader.registry().clone();
        loop {
            let event = match registry.get(&trip_id) {
                Some(p) => {
                    let done = p.status == geodata::Status::Complete
                        || p.status == geodata::Status::Error;
                    let json = serde_json::to_string(&p).expect("progress serializes");
                    let chunk = bytes::Bytes::from(format!("data: {json}\n\n"));
                    if sender.send(chunk).await.is_err() || done {
                        break;
                    }
                    false
                }
                None => true,
            };
            if event {
                // Cancelled (or never existed): emit the terminal stopped
                // event and end the stream.
                let stopped = serde_json::json!({
                    "trip_id": trip_id,
                    "status": "stopped",
                    "current_phase": "stopped",
                });
                let _ = sender
                    .send(bytes::Bytes::from(format!("data: {stopped}\n\n")))
                    .await;
                break;
            }
            tokio::time::sleep(SSE_POLL).await;
        }
    });
    stream_headers(Response::builder())
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .expect("valid response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use bytes::Bytes;
    use db::GeocodeDb;
    use http_body_util::Full;
    use jiff::Timestamp;

    /// Records settings maps forwarded through the endpoint.
    #[derive(Default)]
    struct StubCapture {
        applied: std::sync::Mutex<Vec<serde_json::Map<String, serde_json::Value>>>,
    }

    impl CaptureControl for StubCapture {
        fn apply_settings(&self, settings: &serde_json::Map<String, serde_json::Value>) {
            self.applied.lock().unwrap().push(settings.clone());
        }
    }

    struct TestCtx {
        ctx: Arc<WebContext<SimulatedClocks>>,
        capture: Arc<StubCapture>,
        _tmp: tempfile::TempDir,
    }

    fn test_ctx() -> TestCtx {
        let tmp = tempfile::tempdir().unwrap();
        let clocks = SimulatedClocks::new(Timestamp::UNIX_EPOCH);
        let hub = Arc::new(MjpegHub::new(clocks.clone(), None));
        let store = Arc::new(GeocodeDb::open_in_memory(clocks.clone()).unwrap());
        let downloader = Arc::new(GeodataDownloader::new(
            Arc::new(geodata::ProgressRegistry::new()),
            store,
            geodata::NominatimClient::new("http://127.0.0.1:1/reverse").unwrap(),
        ));
        let paths = crate::config::Paths::resolve(Some(tmp.path().join("data"))).unwrap();
        let trip_db = Arc::new(db::Database::open_in_memory(clocks.clone()).unwrap());
        let disk = Arc::new(DiskManager::new(
            paths,
            trip_db,
            StorageSettings::default(),
        ));
        let capture = Arc::new(StubCapture::default());
        TestCtx {
            ctx: Arc::new(WebContext {
                hub,
                downloader,
                disk,
                capture: capture.clone(),
            }),
            capture,
            _tmp: tmp,
        }
    }

    fn ctx() -> Arc<WebContext<SimulatedClocks>> {
        let t = test_ctx();
        // The tempdir must outlive the context for disk usage queries.
        std::mem::forget(t._tmp);
        t.ctx
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn post(path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_owned())))
            .unwrap()
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, last))
    }

    #[test]
    fn path_decoding() {
        assert_eq!(
            Path::decode("/api/stream/road"),
            Path::StreamCamera(CameraKind::Road)
        );
        assert_eq!(
            Path::decode("/api/stream/interior"),
            Path::StreamCamera(CameraKind::Interior)
        );
        assert_eq!(Path::decode("/api/stream/status"), Path::StreamStatus);
        assert_eq!(
            Path::decode("/api/stream/heartbeat/road-3"),
            Path::StreamHeartbeat("road-3".to_owned())
        );
        assert_eq!(Path::decode("/api/stream/heartbeat/"), Path::NotFound);
        assert_eq!(
            Path::decode("/api/geodata/trip-9/download"),
            Path::GeodataDownload("trip-9".to_owned())
        );
        assert_eq!(
            Path::decode("/api/geodata/trip-9/stream"),
            Path::GeodataStream("trip-9".to_owned())
        );
        assert_eq!(Path::decode("/api/geodata/trip-9/bogus"), Path::NotFound);
        assert_eq!(Path::decode("/api/geodata//pause"), Path::NotFound);
        assert_eq!(Path::decode("/api/stream/rear"), Path::NotFound);
        assert_eq!(Path::decode("/api/storage/status"), Path::StorageStatus);
        assert_eq!(Path::decode("/api/storage/devices"), Path::StorageDevices);
        assert_eq!(
            Path::decode("/api/storage/settings"),
            Path::StorageSettingsSet
        );
        assert_eq!(Path::decode("/api/storage/clean"), Path::StorageClean);
        assert_eq!(
            Path::decode("/api/storage/mount/sdb1"),
            Path::StorageMount("sdb1".to_owned())
        );
        assert_eq!(
            Path::decode("/api/storage/eject/sdb"),
            Path::StorageEject("sdb".to_owned())
        );
        assert_eq!(Path::decode("/api/storage/eject/"), Path::NotFound);
        assert_eq!(Path::decode("/api/settings"), Path::CameraSettingsSet);
        assert_eq!(Path::decode("/metrics"), Path::NotFound);
    }

    #[tokio::test]
    async fn stream_has_multipart_headers() {
        let ctx = ctx();
        let resp = serve(ctx.clone(), ip(1), get("/api/stream/road")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );
        assert_eq!(
            resp.headers()[header::CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(resp.headers()["X-Accel-Buffering"], "no");
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(ctx.hub.status().active_clients_road, 1);
    }

    #[tokio::test]
    async fn fourth_connection_from_ip_is_429() {
        let ctx = ctx();
        // Hold the streaming responses so the clients stay registered.
        let mut held = Vec::new();
        for _ in 0..3 {
            let resp = serve(ctx.clone(), ip(7), get("/api/stream/road")).await;
            assert_eq!(resp.status(), StatusCode::OK);
            held.push(resp);
        }
        let resp = serve(ctx.clone(), ip(7), get("/api/stream/road")).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        // A different IP still connects.
        let resp = serve(ctx.clone(), ip(8), get("/api/stream/road")).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sixth_camera_client_gets_single_frame() {
        let ctx = ctx();
        let mut held = Vec::new();
        for i in 0..5 {
            held.push(serve(ctx.clone(), ip(i), get("/api/stream/interior")).await);
        }
        let resp = serve(ctx.clone(), ip(100), get("/api/stream/interior")).await;
        // Informative single-frame body, not a live stream.
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.starts_with(b"--frame\r\n"));
        assert_eq!(ctx.hub.status().active_clients_interior, 5);
    }

    #[tokio::test]
    async fn heartbeat_and_disconnect() {
        let ctx = ctx();
        serve(ctx.clone(), ip(1), get("/api/stream/road")).await;
        let id = {
            // The only client; find its id via a status round trip is not
            // exposed, so register a named one directly.
            let handle = ctx.hub.register_client(CameraKind::Road, ip(2)).unwrap();
            handle.id
        };
        let resp = serve(
            ctx.clone(),
            ip(2),
            post(&format!("/api/stream/heartbeat/{id}?visible=false"), ""),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!ctx.hub.is_visible(&id));

        let resp = serve(
            ctx.clone(),
            ip(2),
            post(&format!("/api/stream/heartbeat/{id}?disconnect=true"), ""),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!ctx.hub.is_active(&id));

        let resp = serve(
            ctx.clone(),
            ip(2),
            post("/api/stream/heartbeat/nonexistent", ""),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn geodata_endpoints_route_to_registry() {
        let ctx = ctx();
        // Unknown trip everywhere.
        let resp = serve(ctx.clone(), ip(1), get("/api/geodata/t1/status")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = serve(ctx.clone(), ip(1), post("/api/geodata/t1/pause", "")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = serve(ctx.clone(), ip(1), post("/api/geodata/t1/cancel", "")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // Malformed download bodies are rejected.
        let resp = serve(ctx.clone(), ip(1), post("/api/geodata/t1/download", "{")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = serve(
            ctx.clone(),
            ip(1),
            post("/api/geodata/t1/download", r#"{"waypoints": []}"#),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // A valid request starts the job (it will fail against the dead
        // endpoint, but it registers).
        let resp = serve(
            ctx.clone(),
            ip(1),
            post(
                "/api/geodata/t1/download",
                r#"{"waypoints": [{"lat": 40.0, "lon": -3.7}], "radius_km": 0.2}"#,
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        // Wait until the worker registers progress.
        for _ in 0..100 {
            if ctx.downloader.registry().get("t1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let resp = serve(ctx.clone(), ip(1), get("/api/geodata/t1/status")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let progress: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(progress["trip_id"], "t1");
    }

    #[tokio::test]
    async fn storage_status_reports_usage_and_settings() {
        let t = test_ctx();
        let resp = serve(t.ctx.clone(), ip(1), get("/api/storage/status")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["usage"]["totalBytes"].is_u64());
        assert_eq!(json["settings"]["autoCleanDays"], 30);
    }

    #[tokio::test]
    async fn storage_settings_round_trip() {
        let t = test_ctx();
        let resp = serve(
            t.ctx.clone(),
            ip(1),
            post(
                "/api/storage/settings",
                r#"{"autoCleanEnabled": true, "autoCleanThreshold": 80, "autoCleanDays": 14,
                    "mountPoint": "/mnt/dashcam_storage", "autoDetectDrives": true}"#,
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(t.ctx.disk.settings().auto_clean_days, 14);
        assert!(t.ctx.disk.settings().auto_clean_enabled);

        let resp = serve(
            t.ctx.clone(),
            ip(1),
            post("/api/storage/settings", "not json"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn storage_clean_reports_empty_sweep() {
        let t = test_ctx();
        let resp = serve(t.ctx.clone(), ip(1), post("/api/storage/clean", "")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["deletedClips"], 0);
    }

    #[tokio::test]
    async fn camera_settings_forward_to_capture() {
        let t = test_ctx();
        let resp = serve(
            t.ctx.clone(),
            ip(1),
            post("/api/settings", r#"{"recording_quality": "high"}"#),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let applied = t.capture.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0]["recording_quality"], "high");
    }

    #[tokio::test]
    async fn eject_unknown_device_is_404() {
        let t = test_ctx();
        let resp = serve(
            t.ctx.clone(),
            ip(1),
            post("/api/storage/eject/nonexistent0", ""),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sse_stream_has_event_headers_and_terminates() {
        let ctx = ctx();
        let resp = serve(ctx.clone(), ip(1), get("/api/geodata/ghost/stream")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
        // No such job: exactly one terminal "stopped" event.
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.starts_with("data: "), "{text}");
        assert!(text.contains("\"status\":\"stopped\""), "{text}");
        assert!(text.ends_with("\n\n"), "{text}");
    }
}
