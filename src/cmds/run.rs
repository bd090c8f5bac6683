// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Subcommand to run the dashcam daemon.
//!
//! Wires the whole system together: trip store, GPS reader, landmark index,
//! camera drivers, recording engine, capture manager, MJPEG hub, disk
//! manager, geodata downloader, and the HTTP surface. Long-lived tasks all
//! hold shutdown receivers and are joined before exit.

use crate::capture::{CaptureManager, CaptureOptions};
use crate::cameras::interior::{InteriorCamera, InteriorConfig};
use crate::cameras::road::{RoadCamera, RoadConfig};
use crate::cameras::CameraKind;
use crate::config::{Paths, StorageSettings};
use crate::disk::DiskManager;
use crate::geodata::{GeodataDownloader, NominatimClient, ProgressRegistry, NOMINATIM_ENDPOINT};
use crate::gps::{GpsConfig, GpsReader};
use crate::landmarks::LandmarkIndex;
use crate::mjpeg::{self, MjpegHub};
use crate::recorder::{CameraHandle, Recorder, RecorderOptions};
use crate::web::{self, WebContext};
use base::clock::RealClocks;
use base::{err, shutdown, Error, ResultExt as _};
use bpaf::Bpaf;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Cadence of the disk retention check.
const RETENTION_CHECK_PERIOD: Duration = Duration::from_secs(300);

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8770))
}

/// Runs the dashcam daemon until SIGINT/SIGTERM.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Directory holding recordings, databases, and settings.
    #[bpaf(external(crate::parse_data_dir))]
    data_dir: Option<PathBuf>,

    /// Socket address to serve the HTTP API on.
    #[bpaf(argument("ADDR"), fallback(default_http_addr()), display_fallback)]
    http_addr: SocketAddr,

    /// V4L2 device of the road camera (CSI/ISP attached).
    #[bpaf(argument("DEVICE"), fallback(String::from("/dev/video0")))]
    road_device: String,

    /// V4L2 device index of the interior USB camera.
    #[bpaf(argument("INDEX"), fallback(1))]
    interior_index: u32,

    /// Serial port of the GPS receiver; omit to run without GPS.
    #[bpaf(argument("PORT"))]
    gps_port: Option<String>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let rt = tokio::runtime::Runtime::new().err_kind(base::ErrorKind::Internal)?;
    rt.block_on(async_run(args))
}

async fn async_run(args: Args) -> Result<i32, Error> {
    let clocks = RealClocks {};
    let paths = Paths::resolve(args.data_dir)?;
    let settings = StorageSettings::load(paths.settings_path())?;
    let db = Arc::new(super::open_database(&paths)?);
    let geocode = Arc::new(db::GeocodeDb::open(clocks, paths.geocoding_db_path())?);
    let landmarks = Arc::new(LandmarkIndex::load(clocks, paths.landmarks_path())?);

    let gps: Arc<GpsReader> = match &args.gps_port {
        Some(port) => match GpsReader::spawn(GpsConfig {
            port: port.clone(),
            ..GpsConfig::default()
        }) {
            Ok(reader) => Arc::new(reader),
            Err(e) => {
                warn!(err = %e.chain(), "GPS unavailable; running without fixes");
                Arc::new(GpsReader::disconnected())
            }
        },
        None => Arc::new(GpsReader::disconnected()),
    };

    let cameras: Vec<CameraHandle> = vec![
        (
            CameraKind::Road,
            Arc::new(Mutex::new(RoadCamera::new(RoadConfig {
                device: args.road_device.clone(),
                ..RoadConfig::default()
            }))) as _,
        ),
        (
            CameraKind::Interior,
            Arc::new(Mutex::new(InteriorCamera::new(InteriorConfig {
                device_index: args.interior_index,
                ..InteriorConfig::default()
            }))) as _,
        ),
    ];
    let recorder = Recorder::new(
        clocks,
        paths.clone(),
        cameras.clone(),
        RecorderOptions::default(),
    );
    let manager = Arc::new(CaptureManager::new(
        clocks,
        paths.clone(),
        db.clone(),
        gps.clone() as _,
        landmarks,
        Some(geocode.clone()),
        cameras,
        recorder,
        CaptureOptions::default(),
    ));
    {
        let manager = manager.clone();
        let errors = tokio::task::spawn_blocking(move || manager.initialize())
            .await
            .expect("camera init does not panic");
        for e in errors {
            warn!("{e}");
        }
    }
    manager.recover_orphan_trip()?;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let hub = Arc::new(MjpegHub::new(clocks, None));
    let mut workers = Vec::new();
    {
        let hub = hub.clone();
        let manager = manager.clone();
        let rx = shutdown_rx.clone();
        workers.push(
            std::thread::Builder::new()
                .name("mjpeg-capture".to_owned())
                .spawn(move || {
                    mjpeg::capture_worker(hub, |kind| manager.get_preview_frame(kind), rx, clocks)
                })
                .err_kind(base::ErrorKind::Internal)?,
        );
    }
    {
        let hub = hub.clone();
        let rx = shutdown_rx.clone();
        workers.push(
            std::thread::Builder::new()
                .name("mjpeg-reaper".to_owned())
                .spawn(move || mjpeg::reaper(hub, rx))
                .err_kind(base::ErrorKind::Internal)?,
        );
    }
    let disk = Arc::new(DiskManager::new(paths.clone(), db.clone(), settings));
    {
        let disk = disk.clone();
        let rx = shutdown_rx.clone();
        workers.push(
            std::thread::Builder::new()
                .name("retention".to_owned())
                .spawn(move || {
                    while rx.wait_for(RETENTION_CHECK_PERIOD).is_ok() {
                        if let Err(e) = disk.maybe_clean() {
                            warn!(err = %e.chain(), "retention sweep failed");
                        }
                    }
                })
                .err_kind(base::ErrorKind::Internal)?,
        );
    }

    let downloader = Arc::new(GeodataDownloader::new(
        Arc::new(ProgressRegistry::new()),
        geocode,
        NominatimClient::new(NOMINATIM_ENDPOINT)?,
    ));
    let ctx = Arc::new(WebContext {
        hub,
        downloader,
        disk,
        capture: manager.clone(),
    });

    let listener = tokio::net::TcpListener::bind(args.http_addr)
        .await
        .map_err(|e| {
            err!(
                Internal,
                source(e),
                msg("unable to bind {}", args.http_addr)
            )
        })?;
    info!(addr = %args.http_addr, "HTTP server listening");

    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let mut sigint =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .err_kind(base::ErrorKind::Internal)?;
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .err_kind(base::ErrorKind::Internal)?;
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT; shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM; shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let service = hyper::service::service_fn(move |req| {
                    let ctx = ctx.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(
                            web::serve(ctx, remote.ip(), req).await,
                        )
                    }
                });
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(err = %e, "connection error");
                    }
                });
            }
        }
    }

    // Orderly shutdown: stop recording (persisting the final clip), wake
    // every worker, drain HTTP connections, then join the threads.
    {
        let manager = manager.clone();
        tokio::task::spawn_blocking(move || manager.cleanup())
            .await
            .expect("cleanup does not panic");
    }
    drop(shutdown_tx);
    tokio::select! {
        _ = graceful.shutdown() => {}
        _ = tokio::time::sleep(Duration::from_secs(5)) => {
            warn!("HTTP connections did not drain in time");
        }
    }
    for worker in workers {
        if worker.join().is_err() {
            error!("worker thread panicked");
        }
    }
    info!("shutdown complete");
    Ok(0)
}
