// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! GPS reader.
//!
//! Owns the serial channel to the GNSS receiver, parses NMEA GGA/RMC
//! sentences on a dedicated thread, and publishes the latest fix through a
//! watch channel. Consumers call [`GpsReader::latest`], which is a cheap
//! snapshot and never blocks on IO.

use base::{err, Error};
use std::io::BufRead as _;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

const KNOTS_TO_MPS: f64 = 0.514444;

#[derive(Clone, Debug)]
pub struct GpsConfig {
    /// Serial port path, e.g. `/dev/ttyUSB0` or `/dev/ttyACM0`.
    pub port: String,
    pub baud_rate: u32,
}

impl Default for GpsConfig {
    fn default() -> Self {
        GpsConfig {
            port: "/dev/ttyACM0".into(),
            baud_rate: 9600,
        }
    }
}

/// The latest position snapshot. `fix_quality == 0` means no valid fix;
/// such snapshots carry no coordinates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GpsFix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    /// meters/second, from RMC speed over ground.
    pub speed: Option<f64>,
    /// degrees, from RMC track angle.
    pub heading: Option<f64>,
    pub satellites: Option<u32>,
    pub fix_quality: u8,
}

impl GpsFix {
    /// True iff the fix is good enough to log (`fix_quality >= 1`).
    pub fn is_loggable(&self) -> bool {
        self.fix_quality >= 1 && self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Anything that can produce the latest fix as a cheap snapshot. The
/// capture manager takes this instead of the concrete reader so tests can
/// script positions.
pub trait FixSource: Send + Sync {
    fn latest(&self) -> GpsFix;
}

impl FixSource for GpsReader {
    fn latest(&self) -> GpsFix {
        GpsReader::latest(self)
    }
}

/// Handle to the reader. Dropping it stops the reader thread at its next
/// read timeout.
pub struct GpsReader {
    rx: watch::Receiver<GpsFix>,
    join: Option<std::thread::JoinHandle<()>>,
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl GpsReader {
    /// Opens the serial port and spawns the reader thread.
    pub fn spawn(config: GpsConfig) -> Result<Self, Error> {
        let port = tokio_serial::new(&config.port, config.baud_rate)
            .timeout(Duration::from_secs(2))
            .open_native()
            .map_err(|e| {
                err!(
                    DeviceUnavailable,
                    source(e),
                    msg("unable to open GPS serial port {}", config.port)
                )
            })?;
        info!(port = %config.port, baud = config.baud_rate, "GPS reader starting");
        let (tx, rx) = watch::channel(GpsFix::default());
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop2 = stop.clone();
        let join = std::thread::Builder::new()
            .name("gps-reader".to_owned())
            .spawn(move || read_loop(port, tx, stop2))
            .map_err(|e| err!(Internal, source(e)))?;
        Ok(GpsReader {
            rx,
            join: Some(join),
            stop,
        })
    }

    /// A reader that never produces a fix. Used when no receiver is attached.
    pub fn disconnected() -> Self {
        let (_tx, rx) = watch::channel(GpsFix::default());
        GpsReader {
            rx,
            join: None,
            stop: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// The most recent fix. Cheap; never blocks.
    pub fn latest(&self) -> GpsFix {
        self.rx.borrow().clone()
    }
}

impl Drop for GpsReader {
    fn drop(&mut self) {
        self.stop
            .store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("GPS reader thread panicked");
            }
        }
    }
}

fn read_loop<R: std::io::Read>(
    port: R,
    tx: watch::Sender<GpsFix>,
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
) {
    let mut reader = std::io::BufReader::new(port);
    let mut line = String::new();
    let mut fix = GpsFix::default();
    loop {
        if stop.load(std::sync::atomic::Ordering::Relaxed) {
            break;
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                warn!("GPS serial port closed");
                break;
            }
            Ok(_) => {
                let sentence = line.trim();
                trace!(sentence, "NMEA");
                if let Some(new_fix) = parse_sentence(sentence, &fix) {
                    fix = new_fix;
                    if tx.send(fix.clone()).is_err() {
                        break; // all receivers gone
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!(err = %e, "GPS read error");
                break;
            }
        }
    }
    info!("GPS reader stopped");
}

fn parse_sentence(sentence: &str, current: &GpsFix) -> Option<GpsFix> {
    if !validate_checksum(sentence) {
        trace!("invalid NMEA checksum");
        return None;
    }
    let sentence = sentence.split('*').next()?;
    if sentence.starts_with("$GPGGA") || sentence.starts_with("$GNGGA") {
        parse_gga(sentence)
    } else if sentence.starts_with("$GPRMC") || sentence.starts_with("$GNRMC") {
        parse_rmc(sentence, current)
    } else {
        None
    }
}

fn validate_checksum(sentence: &str) -> bool {
    if !sentence.starts_with('$') {
        return false;
    }
    let Some((data, checksum)) = sentence[1..].split_once('*') else {
        return false;
    };
    let Ok(expected) = u8::from_str_radix(checksum.trim(), 16) else {
        return false;
    };
    data.bytes().fold(0u8, |acc, b| acc ^ b) == expected
}

/// GGA: fix data.
/// `$GPGGA,hhmmss.ss,llll.ll,a,yyyyy.yy,a,q,ss,h.h,a.a,M,g.g,M,x.x,xxxx`
fn parse_gga(sentence: &str) -> Option<GpsFix> {
    let fields: Vec<&str> = sentence.split(',').collect();
    if fields.len() < 15 {
        return None;
    }
    let fix_quality: u8 = fields[6].parse().unwrap_or(0);
    let satellites = fields[7].parse().ok();
    if fix_quality == 0 {
        return Some(GpsFix {
            satellites,
            ..GpsFix::default()
        });
    }
    let latitude = parse_coordinate(fields[2], fields[3])?;
    let longitude = parse_coordinate(fields[4], fields[5])?;
    let altitude = fields[9].parse().ok();
    debug!(latitude, longitude, fix_quality, "GPS fix");
    Some(GpsFix {
        latitude: Some(latitude),
        longitude: Some(longitude),
        altitude,
        speed: None,
        heading: None,
        satellites,
        fix_quality: fix_quality.min(8),
    })
}

/// RMC: recommended minimum. Carries speed over ground and track angle.
/// `$GPRMC,hhmmss.ss,A,llll.ll,a,yyyyy.yy,a,s.s,t.t,ddmmyy,...`
fn parse_rmc(sentence: &str, current: &GpsFix) -> Option<GpsFix> {
    let fields: Vec<&str> = sentence.split(',').collect();
    if fields.len() < 12 {
        return None;
    }
    if fields[2] != "A" {
        return Some(GpsFix {
            satellites: current.satellites,
            ..GpsFix::default()
        });
    }
    let latitude = parse_coordinate(fields[3], fields[4])?;
    let longitude = parse_coordinate(fields[5], fields[6])?;
    let speed = fields[7].parse::<f64>().ok().map(|kn| kn * KNOTS_TO_MPS);
    let heading = fields[8]
        .parse::<f64>()
        .ok()
        .map(|h| h.rem_euclid(360.0));
    Some(GpsFix {
        latitude: Some(latitude),
        longitude: Some(longitude),
        altitude: current.altitude,
        speed,
        heading,
        satellites: current.satellites,
        fix_quality: current.fix_quality.max(1),
    })
}

/// NMEA `ddmm.mmmm` / `dddmm.mmmm` to decimal degrees.
fn parse_coordinate(value: &str, direction: &str) -> Option<f64> {
    if value.is_empty() {
        return None;
    }
    let value: f64 = value.parse().ok()?;
    let degrees = (value / 100.0).floor();
    let minutes = value - degrees * 100.0;
    let mut decimal = degrees + minutes / 60.0;
    if direction == "S" || direction == "W" {
        decimal = -decimal;
    }
    Some(decimal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_validation() {
        assert!(validate_checksum(
            "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,47.0,M,,*4F"
        ));
        assert!(!validate_checksum(
            "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,47.0,M,,*00"
        ));
        assert!(!validate_checksum("$GPGGA,123519,4807.038,N"));
        assert!(!validate_checksum("GPGGA,123519*4F"));
    }

    #[test]
    fn coordinate_parsing() {
        let lat = parse_coordinate("4807.038", "N").unwrap();
        assert!((lat - 48.1173).abs() < 0.001);
        let lon = parse_coordinate("01131.000", "E").unwrap();
        assert!((lon - 11.5167).abs() < 0.001);
        assert!(parse_coordinate("3723.456", "S").unwrap() < 0.0);
        assert!(parse_coordinate("12212.345", "W").unwrap() < 0.0);
        assert!(parse_coordinate("", "N").is_none());
    }

    #[test]
    fn gga_with_fix() {
        let fix = parse_gga("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,47.0,M,,")
            .unwrap();
        assert!(fix.is_loggable());
        assert_eq!(fix.fix_quality, 1);
        assert_eq!(fix.satellites, Some(8));
        assert!((fix.latitude.unwrap() - 48.1173).abs() < 0.001);
        assert!((fix.altitude.unwrap() - 545.4).abs() < 0.1);
    }

    #[test]
    fn gga_without_fix() {
        let fix = parse_gga("$GPGGA,123519,,,,,0,00,,,,,,,").unwrap();
        assert!(!fix.is_loggable());
        assert_eq!(fix.fix_quality, 0);
        assert_eq!(fix.latitude, None);
    }

    #[test]
    fn rmc_carries_speed_and_heading() {
        let current = GpsFix {
            altitude: Some(545.4),
            satellites: Some(8),
            fix_quality: 1,
            ..GpsFix::default()
        };
        let fix = parse_rmc(
            "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W",
            &current,
        )
        .unwrap();
        assert!(fix.is_loggable());
        // 22.4 knots ≈ 11.5 m/s.
        assert!((fix.speed.unwrap() - 11.52).abs() < 0.05);
        assert!((fix.heading.unwrap() - 84.4).abs() < 0.01);
        assert_eq!(fix.altitude, Some(545.4)); // kept from GGA
    }

    #[test]
    fn rmc_void_clears_fix() {
        let current = GpsFix {
            fix_quality: 1,
            satellites: Some(8),
            ..GpsFix::default()
        };
        let fix = parse_rmc("$GPRMC,123519,V,,,,,,,230394,,", &current).unwrap();
        assert!(!fix.is_loggable());
        assert_eq!(fix.satellites, Some(8));
    }

    #[test]
    fn disconnected_reader_has_no_fix() {
        let r = GpsReader::disconnected();
        assert!(!r.latest().is_loggable());
    }
}
