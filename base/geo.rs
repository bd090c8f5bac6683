// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Great-circle distance helpers shared by the trip store, the landmark
//! index, and the geodata downloader.

/// Mean Earth radius in meters (IUGG).
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two WGS-84 points, in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Haversine distance between two WGS-84 points, in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    haversine_m(lat1, lon1, lat2, lon2) / 1000.0
}

/// Returns true iff `lat`/`lon` are in the valid WGS-84 ranges.
pub fn valid_coords(lat: f64, lon: f64) -> bool {
    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance() {
        assert_eq!(haversine_m(48.85, 2.35, 48.85, 2.35), 0.0);
    }

    #[test]
    fn paris_to_london() {
        // Notre-Dame to Westminster is about 341 km.
        let d = haversine_km(48.8530, 2.3499, 51.4994, -0.1245);
        assert!((d - 341.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn one_degree_latitude() {
        // One degree of latitude is about 111.2 km everywhere.
        let d = haversine_km(10.0, 20.0, 11.0, 20.0);
        assert!((d - 111.2).abs() < 1.0, "got {d}");
    }

    #[test]
    fn coord_validation() {
        assert!(valid_coords(90.0, 180.0));
        assert!(valid_coords(-90.0, -180.0));
        assert!(!valid_coords(90.1, 0.0));
        assert!(!valid_coords(0.0, -180.5));
    }
}
