//! Coordinate conversion utilities.
//!
//! Provides conversions between WGS84 geodetic coordinates (longitude,
//! latitude, altitude) and ECEF (Earth-Centered, Earth-Fixed) coordinates,
//! plus the axis swap between the dataset's Z-up frame and a Y-up scene.

use glam::DVec3;

/// WGS84 semi-major axis in meters.
pub const WGS84_SEMI_MAJOR_AXIS: f64 = 6_378_137.0;

/// WGS84 flattening.
pub const WGS84_FLATTENING: f64 = 1.0 / 298.257_223_563;

/// Convergence threshold for the latitude iteration, in radians.
const LATITUDE_PRECISION: f64 = 1e-12;

/// Upper bound on latitude refinement steps. Converges in a handful for
/// any point near the ellipsoid.
const MAX_ITERATIONS: usize = 64;

/// A geodetic position on the WGS84 ellipsoid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geodetic {
    /// Longitude in degrees.
    pub lon: f64,
    /// Latitude in degrees.
    pub lat: f64,
    /// Height above the ellipsoid in meters.
    pub alt: f64,
}

/// First eccentricity squared of the ellipsoid.
fn eccentricity_squared() -> f64 {
    2.0 * WGS84_FLATTENING - WGS84_FLATTENING * WGS84_FLATTENING
}

/// Radius of curvature in the prime vertical at the given latitude.
fn prime_vertical_radius(sin_lat: f64) -> f64 {
    WGS84_SEMI_MAJOR_AXIS / (1.0 - eccentricity_squared() * sin_lat * sin_lat).sqrt()
}

/// Convert longitude, latitude (degrees) and altitude (meters) to ECEF.
#[must_use]
pub fn geodetic_to_ecef(lon_deg: f64, lat_deg: f64, alt: f64) -> DVec3 {
    let lon = lon_deg.to_radians();
    let lat = lat_deg.to_radians();
    let e2 = eccentricity_squared();
    let n = prime_vertical_radius(lat.sin());

    DVec3::new(
        (n + alt) * lat.cos() * lon.cos(),
        (n + alt) * lat.cos() * lon.sin(),
        ((1.0 - e2) * n + alt) * lat.sin(),
    )
}

/// Convert ECEF coordinates back to a geodetic position.
///
/// Latitude is refined by fixed-point iteration until successive estimates
/// differ by less than 1e-12 radians.
#[must_use]
pub fn ecef_to_geodetic(position: DVec3) -> Geodetic {
    let e2 = eccentricity_squared();
    let p = position.x.hypot(position.y);
    let lon = position.y.atan2(position.x);

    let mut lat = position.z.atan2(p * (1.0 - e2));
    for _ in 0..MAX_ITERATIONS {
        let sin_lat = lat.sin();
        let n = prime_vertical_radius(sin_lat);
        let next = (position.z + e2 * n * sin_lat).atan2(p);
        let delta = (next - lat).abs();
        lat = next;
        if delta < LATITUDE_PRECISION {
            break;
        }
    }

    // Height along the ellipsoid normal; stable at every latitude, unlike
    // dividing by cos(lat) near the poles.
    let (sin_lat, cos_lat) = lat.sin_cos();
    let alt = p * cos_lat + position.z * sin_lat
        - WGS84_SEMI_MAJOR_AXIS * (1.0 - e2 * sin_lat * sin_lat).sqrt();

    Geodetic {
        lon: lon.to_degrees(),
        lat: lat.to_degrees(),
        alt,
    }
}

/// Map a Z-up position (tile bounding volumes, ECEF) into the Y-up scene
/// convention: `(x, y, z)` becomes `(x, z, -y)`.
#[must_use]
pub fn z_up_to_y_up(position: DVec3) -> DVec3 {
    DVec3::new(position.x, position.z, -position.y)
}

/// Inverse of [`z_up_to_y_up`]: map a Y-up scene position, such as a camera,
/// back to Z-up ECEF for [`ecef_to_geodetic`].
#[must_use]
pub fn y_up_to_z_up(position: DVec3) -> DVec3 {
    DVec3::new(position.x, -position.z, position.y)
}
