//! Great-circle distance.

use mesh_types::Position;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two fixes, in kilometers.
pub fn haversine_km(a: &Position, b: &Position) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_point_is_zero() {
        let p = Position::new(51.5, -0.12);
        assert!(haversine_km(&p, &p).abs() < 1e-9);
    }

    #[test]
    fn london_to_paris() {
        let london = Position::new(51.5074, -0.1278);
        let paris = Position::new(48.8566, 2.3522);
        let d = haversine_km(&london, &paris);
        assert!((d - 343.5).abs() < 1.0, "got {}", d);
    }
}
