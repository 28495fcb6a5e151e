//! Postcodes and the distances the travel simulation flies between them.

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// A location with coordinates supplied by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Postcode {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres from the restaurant; 0 for the restaurant's own postcode.
    pub distance: f64,
}

impl Postcode {
    /// A postcode with no restaurant to measure against yet.
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
            distance: 0.0,
        }
    }

    /// A postcode whose distance is measured from `origin`.
    pub fn measured_from(
        name: impl Into<String>,
        latitude: f64,
        longitude: f64,
        origin: &Postcode,
    ) -> Self {
        let mut postcode = Self::new(name, latitude, longitude);
        postcode.distance = postcode.distance_to(origin);
        postcode
    }

    /// Great-circle distance in metres, rounded to 2 decimals.
    pub fn distance_to(&self, other: &Postcode) -> f64 {
        let lat_distance = (self.latitude - other.latitude).to_radians();
        let lon_distance = (self.longitude - other.longitude).to_radians();
        let a = (lat_distance / 2.0).sin().powi(2)
            + other.latitude.to_radians().cos()
                * self.latitude.to_radians().cos()
                * (lon_distance / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        round2(EARTH_RADIUS_KM * c * 1000.0)
    }
}

/// The restaurant drones depart from and return to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Restaurant {
    pub name: String,
    pub postcode: Postcode,
}

impl Restaurant {
    pub fn new(name: impl Into<String>, mut postcode: Postcode) -> Self {
        postcode.distance = 0.0;
        Self {
            name: name.into(),
            postcode,
        }
    }

    pub fn is_home(&self, postcode: &Postcode) -> bool {
        self.postcode.name == postcode.name
    }

    /// Length of a leg. Legs touching the restaurant use the precomputed
    /// distance of the other endpoint.
    pub fn leg_distance(&self, source: &Postcode, destination: &Postcode) -> f64 {
        if self.is_home(source) {
            destination.distance
        } else if self.is_home(destination) {
            source.distance
        } else {
            source.distance_to(destination)
        }
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> Restaurant {
        Restaurant::new("Southampton Sushi", Postcode::new("SO17 1BJ", 50.9370, -1.3960))
    }

    #[test]
    fn distance_is_symmetric_and_rounded() {
        let a = Postcode::new("SO17 1BJ", 50.9370, -1.3960);
        let b = Postcode::new("SO17 1TW", 50.9320, -1.4040);
        let ab = a.distance_to(&b);
        assert_eq!(ab, b.distance_to(&a));
        assert_eq!(ab, round2(ab));
        // Roughly 780m between these two campus postcodes.
        assert!(ab > 700.0 && ab < 850.0, "unexpected distance {ab}");
    }

    #[test]
    fn legs_from_home_use_precomputed_distance() {
        let restaurant = home();
        let mut customer = Postcode::measured_from("SO15 1AA", 50.9100, -1.4200, &restaurant.postcode);
        // Pretend the stored distance differs from the geometric one.
        customer.distance = 1234.0;
        assert_eq!(restaurant.leg_distance(&restaurant.postcode, &customer), 1234.0);
        assert_eq!(restaurant.leg_distance(&customer, &restaurant.postcode), 1234.0);
    }

    #[test]
    fn legs_between_suppliers_are_computed_directly() {
        let restaurant = home();
        let a = Postcode::measured_from("SO16 3AA", 50.9300, -1.4300, &restaurant.postcode);
        let b = Postcode::measured_from("SO14 0AA", 50.9000, -1.4000, &restaurant.postcode);
        assert_eq!(restaurant.leg_distance(&a, &b), a.distance_to(&b));
    }
}
