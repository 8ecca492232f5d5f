//! Maidenhead grid locator parsing and great-circle distance.
//!
//! Locators are parsed with `nom` into their field/square/subsquare indices.
//! A valid locator is exactly 4 or 6 characters:
//!
//! ```text
//! FN42      field (A-R x2), square (0-9 x2)
//! FN42ab    ... plus subsquare (a-x x2)
//! ```

use nom::{
    IResult, Parser,
    character::complete::satisfy,
    combinator::{all_consuming, map, opt},
};

/// Mean earth radius used for distance calculations.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A parsed Maidenhead locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    field_lon: u8,
    field_lat: u8,
    square_lon: u8,
    square_lat: u8,
    subsquare: Option<(u8, u8)>,
}

impl Locator {
    /// Geographic centre of the square (or subsquare) as `(lat, lon)` degrees.
    pub fn center(&self) -> (f64, f64) {
        let mut lon = self.field_lon as f64 * 20.0 - 180.0 + self.square_lon as f64 * 2.0;
        let mut lat = self.field_lat as f64 * 10.0 - 90.0 + self.square_lat as f64;

        match self.subsquare {
            Some((sub_lon, sub_lat)) => {
                lon += sub_lon as f64 * (5.0 / 60.0) + 2.5 / 60.0;
                lat += sub_lat as f64 * (2.5 / 60.0) + 1.25 / 60.0;
            }
            None => {
                lon += 1.0;
                lat += 0.5;
            }
        }

        (lat, lon)
    }

    /// Canonical spelling: upper-case field, lower-case subsquare.
    pub fn to_canonical(&self) -> String {
        let mut s = String::with_capacity(6);
        s.push((b'A' + self.field_lon) as char);
        s.push((b'A' + self.field_lat) as char);
        s.push((b'0' + self.square_lon) as char);
        s.push((b'0' + self.square_lat) as char);
        if let Some((sub_lon, sub_lat)) = self.subsquare {
            s.push((b'a' + sub_lon) as char);
            s.push((b'a' + sub_lat) as char);
        }
        s
    }
}

fn parse_field(input: &str) -> IResult<&str, u8> {
    map(
        satisfy(|c: char| ('A'..='R').contains(&c.to_ascii_uppercase())),
        |c| c.to_ascii_uppercase() as u8 - b'A',
    )
    .parse(input)
}

fn parse_square(input: &str) -> IResult<&str, u8> {
    map(satisfy(|c: char| c.is_ascii_digit()), |c| c as u8 - b'0').parse(input)
}

fn parse_subsquare(input: &str) -> IResult<&str, u8> {
    map(
        satisfy(|c: char| ('a'..='x').contains(&c.to_ascii_lowercase())),
        |c| c.to_ascii_lowercase() as u8 - b'a',
    )
    .parse(input)
}

fn parse_locator(input: &str) -> IResult<&str, Locator> {
    map(
        (
            parse_field,
            parse_field,
            parse_square,
            parse_square,
            opt((parse_subsquare, parse_subsquare)),
        ),
        |(field_lon, field_lat, square_lon, square_lat, subsquare)| Locator {
            field_lon,
            field_lat,
            square_lon,
            square_lat,
            subsquare,
        },
    )
    .parse(input)
}

/// Parse a locator of exactly 4 or 6 characters.
pub fn parse_grid(grid: &str) -> Option<Locator> {
    all_consuming(parse_locator)
        .parse(grid)
        .ok()
        .map(|(_, locator)| locator)
}

/// Whether `grid` is a valid 4 or 6 character Maidenhead locator.
pub fn is_valid_grid(grid: &str) -> bool {
    parse_grid(grid).is_some()
}

/// Centre of a locator as `(lat, lon)`, or `None` if it does not parse.
pub fn grid_to_latlon(grid: &str) -> Option<(f64, f64)> {
    parse_grid(grid).map(|l| l.center())
}

/// Great-circle distance in kilometres.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Distance between the centres of two locators.
pub fn grid_distance_km(from: &str, to: &str) -> Option<f64> {
    let (lat1, lon1) = grid_to_latlon(from)?;
    let (lat2, lon2) = grid_to_latlon(to)?;
    Some(haversine(lat1, lon1, lat2, lon2))
}
