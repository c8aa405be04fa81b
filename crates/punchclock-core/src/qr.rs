//! Decoded QR payloads posted at each punch point.
//!
//! The code is forwarded to the server verbatim; parsing here only serves
//! display and an early distance check. The server stays the authority on
//! whether a location is acceptable.
//!
//! Recognized layouts, tried in order:
//!
//! - `company|area|code|lat,lng|establishment|...`
//! - `lat,lng|...`
//! - JSON object with `lat` and `lng` numbers
//! - bare `lat,lng`
//!
//! Anything else is kept as an opaque code.

use serde::Deserialize;

use crate::models::DeviceLocation;

/// Mean Earth radius used by the haversine formula.
const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Distance from the punch point the server accepts by default.
pub const DEFAULT_MAX_DISTANCE_METERS: f64 = 700.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// `None` when either value is out of range.
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }

    /// Great-circle distance in metres.
    pub fn distance_to(&self, other: &Coordinates) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = lat2 - lat1;
        let dlng = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_METERS * c
    }
}

impl From<&DeviceLocation> for Coordinates {
    fn from(location: &DeviceLocation) -> Self {
        Self {
            latitude: location.latitude,
            longitude: location.longitude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrFormat {
    /// `company|area|code|lat,lng|establishment|...`
    Standard,
    /// `lat,lng|...`
    CoordinatesFirst,
    Json,
    /// Bare `lat,lng`
    CoordinatesOnly,
    /// No coordinates found
    Opaque,
}

/// Site details carried by the standard layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrSite {
    pub company: String,
    pub area: String,
    pub code: String,
    pub establishment: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QrPayload {
    raw: String,
    format: QrFormat,
    coordinates: Option<Coordinates>,
    site: Option<QrSite>,
}

#[derive(Deserialize)]
struct JsonPoint {
    lat: f64,
    lng: f64,
}

/// A signed decimal without exponent, e.g. `-12.0464`.
fn parse_decimal(s: &str) -> Option<f64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    let mut parts = digits.splitn(2, '.');
    let int = parts.next()?;
    let frac = parts.next().unwrap_or("");
    if int.is_empty()
        || !int.bytes().all(|b| b.is_ascii_digit())
        || !frac.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    s.parse().ok()
}

/// `lat,lng` with optional whitespace after the comma.
fn parse_pair(s: &str) -> Option<Coordinates> {
    let (lat, lng) = s.split_once(',')?;
    Coordinates::new(parse_decimal(lat.trim())?, parse_decimal(lng.trim())?)
}

impl QrPayload {
    /// Parse a scanned code. `None` for an empty payload.
    pub fn parse(code: &str) -> Option<Self> {
        let raw = code.trim();
        if raw.is_empty() {
            return None;
        }

        let fields: Vec<&str> = raw.split('|').collect();

        let (format, coordinates, site) = if let Some(coords) =
            (fields.len() >= 5).then(|| parse_pair(fields[3])).flatten()
        {
            let site = QrSite {
                company: fields[0].trim().to_string(),
                area: fields[1].trim().to_string(),
                code: fields[2].trim().to_string(),
                establishment: fields[4].trim().to_string(),
            };
            (QrFormat::Standard, Some(coords), Some(site))
        } else if let Some(coords) = (fields.len() >= 2).then(|| parse_pair(fields[0])).flatten() {
            (QrFormat::CoordinatesFirst, Some(coords), None)
        } else if let Some(coords) = serde_json::from_str::<JsonPoint>(raw)
            .ok()
            .and_then(|p| Coordinates::new(p.lat, p.lng))
        {
            (QrFormat::Json, Some(coords), None)
        } else if let Some(coords) = parse_pair(raw) {
            (QrFormat::CoordinatesOnly, Some(coords), None)
        } else {
            (QrFormat::Opaque, None, None)
        };

        Some(Self {
            raw: raw.to_string(),
            format,
            coordinates,
            site,
        })
    }

    /// The trimmed code, as submitted to the server.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn format(&self) -> QrFormat {
        self.format
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        self.coordinates
    }

    pub fn site(&self) -> Option<&QrSite> {
        self.site.as_ref()
    }

    /// Distance in metres between the device and the punch point, when both
    /// are known.
    pub fn distance_from(&self, location: &DeviceLocation) -> Option<f64> {
        let point = self.coordinates?;
        let device = Coordinates::new(location.latitude, location.longitude)?;
        Some(device.distance_to(&point))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_format() {
        let qr = QrPayload::parse("  20601234567|Operaciones|PT-01|-12.0464,-77.0428|EST-9|extra ")
            .expect("non-empty");
        assert_eq!(qr.format(), QrFormat::Standard);
        assert_eq!(qr.raw(), "20601234567|Operaciones|PT-01|-12.0464,-77.0428|EST-9|extra");
        let site = qr.site().expect("site");
        assert_eq!(site.company, "20601234567");
        assert_eq!(site.establishment, "EST-9");
        assert_eq!(
            qr.coordinates(),
            Some(Coordinates {
                latitude: -12.0464,
                longitude: -77.0428
            })
        );
    }

    #[test]
    fn test_coordinate_layouts() {
        let first = QrPayload::parse("-12.05, -77.04|Lima").expect("non-empty");
        assert_eq!(first.format(), QrFormat::CoordinatesFirst);

        let json = QrPayload::parse(r#"{"lat": -12.05, "lng": -77.04, "site": "x"}"#).expect("non-empty");
        assert_eq!(json.format(), QrFormat::Json);
        assert_eq!(json.coordinates().map(|c| c.longitude), Some(-77.04));

        let bare = QrPayload::parse("-12.05,-77.04").expect("non-empty");
        assert_eq!(bare.format(), QrFormat::CoordinatesOnly);
    }

    #[test]
    fn test_opaque_and_invalid_coordinates() {
        let opaque = QrPayload::parse("PUNCH-POINT-7").expect("non-empty");
        assert_eq!(opaque.format(), QrFormat::Opaque);
        assert!(opaque.coordinates().is_none());

        // Latitude out of range
        let bad = QrPayload::parse("A|B|C|95.0,-77.0|E").expect("non-empty");
        assert!(bad.coordinates().is_none());

        // Exponents are not coordinates
        assert!(QrPayload::parse("1e1,2").expect("non-empty").coordinates().is_none());

        assert!(QrPayload::parse("   ").is_none());
    }

    #[test]
    fn test_distance() {
        let a = Coordinates::new(-12.0464, -77.0428).expect("valid");
        let b = Coordinates::new(-12.0474, -77.0428).expect("valid");
        let d = a.distance_to(&b);
        assert!((d - 111.2).abs() < 0.5, "got {}", d);
        assert_eq!(a.distance_to(&a), 0.0);

        let qr = QrPayload::parse("-12.0464,-77.0428").expect("non-empty");
        let device = DeviceLocation {
            latitude: -12.0474,
            longitude: -77.0428,
            accuracy: Some(10.0),
        };
        let distance = qr.distance_from(&device).expect("both known");
        assert!(distance < DEFAULT_MAX_DISTANCE_METERS);
    }
}
