//! What stations say to each other.
//!
//! A direction estimate travels as a small JSON object,
//!
//! ```text
//! {"clientid": "station-a", "origin": [-0.5, 0.0, 0.0], "pointing": [0.41, -0.41, 0.82], "sequence": 3}
//! ```
//!
//! where `sequence` is optional on the way in. A triangulated location is
//! re-published as
//!
//! ```text
//! {"location": [0.0, -0.5, 1.0], "residual": 0.0, "stations": ["station-a", "station-b"]}
//! ```

use crate::error::LocatorError;
use crate::localizer::Triangulation;
use crate::{position, Position, StationId};

use serde::{Deserialize, Serialize};

/// One station's view of where the sound came from.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionEstimate {
    /// Who made the estimate
    pub station_id: StationId,
    /// Where the station sits, world frame
    pub origin: Position,
    /// Unit vector toward the source, world frame
    pub direction: Position,
    /// Counts up by one for every estimate a station publishes
    pub sequence: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct EstimatePayload {
    clientid: String,
    origin: [f64; 3],
    pointing: [f64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
}

fn malformed(why: impl Into<String>) -> LocatorError {
    LocatorError::MalformedMessage(why.into())
}

fn triple(v: &Position) -> [f64; 3] {
    [v.x, v.y, v.z]
}

impl DirectionEstimate {
    /// Serializes the estimate into its JSON payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, LocatorError> {
        let payload = EstimatePayload {
            clientid: self.station_id.clone(),
            origin: triple(&self.origin),
            pointing: triple(&self.direction),
            sequence: Some(self.sequence),
        };
        Ok(serde_json::to_vec(&payload)?)
    }

    /// Parses a JSON payload. Anything that does not describe a usable ray
    /// is a [`LocatorError::MalformedMessage`].
    pub fn from_payload(raw: &[u8]) -> Result<Self, LocatorError> {
        let payload: EstimatePayload =
            serde_json::from_slice(raw).map_err(|e| malformed(e.to_string()))?;

        if payload.clientid.trim().is_empty() {
            return Err(malformed("empty clientid"));
        }
        let finite = payload
            .origin
            .iter()
            .chain(payload.pointing.iter())
            .all(|v| v.is_finite());
        if !finite {
            return Err(malformed(format!(
                "non-finite coordinates from {}",
                payload.clientid
            )));
        }
        let pointing = position(payload.pointing);
        let norm = pointing.norm();
        if norm == 0.0 {
            return Err(malformed(format!(
                "zero-length pointing from {}",
                payload.clientid
            )));
        }

        Ok(Self {
            station_id: payload.clientid,
            origin: position(payload.origin),
            direction: pointing / norm,
            sequence: payload.sequence.unwrap_or(0),
        })
    }
}

/// A triangulated location, as re-published for anyone listening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    /// Estimated source position, world frame
    pub location: [f64; 3],
    /// Gap between the two rays
    pub residual: f64,
    /// The two stations whose estimates were combined
    pub stations: [StationId; 2],
}

impl LocationReport {
    /// Builds the report for a triangulation of the estimates of `stations`.
    pub fn new(triangulation: &Triangulation, stations: [StationId; 2]) -> Self {
        Self {
            location: triple(&triangulation.point),
            residual: triangulation.residual,
            stations,
        }
    }

    /// Serializes the report into its JSON payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, LocatorError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_payload() {
        let raw = br#"{"clientid": "a", "origin": [-0.5, 0, 0], "pointing": [0, 0, 2]}"#;
        let est = DirectionEstimate::from_payload(raw).unwrap();
        assert_eq!(est.station_id, "a");
        assert_eq!(est.origin, Position::new(-0.5, 0.0, 0.0));
        assert_eq!(est.direction, Position::new(0.0, 0.0, 1.0));
        assert_eq!(est.sequence, 0);
    }

    #[test]
    fn test_payload_fields() {
        let est = DirectionEstimate {
            station_id: "station-b".to_owned(),
            origin: Position::new(0.5, 0.0, 0.0),
            direction: Position::new(0.0, 1.0, 0.0),
            sequence: 12,
        };
        let value: serde_json::Value = serde_json::from_slice(&est.to_payload().unwrap()).unwrap();
        assert_eq!(value["clientid"], "station-b");
        assert_eq!(value["origin"], serde_json::json!([0.5, 0.0, 0.0]));
        assert_eq!(value["pointing"], serde_json::json!([0.0, 1.0, 0.0]));
        assert_eq!(value["sequence"], 12);
    }

    #[test]
    fn test_malformed_payloads() {
        let cases: [&[u8]; 7] = [
            b"not json",
            br#"{"origin": [0, 0, 0], "pointing": [0, 0, 1]}"#,
            br#"{"clientid": "a", "pointing": [0, 0, 1]}"#,
            br#"{"clientid": "a", "origin": [0, 0], "pointing": [0, 0, 1]}"#,
            br#"{"clientid": "a", "origin": [0, 0, 0], "pointing": ["0", 0, 1]}"#,
            br#"{"clientid": "a", "origin": [0, 0, 0], "pointing": [0, 0, 0]}"#,
            br#"{"clientid": " ", "origin": [0, 0, 0], "pointing": [0, 0, 1]}"#,
        ];
        for raw in cases {
            assert!(
                matches!(
                    DirectionEstimate::from_payload(raw),
                    Err(LocatorError::MalformedMessage(_))
                ),
                "{}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_location_report() {
        let report = LocationReport {
            location: [0.0, -0.5, 1.0],
            residual: 0.25,
            stations: ["a".to_owned(), "b".to_owned()],
        };
        let text = String::from_utf8(report.to_payload().unwrap()).unwrap();
        assert_eq!(
            text,
            r#"{"location":[0.0,-0.5,1.0],"residual":0.25,"stations":["a","b"]}"#
        );
    }
}
