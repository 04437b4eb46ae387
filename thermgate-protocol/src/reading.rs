//! Temperature readings.

use crate::error::ProtocolError;
use std::fmt;
use std::str::FromStr;

/// Identifier of a sensor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SensorId(pub u32);

impl SensorId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for SensorId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SensorId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(SensorId)
            .map_err(|_| ProtocolError::InvalidSensorId(s.to_string()))
    }
}

/// A single temperature sample.
///
/// The session table caches the latest one per sensor and the storage queue
/// holds its own copy until it is persisted, so the two never share state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Sensor that produced the reading.
    pub sensor_id: SensorId,
    /// Temperature in degrees Celsius.
    pub temperature: f32,
    /// Whether the value came from a real sample.
    pub valid: bool,
}

impl Reading {
    /// Creates a valid reading stamped with the current time.
    pub fn now(sensor_id: SensorId, temperature: f32) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            sensor_id,
            temperature,
            valid: true,
        }
    }

    /// Placeholder cached when a session is admitted, before any sample.
    pub fn initial(sensor_id: SensorId) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            sensor_id,
            temperature: 0.0,
            valid: false,
        }
    }

    pub fn at(timestamp: i64, sensor_id: SensorId, temperature: f32) -> Self {
        Self {
            timestamp,
            sensor_id,
            temperature,
            valid: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_reading_is_invalid() {
        let reading = Reading::initial(SensorId(3));
        assert!(!reading.valid);
        assert_eq!(reading.temperature, 0.0);
        assert_eq!(reading.sensor_id, SensorId(3));
    }

    #[test]
    fn test_sensor_id_parse() {
        assert_eq!("42".parse::<SensorId>().unwrap(), SensorId(42));
        assert_eq!(" 7 ".parse::<SensorId>().unwrap(), SensorId(7));
        assert!("-1".parse::<SensorId>().is_err());
        assert!("abc".parse::<SensorId>().is_err());
    }
}
