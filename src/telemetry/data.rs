//! Telemetry data model: the ROV snapshot received off the wire and the
//! per-sensor samples derived from it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct Vector3 {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn from_suffix(suffix: &str) -> Option<Axis> {
        match suffix {
            "x" => Some(Axis::X),
            "y" => Some(Axis::Y),
            "z" => Some(Axis::Z),
            _ => None,
        }
    }
}

impl Vector3 {
    pub fn component(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }
}

/// One decoded snapshot of the ROV state
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RovSnapshot {
    #[serde(default)]
    pub attitude: Vector3,
    #[serde(default)]
    pub angular_velocity: Vector3,
    #[serde(default)]
    pub angular_acceleration: Vector3,
    #[serde(default)]
    pub velocity: Vector3,
    #[serde(default)]
    pub acceleration: Vector3,

    #[serde(default)]
    pub depth: f64,
    #[serde(default)]
    pub ambient_temperature: f64,
    #[serde(default)]
    pub ambient_pressure: f64,
    #[serde(default)]
    pub internal_temperature: f64,
    #[serde(default)]
    pub cardinal_direction: f64,
    #[serde(default)]
    pub grove_water_sensor: i64,

    #[serde(default)]
    pub actuator_1: f64,
    #[serde(default)]
    pub actuator_2: f64,
    #[serde(default)]
    pub actuator_3: f64,
    #[serde(default)]
    pub actuator_4: f64,
    #[serde(default)]
    pub actuator_5: f64,
    #[serde(default)]
    pub actuator_6: f64,
}

impl RovSnapshot {
    /// Look up a scalar field by its wire name
    pub fn scalar(&self, name: &str) -> Option<f64> {
        match name {
            "depth" => Some(self.depth),
            "ambient_temperature" => Some(self.ambient_temperature),
            "ambient_pressure" => Some(self.ambient_pressure),
            "internal_temperature" => Some(self.internal_temperature),
            "cardinal_direction" => Some(self.cardinal_direction),
            "grove_water_sensor" => Some(self.grove_water_sensor as f64),
            "actuator_1" => Some(self.actuator_1),
            "actuator_2" => Some(self.actuator_2),
            "actuator_3" => Some(self.actuator_3),
            "actuator_4" => Some(self.actuator_4),
            "actuator_5" => Some(self.actuator_5),
            "actuator_6" => Some(self.actuator_6),
            _ => None,
        }
    }

    /// Look up a 3-vector field by its wire name
    pub fn vector(&self, name: &str) -> Option<&Vector3> {
        match name {
            "attitude" => Some(&self.attitude),
            "angular_velocity" => Some(&self.angular_velocity),
            "angular_acceleration" => Some(&self.angular_acceleration),
            "velocity" => Some(&self.velocity),
            "acceleration" => Some(&self.acceleration),
            _ => None,
        }
    }

    pub fn is_vector_field(name: &str) -> bool {
        matches!(
            name,
            "attitude" | "angular_velocity" | "angular_acceleration" | "velocity" | "acceleration"
        )
    }
}

/// One scalar telemetry datum flowing through projection, filtering and
/// routing.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub timestamp: f64,
    pub sensor_name: String,
    pub value: f64,
    pub unit: Option<String>,
}

/// The most recent value for one sensor, as read by the publisher
#[derive(Debug, Clone, PartialEq)]
pub struct SensorState {
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_deserializes_with_partial_fields() {
        let snapshot: RovSnapshot = serde_json::from_str(
            r#"{"depth": 2.5, "attitude": {"x": 1.0, "y": 2.0, "z": 3.0}}"#,
        )
        .unwrap();
        assert_eq!(snapshot.depth, 2.5);
        assert_eq!(snapshot.attitude.y, 2.0);
        assert_eq!(snapshot.velocity, Vector3::default());
    }

    #[test]
    fn scalar_lookup_covers_actuators() {
        let mut snapshot = RovSnapshot::default();
        snapshot.actuator_3 = -42.0;
        assert_eq!(snapshot.scalar("actuator_3"), Some(-42.0));
        assert_eq!(snapshot.scalar("unknown"), None);
    }

    #[test]
    fn vector_component_lookup() {
        let mut snapshot = RovSnapshot::default();
        snapshot.angular_velocity = Vector3 { x: 0.1, y: 0.2, z: 0.3 };
        let v = snapshot.vector("angular_velocity").unwrap();
        assert_eq!(v.component(Axis::Z), 0.3);
        assert!(RovSnapshot::is_vector_field("acceleration"));
        assert!(!RovSnapshot::is_vector_field("depth"));
    }
}
