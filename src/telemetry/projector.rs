//! Schema-driven projection of ROV snapshots into named telemetry samples.
//!
//! The dispatch table is built once at startup from the output schema's
//! top-level properties: `<base>_<x|y|z>` resolves to a vector component,
//! anything else to a scalar field of the snapshot. Properties that match
//! neither are dropped with a log line and never consulted again.

use serde_json::Value;
use tracing::warn;

use crate::mqtt::schema::property_unit;
use crate::telemetry::data::{Axis, RovSnapshot, TelemetrySample};

#[derive(Debug, Clone, PartialEq)]
enum FieldRef {
    Scalar(String),
    Vector(String, Axis),
}

#[derive(Debug, Clone)]
struct SensorBinding {
    property: String,
    field: FieldRef,
    unit: Option<String>,
}

pub struct Projector {
    bindings: Vec<SensorBinding>,
}

impl Projector {
    /// Build the dispatch table from the output schema
    pub fn from_schema(schema: &Value) -> Self {
        let mut bindings = Vec::new();
        let probe = RovSnapshot::default();

        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        for (name, prop) in &properties {
            if name == "timestamp" || name == "id" {
                continue;
            }

            let field = resolve_field(name);
            let resolvable = match &field {
                FieldRef::Scalar(field) => probe.scalar(field).is_some(),
                FieldRef::Vector(field, _) => probe.vector(field).is_some(),
            };
            if !resolvable {
                warn!(property = %name, "Schema property has no snapshot field, skipping");
                continue;
            }

            bindings.push(SensorBinding {
                property: name.clone(),
                field,
                unit: property_unit(prop),
            });
        }

        Projector { bindings }
    }

    /// Project one snapshot into samples, one per bound schema property
    pub fn project(&self, snapshot: &RovSnapshot, timestamp: f64) -> Vec<TelemetrySample> {
        self.bindings
            .iter()
            .filter_map(|binding| {
                let value = match &binding.field {
                    FieldRef::Scalar(field) => snapshot.scalar(field)?,
                    FieldRef::Vector(field, axis) => snapshot.vector(field)?.component(*axis),
                };
                Some(TelemetrySample {
                    timestamp,
                    sensor_name: binding.property.clone(),
                    value,
                    unit: binding.unit.clone(),
                })
            })
            .collect()
    }

    pub fn sensor_names(&self) -> Vec<&str> {
        self.bindings.iter().map(|b| b.property.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

fn resolve_field(property: &str) -> FieldRef {
    if let Some((base, suffix)) = property.rsplit_once('_') {
        if RovSnapshot::is_vector_field(base) {
            if let Some(axis) = Axis::from_suffix(suffix) {
                return FieldRef::Vector(base.to_string(), axis);
            }
        }
    }
    FieldRef::Scalar(property.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::data::Vector3;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "timestamp": {"type": "number"},
                "id": {"type": "string"},
                "depth": {
                    "type": "object",
                    "properties": {"value": {"type": "number"}, "unit": {"const": "m"}}
                },
                "attitude_x": {
                    "type": "object",
                    "properties": {"value": {"type": "number"}, "unit": {"const": "deg"}}
                },
                "attitude_z": {
                    "type": "object",
                    "properties": {"value": {"type": "number"}, "unit": {"enum": ["deg"]}}
                },
                "actuator_1": {
                    "type": "object",
                    "properties": {"value": {"type": "number"}, "unit": {"const": "percent"}}
                },
                "sonar_range": {
                    "type": "object",
                    "properties": {"value": {"type": "number"}, "unit": {"const": "m"}}
                }
            }
        })
    }

    #[test]
    fn builds_bindings_and_skips_unknown_properties() {
        let projector = Projector::from_schema(&schema());
        // sonar_range has no snapshot field and is dropped
        assert_eq!(projector.len(), 4);
        assert!(!projector.sensor_names().contains(&"sonar_range"));
    }

    #[test]
    fn vector_suffix_resolves_to_component() {
        assert_eq!(
            resolve_field("attitude_x"),
            FieldRef::Vector("attitude".to_string(), Axis::X)
        );
        // actuator_1 ends in a suffix that is not an axis; scalar lookup wins
        assert_eq!(
            resolve_field("actuator_1"),
            FieldRef::Scalar("actuator_1".to_string())
        );
        assert_eq!(resolve_field("depth"), FieldRef::Scalar("depth".to_string()));
    }

    #[test]
    fn projects_values_and_units_from_snapshot() {
        let projector = Projector::from_schema(&schema());
        let snapshot = RovSnapshot {
            depth: 3.5,
            attitude: Vector3 { x: 1.0, y: 2.0, z: 3.0 },
            actuator_1: 55.0,
            ..Default::default()
        };

        let samples = projector.project(&snapshot, 42.0);
        assert_eq!(samples.len(), 4);

        let by_name = |name: &str| samples.iter().find(|s| s.sensor_name == name).unwrap();
        assert_eq!(by_name("depth").value, 3.5);
        assert_eq!(by_name("depth").unit.as_deref(), Some("m"));
        assert_eq!(by_name("attitude_x").value, 1.0);
        assert_eq!(by_name("attitude_z").value, 3.0);
        assert_eq!(by_name("attitude_z").unit.as_deref(), Some("deg"));
        assert_eq!(by_name("actuator_1").value, 55.0);
        assert!(samples.iter().all(|s| s.timestamp == 42.0));
    }
}
