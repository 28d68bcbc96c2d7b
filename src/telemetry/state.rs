//! Latest-state map: the most recent structured value per sensor, read by
//! the publisher at its cadence. Entries are always the structured
//! `{value, unit, timestamp}` form; raw scalars are never stored.

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::mqtt::schema::property_unit;
use crate::telemetry::aggregator::AggregationResult;
use crate::telemetry::data::{SensorState, TelemetrySample};

#[derive(Default)]
pub struct LatestStateMap {
    inner: Mutex<HashMap<String, SensorState>>,
}

impl LatestStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_sample(&self, sample: &TelemetrySample) {
        self.inner.lock().insert(
            sample.sensor_name.clone(),
            SensorState {
                value: sample.value,
                unit: sample.unit.clone(),
                timestamp: sample.timestamp,
            },
        );
    }

    pub fn update_aggregate(&self, result: &AggregationResult) {
        self.inner.lock().insert(
            result.sensor_name.clone(),
            SensorState {
                value: result.mean,
                unit: result.unit.clone(),
                timestamp: result.timestamp,
            },
        );
    }

    pub fn get(&self, sensor: &str) -> Option<SensorState> {
        self.inner.lock().get(sensor).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Assemble a publishable packet from the schema's top-level properties.
    /// Sensors absent from the map get a structured zero with the schema's
    /// unit, so required keys always validate.
    pub fn assemble_packet(&self, schema: &Value, timestamp: f64, id: &str) -> Value {
        let mut packet = Map::new();
        packet.insert("timestamp".to_string(), json!(timestamp));
        packet.insert("id".to_string(), json!(id));

        let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
            return Value::Object(packet);
        };

        let states = self.inner.lock();
        for (name, prop) in properties {
            if name == "timestamp" || name == "id" {
                continue;
            }
            let schema_unit = property_unit(prop);
            let entry = match states.get(name) {
                Some(state) => {
                    let unit = state.unit.clone().or_else(|| schema_unit.clone());
                    let mut obj = Map::new();
                    obj.insert("value".to_string(), json!(state.value));
                    if let Some(unit) = unit {
                        obj.insert("unit".to_string(), json!(unit));
                    }
                    obj.insert("timestamp".to_string(), json!(state.timestamp));
                    Value::Object(obj)
                }
                None => {
                    let mut obj = Map::new();
                    obj.insert("value".to_string(), json!(0));
                    if let Some(unit) = schema_unit {
                        obj.insert("unit".to_string(), json!(unit));
                    }
                    obj.insert("timestamp".to_string(), json!(0));
                    Value::Object(obj)
                }
            };
            packet.insert(name.clone(), entry);
        }

        Value::Object(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "timestamp": {"type": "number"},
                "id": {"type": "string"},
                "depth": {
                    "type": "object",
                    "properties": {"value": {"type": "number"}, "unit": {"const": "m"},
                                   "timestamp": {"type": "number"}},
                    "required": ["value", "unit"]
                },
                "velocity_x": {
                    "type": "object",
                    "properties": {"value": {"type": "number"}, "unit": {"const": "m/s"},
                                   "timestamp": {"type": "number"}},
                    "required": ["value", "unit"]
                }
            },
            "required": ["timestamp", "id", "depth", "velocity_x"]
        })
    }

    #[test]
    fn updates_overwrite_previous_entries() {
        let map = LatestStateMap::new();
        map.update_sample(&TelemetrySample {
            timestamp: 1.0,
            sensor_name: "depth".to_string(),
            value: 2.0,
            unit: Some("m".to_string()),
        });
        map.update_sample(&TelemetrySample {
            timestamp: 2.0,
            sensor_name: "depth".to_string(),
            value: 2.5,
            unit: Some("m".to_string()),
        });

        let state = map.get("depth").unwrap();
        assert_eq!(state.value, 2.5);
        assert_eq!(state.timestamp, 2.0);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn aggregate_stores_the_mean() {
        let map = LatestStateMap::new();
        map.update_aggregate(&AggregationResult {
            sensor_name: "velocity_x".to_string(),
            timestamp: 3.0,
            count: 4,
            mean: 1.25,
            min: 1.0,
            max: 1.5,
            unit: Some("m/s".to_string()),
        });
        assert_eq!(map.get("velocity_x").unwrap().value, 1.25);
    }

    #[test]
    fn missing_sensor_becomes_structured_zero() {
        let map = LatestStateMap::new();
        map.update_sample(&TelemetrySample {
            timestamp: 5.0,
            sensor_name: "velocity_x".to_string(),
            value: 0.7,
            unit: Some("m/s".to_string()),
        });

        let packet = map.assemble_packet(&schema(), 10.0, "rov-0");

        assert_eq!(packet["timestamp"], json!(10.0));
        assert_eq!(packet["id"], json!("rov-0"));
        assert_eq!(packet["velocity_x"]["value"], json!(0.7));
        // depth was never seen: structured zero with the schema's unit
        assert_eq!(packet["depth"], json!({"value": 0, "unit": "m", "timestamp": 0}));
    }
}
