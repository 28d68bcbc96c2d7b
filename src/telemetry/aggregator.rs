//! Time-window aggregation for high-frequency sensors.
//!
//! Samples buffer per sensor; once a sample arrives whose timestamp is a full
//! window past the sensor's last emit, the buffered values are reduced and
//! handed to the emit callback, the buffer cleared and the emit time advanced.

use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::telemetry::data::TelemetrySample;

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    pub sensor_name: String,
    pub timestamp: f64,
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub unit: Option<String>,
}

pub type EmitCallback = Box<dyn FnMut(AggregationResult) + Send>;

pub struct TimeWindowAggregator {
    window_ms: f64,
    buffers: HashMap<String, VecDeque<TelemetrySample>>,
    last_emit: HashMap<String, f64>,
    emit: EmitCallback,
}

impl TimeWindowAggregator {
    pub fn new(window_ms: u64, emit: EmitCallback) -> Self {
        TimeWindowAggregator {
            window_ms: window_ms as f64,
            buffers: HashMap::new(),
            last_emit: HashMap::new(),
            emit,
        }
    }

    /// Buffer one sample; emits first if this sample lands a full window
    /// after the sensor's last emit.
    pub fn add(&mut self, sample: TelemetrySample) {
        let sensor = sample.sensor_name.clone();
        self.last_emit.entry(sensor.clone()).or_insert(sample.timestamp);

        let elapsed_ms = (sample.timestamp - self.last_emit[&sensor]) * 1000.0;
        if elapsed_ms >= self.window_ms {
            self.emit_sensor(&sensor, sample.timestamp);
        }

        self.buffers.entry(sensor).or_default().push_back(sample);
    }

    fn emit_sensor(&mut self, sensor: &str, current_time: f64) {
        let Some(buffer) = self.buffers.get_mut(sensor) else {
            return;
        };
        if buffer.is_empty() {
            return;
        }

        let count = buffer.len();
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for sample in buffer.iter() {
            sum += sample.value;
            min = min.min(sample.value);
            max = max.max(sample.value);
        }
        let unit = buffer.front().and_then(|s| s.unit.clone());

        let result = AggregationResult {
            sensor_name: sensor.to_string(),
            timestamp: current_time,
            count,
            mean: sum / count as f64,
            min,
            max,
            unit,
        };

        debug!(
            sensor,
            count,
            mean = result.mean,
            "Aggregation window emitted"
        );
        (self.emit)(result);

        buffer.clear();
        self.last_emit.insert(sensor.to_string(), current_time);
    }

    /// Force an emit using the last buffered sample's timestamp. With no
    /// sensor given, every buffered sensor is flushed.
    pub fn flush(&mut self, sensor: Option<&str>) {
        match sensor {
            Some(sensor) => {
                let last_ts = self
                    .buffers
                    .get(sensor)
                    .and_then(|b| b.back())
                    .map(|s| s.timestamp);
                if let Some(ts) = last_ts {
                    self.emit_sensor(sensor, ts);
                }
            }
            None => {
                let sensors: Vec<String> = self.buffers.keys().cloned().collect();
                for sensor in sensors {
                    self.flush(Some(&sensor));
                }
            }
        }
    }

    pub fn buffered(&self, sensor: &str) -> usize {
        self.buffers.get(sensor).map_or(0, |b| b.len())
    }

    pub fn last_emit(&self, sensor: &str) -> Option<f64> {
        self.last_emit.get(sensor).copied()
    }
}
