use std::collections::BTreeMap;

use serde::Serialize;

/// The time series the simulation records for offline plotting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Series {
    LinkRate,
    BufferOccupancy,
    PacketLoss,
    FlowRate,
    FlowWindow,
    FlowRtt,
}

/// One sample: virtual time, series, the link or flow it describes, value.
#[derive(Debug, Clone, Serialize)]
pub struct MetricRecord {
    pub t: f64,
    pub series: Series,
    pub key: String,
    pub value: f64,
}

#[derive(Debug, Default)]
struct RateWindow {
    started_at: f64,
    bits: f64,
}

/// Collects samples in event order. Point series are recorded as they
/// happen; rate series accumulate bits and emit one averaged sample per
/// elapsed window. All iteration is over ordered maps so identical runs
/// produce identical logs.
#[derive(Debug)]
pub struct MetricsRecorder {
    records: Vec<MetricRecord>,
    sample_interval: f64,
    windows: BTreeMap<(Series, String), RateWindow>,
    counters: BTreeMap<(Series, String), u64>,
}

impl MetricsRecorder {
    pub fn new(sample_interval: f64) -> Self {
        Self {
            records: Vec::new(),
            sample_interval,
            windows: BTreeMap::new(),
            counters: BTreeMap::new(),
        }
    }

    /// Record an instantaneous value.
    pub fn point(&mut self, t: f64, series: Series, key: &str, value: f64) {
        self.records.push(MetricRecord {
            t,
            series,
            key: key.to_string(),
            value,
        });
    }

    /// Bump a cumulative counter and record its new total.
    pub fn count(&mut self, t: f64, series: Series, key: &str) {
        let counter = self
            .counters
            .entry((series, key.to_string()))
            .or_insert(0);
        *counter += 1;
        let value = *counter as f64;
        self.point(t, series, key, value);
    }

    /// Accumulate bits into a rate window, emitting an averaged sample once
    /// the window has elapsed.
    pub fn add_rate(&mut self, t: f64, series: Series, key: &str, bits: u64) {
        let window = self
            .windows
            .entry((series, key.to_string()))
            .or_insert(RateWindow {
                started_at: t,
                bits: 0.0,
            });
        let elapsed = t - window.started_at;
        if elapsed >= self.sample_interval && window.bits > 0.0 {
            let value = window.bits / elapsed;
            let at = window.started_at;
            window.started_at = t;
            window.bits = 0.0;
            self.point(at + elapsed, series, key, value);
        }
        let window = self.windows.get_mut(&(series, key.to_string())).unwrap();
        window.bits += bits as f64;
    }

    /// Close out any partially filled rate windows at end of run.
    pub fn finish(&mut self, t: f64) {
        let pending: Vec<((Series, String), f64, f64)> = self
            .windows
            .iter()
            .filter(|(_, w)| w.bits > 0.0 && t > w.started_at)
            .map(|(k, w)| (k.clone(), w.bits / (t - w.started_at), w.started_at))
            .collect();
        for ((series, key), value, _) in pending {
            self.point(t, series, &key, value);
            self.windows.remove(&(series, key));
        }
    }

    pub fn records(&self) -> &[MetricRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_cumulative_per_key() {
        let mut m = MetricsRecorder::new(0.1);
        m.count(1.0, Series::PacketLoss, "l1");
        m.count(2.0, Series::PacketLoss, "l1");
        m.count(2.5, Series::PacketLoss, "l2");
        let values: Vec<f64> = m.records().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 1.0]);
    }

    #[test]
    fn rate_window_emits_average_once_elapsed() {
        let mut m = MetricsRecorder::new(1.0);
        m.add_rate(0.0, Series::LinkRate, "l1", 500);
        m.add_rate(0.5, Series::LinkRate, "l1", 500);
        assert!(m.is_empty());
        m.add_rate(2.0, Series::LinkRate, "l1", 100);
        assert_eq!(m.len(), 1);
        let r = &m.records()[0];
        assert_eq!(r.t, 2.0);
        assert_eq!(r.value, 500.0); // 1000 bits over 2 seconds
    }

    #[test]
    fn finish_flushes_partial_windows() {
        let mut m = MetricsRecorder::new(10.0);
        m.add_rate(0.0, Series::FlowRate, "f1", 800);
        m.finish(4.0);
        assert_eq!(m.len(), 1);
        assert_eq!(m.records()[0].value, 200.0);
    }
}
