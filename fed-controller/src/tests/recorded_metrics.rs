use metrics_util::CompositeKey;
use metrics_util::debugging::{DebugValue, Snapshotter};

/// Metric values captured by a debugging recorder, looked up by name and
/// labels.
pub struct RecordedMetrics {
    entries: Vec<(CompositeKey, DebugValue)>,
}

impl RecordedMetrics {
    pub fn take(snapshotter: &Snapshotter) -> RecordedMetrics {
        let entries = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| (key, value))
            .collect();
        RecordedMetrics { entries }
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        match self.find(name, labels) {
            Some(DebugValue::Counter(value)) => *value,
            _ => 0,
        }
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Vec<f64> {
        match self.find(name, labels) {
            Some(DebugValue::Histogram(values)) => values.iter().map(|value| value.0).collect(),
            _ => vec![],
        }
    }

    fn find(&self, name: &str, labels: &[(&str, &str)]) -> Option<&DebugValue> {
        self.entries
            .iter()
            .find(|(key, _)| {
                let key = key.key();
                key.name() == name
                    && labels.iter().all(|(label, value)| {
                        key.labels()
                            .any(|l| l.key() == *label && l.value() == *value)
                    })
            })
            .map(|(_, value)| value)
    }
}
