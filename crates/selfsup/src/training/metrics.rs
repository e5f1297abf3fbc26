//! Per-batch metrics and running averages for epoch summaries.

use std::collections::BTreeMap;

/// Metrics produced by one supervised batch of the online evaluator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

/// Running mean of [`StepMetrics`].
#[derive(Debug, Clone, Default)]
pub struct RunningAvg {
    loss: f64,
    accuracy: f64,
    pub count: usize,
}

impl RunningAvg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, m: &StepMetrics) {
        self.loss += m.loss;
        self.accuracy += m.accuracy;
        self.count += 1;
    }

    pub fn mean(&self) -> Option<StepMetrics> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(StepMetrics {
            loss: self.loss / n,
            accuracy: self.accuracy / n,
        })
    }

    pub fn display(&self) -> String {
        match self.mean() {
            Some(m) => format!("loss={:.4} acc={:.3}", m.loss, m.accuracy),
            None => "no data".to_string(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Last logged value per metric name (e.g. `ssl_online_evaluator/train/loss`).
#[derive(Debug, Clone, Default)]
pub struct MetricsLog {
    values: BTreeMap<String, f64>,
}

impl MetricsLog {
    pub fn log(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
