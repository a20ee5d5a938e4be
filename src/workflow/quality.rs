use serde::Deserialize;

use crate::worker::{StepResult, StepStatus};

/// Quality thresholds a step result must clear to progress.
///
/// This is the single point of quality policy; workers never re-implement
/// these checks.
#[derive(Debug, Clone, Deserialize)]
pub struct QualityGate {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub max_critical_issues: u32,
    #[serde(default = "default_min_completeness")]
    pub min_completeness: f64,
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_min_completeness() -> f64 {
    0.8
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            max_critical_issues: 0,
            min_completeness: default_min_completeness(),
        }
    }
}

impl QualityGate {
    /// Whether the step result clears every threshold.
    ///
    /// Fails fast in order: failed status, then confidence, then critical
    /// issues, then completeness. Metrics are only consulted when the worker
    /// attached them.
    pub fn passes(&self, step: &StepResult) -> bool {
        if step.status == StepStatus::Failed {
            return false;
        }
        if step.confidence < self.min_confidence {
            return false;
        }
        if let Some(metrics) = &step.quality_metrics {
            if metrics.critical_issues_count > self.max_critical_issues {
                return false;
            }
            if metrics.completeness_score < self.min_completeness {
                return false;
            }
        }
        true
    }

    /// Human-readable list of the violated criteria, used as retry guidance.
    pub fn violations(&self, step: &StepResult) -> Vec<String> {
        let mut violations = Vec::new();
        if step.status == StepStatus::Failed {
            violations.push("step reported failure".to_string());
        }
        if step.confidence < self.min_confidence {
            violations.push(format!(
                "confidence {:.2} below minimum {:.2}",
                step.confidence, self.min_confidence
            ));
        }
        if let Some(metrics) = &step.quality_metrics {
            if metrics.critical_issues_count > self.max_critical_issues {
                violations.push(format!(
                    "{} critical issues exceed limit of {}",
                    metrics.critical_issues_count, self.max_critical_issues
                ));
            }
            if metrics.completeness_score < self.min_completeness {
                violations.push(format!(
                    "completeness {:.2} below minimum {:.2}",
                    metrics.completeness_score, self.min_completeness
                ));
            }
        }
        violations
    }
}
