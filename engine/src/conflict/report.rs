//! Aggregated conflict report
//!
//! The report is the go/no-go answer: creation proceeds only when no
//! critical conflict is present. Warnings and infos ride along for the
//! operator.

use serde::{Deserialize, Serialize};

use super::{ConflictResult, ConflictSeverity};

/// Summary of a detection run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictReport {
    /// No critical conflicts present
    pub can_proceed: bool,
    pub critical_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    pub summary: String,
    /// Sorted critical-first
    pub conflicts: Vec<ConflictResult>,
}

impl ConflictReport {
    pub fn from_conflicts(conflicts: Vec<ConflictResult>) -> Self {
        let critical_count = count(&conflicts, ConflictSeverity::Critical);
        let warning_count = count(&conflicts, ConflictSeverity::Warning);
        let info_count = count(&conflicts, ConflictSeverity::Info);

        let summary = if conflicts.is_empty() {
            "no conflicts detected".to_string()
        } else {
            format!(
                "{critical_count} critical, {warning_count} warning, {info_count} info conflict(s) detected"
            )
        };

        Self {
            can_proceed: critical_count == 0,
            critical_count,
            warning_count,
            info_count,
            summary,
            conflicts,
        }
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Deduplicated suggested actions, critical ones first
    pub fn recommendations(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for severity in [
            ConflictSeverity::Critical,
            ConflictSeverity::Warning,
            ConflictSeverity::Info,
        ] {
            for conflict in self.conflicts.iter().filter(|c| c.severity == severity) {
                if !seen.contains(&conflict.suggested_action) {
                    seen.push(conflict.suggested_action.clone());
                }
            }
        }
        seen
    }

    /// Operator guidance matching the go/no-go outcome
    pub fn next_steps(&self) -> Vec<String> {
        if self.critical_count > 0 {
            vec![
                format!(
                    "resolve the {} critical conflict(s) before creating the batch",
                    self.critical_count
                ),
                "re-run conflict detection after each fix".to_string(),
            ]
        } else if self.warning_count > 0 {
            vec![
                format!("review the {} warning(s)", self.warning_count),
                "batch creation may proceed".to_string(),
            ]
        } else {
            vec!["no conflicts, batch creation may proceed".to_string()]
        }
    }
}

fn count(conflicts: &[ConflictResult], severity: ConflictSeverity) -> usize {
    conflicts.iter().filter(|c| c.severity == severity).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictKind;

    fn conflict(severity: ConflictSeverity, action: &str) -> ConflictResult {
        ConflictResult {
            severity,
            kind: ConflictKind::DetectionError,
            message: "x".to_string(),
            affected_resources: vec![],
            suggested_action: action.to_string(),
            details: serde_json::json!({}),
        }
    }

    #[test]
    fn test_empty_report_can_proceed() {
        let report = ConflictReport::from_conflicts(vec![]);
        assert!(report.can_proceed);
        assert!(!report.has_conflicts());
        assert_eq!(report.summary, "no conflicts detected");
    }

    #[test]
    fn test_critical_blocks() {
        let report = ConflictReport::from_conflicts(vec![
            conflict(ConflictSeverity::Warning, "review"),
            conflict(ConflictSeverity::Critical, "fix"),
        ]);
        assert!(!report.can_proceed);
        assert_eq!(report.critical_count, 1);
        assert_eq!(report.warning_count, 1);
    }

    #[test]
    fn test_recommendations_deduplicated() {
        let report = ConflictReport::from_conflicts(vec![
            conflict(ConflictSeverity::Critical, "fix"),
            conflict(ConflictSeverity::Critical, "fix"),
            conflict(ConflictSeverity::Warning, "review"),
        ]);
        assert_eq!(report.recommendations(), vec!["fix", "review"]);
    }
}
