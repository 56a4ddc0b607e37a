use crate::models::Artifact;
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub critical: bool,
    pub detail: String,
    pub metrics: HashMap<String, f64>,
    pub penalty: f64,
}

#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;
    /// Independent checks are pure functions over the artifact snapshot and
    /// may run concurrently with each other.
    fn independent(&self) -> bool {
        true
    }
    async fn run(&self, artifact: &Artifact) -> CheckResult;
}

pub struct SizeCheck {
    pub max_pr_size: usize,
}

#[async_trait]
impl Check for SizeCheck {
    fn name(&self) -> &str {
        "size"
    }

    async fn run(&self, artifact: &Artifact) -> CheckResult {
        let changed = artifact.lines_changed();
        let passed = changed <= self.max_pr_size as u64;
        let mut metrics = HashMap::new();
        metrics.insert("lines_changed".to_string(), changed as f64);
        CheckResult {
            passed,
            critical: !passed,
            detail: if passed {
                format!("{changed} lines changed, within limit {}", self.max_pr_size)
            } else {
                format!("PR size {changed} > limit {}", self.max_pr_size)
            },
            metrics,
            penalty: 1.0,
        }
    }
}

/// Every changed non-test source file must have a corresponding test file,
/// matched by the `tests/<stem>` or `<stem>_test.*` naming convention.
pub struct TestPresenceCheck;

#[async_trait]
impl Check for TestPresenceCheck {
    fn name(&self) -> &str {
        "test_presence"
    }

    async fn run(&self, artifact: &Artifact) -> CheckResult {
        let source_files: Vec<&String> = artifact
            .files_changed
            .iter()
            .filter(|f| !is_test_file(f))
            .collect();

        let missing: Vec<&&String> = source_files
            .iter()
            .filter(|f| !has_matching_test(f, &artifact.test_files_changed))
            .collect();

        let passed = missing.is_empty();
        CheckResult {
            passed,
            critical: false,
            detail: if passed {
                "every changed source file has a matching test".to_string()
            } else {
                format!(
                    "missing tests for: {}",
                    missing.iter().map(|f| f.as_str()).collect::<Vec<_>>().join(", ")
                )
            },
            metrics: HashMap::new(),
            penalty: if passed { 1.0 } else { 0.5 },
        }
    }
}

fn is_test_file(path: &str) -> bool {
    path.contains("/tests/") || path.ends_with("_test.rs") || path.contains("test_")
}

fn has_matching_test(source: &str, test_files: &[String]) -> bool {
    let stem = source.rsplit('/').next().unwrap_or(source);
    let stem = stem.split('.').next().unwrap_or(stem);
    test_files.iter().any(|t| t.contains(stem))
}

pub struct CoverageCheck {
    pub min_coverage: f64,
}

#[async_trait]
impl Check for CoverageCheck {
    fn name(&self) -> &str {
        "coverage"
    }

    async fn run(&self, artifact: &Artifact) -> CheckResult {
        let coverage = artifact.coverage_percent.unwrap_or(0.0);
        let passed = coverage >= self.min_coverage;
        let critical = coverage < 0.6;
        let mut metrics = HashMap::new();
        metrics.insert("coverage_percent".to_string(), coverage);
        CheckResult {
            passed,
            critical: critical && !passed,
            detail: format!("coverage {coverage:.2} (min {:.2})", self.min_coverage),
            metrics,
            penalty: if passed {
                1.0
            } else {
                (coverage / self.min_coverage).max(0.0)
            },
        }
    }
}

pub struct LintCheck;

#[async_trait]
impl Check for LintCheck {
    fn name(&self) -> &str {
        "lint"
    }

    async fn run(&self, artifact: &Artifact) -> CheckResult {
        let passed = artifact.lint_errors == 0;
        let mut metrics = HashMap::new();
        metrics.insert("lint_errors".to_string(), artifact.lint_errors as f64);
        metrics.insert("lint_warnings".to_string(), artifact.lint_warnings as f64);
        CheckResult {
            passed,
            critical: false,
            detail: format!(
                "{} lint errors, {} warnings",
                artifact.lint_errors, artifact.lint_warnings
            ),
            metrics,
            penalty: if passed { 1.0 } else { 0.8 },
        }
    }
}

pub struct SecurityCheck;

#[async_trait]
impl Check for SecurityCheck {
    fn name(&self) -> &str {
        "security"
    }

    async fn run(&self, artifact: &Artifact) -> CheckResult {
        let n = artifact.security_findings;
        let passed = n == 0;
        let mut metrics = HashMap::new();
        metrics.insert("security_findings".to_string(), n as f64);
        CheckResult {
            passed,
            critical: false,
            detail: format!("{n} high-severity findings"),
            metrics,
            penalty: (1.0 - 0.1 * n as f64).max(0.5),
        }
    }
}

pub struct ComplexityCheck {
    pub max_complexity: u32,
}

#[async_trait]
impl Check for ComplexityCheck {
    fn name(&self) -> &str {
        "complexity"
    }

    async fn run(&self, artifact: &Artifact) -> CheckResult {
        let passed = artifact.max_cyclomatic_complexity <= self.max_complexity;
        let mut metrics = HashMap::new();
        metrics.insert(
            "max_cyclomatic_complexity".to_string(),
            artifact.max_cyclomatic_complexity as f64,
        );
        CheckResult {
            passed,
            critical: false,
            detail: format!(
                "max complexity {} (bound {})",
                artifact.max_cyclomatic_complexity, self.max_complexity
            ),
            metrics,
            penalty: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn size_check_flags_oversize_pr_as_critical() {
        let check = SizeCheck { max_pr_size: 500 };
        let artifact = Artifact {
            lines_added: 700,
            lines_removed: 150,
            ..Default::default()
        };
        let result = check.run(&artifact).await;
        assert!(!result.passed);
        assert!(result.critical);
    }

    #[tokio::test]
    async fn coverage_check_critical_only_below_sixty_percent() {
        let check = CoverageCheck { min_coverage: 0.8 };
        let low = Artifact {
            coverage_percent: Some(0.5),
            ..Default::default()
        };
        let mid = Artifact {
            coverage_percent: Some(0.7),
            ..Default::default()
        };
        assert!(check.run(&low).await.critical);
        assert!(!check.run(&mid).await.critical);
    }

    #[tokio::test]
    async fn test_presence_detects_missing_test() {
        let check = TestPresenceCheck;
        let artifact = Artifact {
            files_changed: vec!["src/parser.rs".to_string()],
            test_files_changed: vec![],
            ..Default::default()
        };
        assert!(!check.run(&artifact).await.passed);
    }
}
