//! Keyword heuristics for classifying incidents and guessing a root cause.

use flowpilot_core::ErrorClassification;

/// Checked in order; the first rule with a matching keyword wins.
const RULES: &[(ErrorClassification, &[&str])] = &[
    (
        ErrorClassification::IntegrationFailure,
        &["timeout", "timed out", "connection", "unreachable", "bad gateway", "503"],
    ),
    (
        ErrorClassification::ResourceExhaustion,
        &["memory", "oom", "disk full", "no space", "quota", "too many open files"],
    ),
    (
        ErrorClassification::Security,
        &["permission", "unauthorized", "forbidden", "access denied", "certificate"],
    ),
    (
        ErrorClassification::Syntax,
        &["syntax", "parse error", "unexpected token"],
    ),
    (
        ErrorClassification::Configuration,
        &["config", "environment variable", "missing setting", "not configured"],
    ),
    (
        ErrorClassification::Performance,
        &["slow", "latency", "response_time", "response time", "degraded"],
    ),
    (
        ErrorClassification::Dependency,
        &["dependency", "module not found", "package", "version conflict"],
    ),
    (
        ErrorClassification::Data,
        &["invalid data", "corrupt", "deserializ", "null value", "constraint"],
    ),
    (
        ErrorClassification::Runtime,
        &["panic", "exception", "crash", "exit status", "error_rate", "runtime"],
    ),
];

pub fn classify(message: &str) -> ErrorClassification {
    let text = message.to_lowercase();
    RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
        .map(|(classification, _)| *classification)
        .unwrap_or(ErrorClassification::Unknown)
}

pub fn infer_root_cause(message: &str, classification: ErrorClassification) -> String {
    let text = message.to_lowercase();
    match classification {
        ErrorClassification::IntegrationFailure if text.contains("timeout") || text.contains("timed out") => {
            "External service did not respond within its deadline".to_string()
        }
        ErrorClassification::IntegrationFailure => {
            "Connectivity to an external service is failing".to_string()
        }
        ErrorClassification::ResourceExhaustion if text.contains("memory") || text.contains("oom") => {
            "Process memory exhausted; likely a leak or undersized allocation".to_string()
        }
        ErrorClassification::ResourceExhaustion => {
            "A finite resource (disk, quota, handles) is exhausted".to_string()
        }
        ErrorClassification::Security => {
            "Credentials or permissions are missing or invalid".to_string()
        }
        ErrorClassification::Syntax => "Malformed input or source failed to parse".to_string(),
        ErrorClassification::Configuration => {
            "Required configuration is missing or inconsistent".to_string()
        }
        ErrorClassification::Performance => {
            "Service is degraded; latency exceeds its budget".to_string()
        }
        ErrorClassification::Dependency => {
            "A required dependency is missing or incompatible".to_string()
        }
        ErrorClassification::Data => "Input data is invalid or corrupted".to_string(),
        ErrorClassification::Runtime => {
            "Unhandled runtime failure in application code".to_string()
        }
        ErrorClassification::Unknown => "Root cause undetermined".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_integration_failure() {
        assert_eq!(
            classify("Request to deploy API: Timeout after 30s"),
            ErrorClassification::IntegrationFailure
        );
        assert_eq!(
            classify("connection reset by peer"),
            ErrorClassification::IntegrationFailure
        );
    }

    #[test]
    fn test_memory_is_resource_exhaustion() {
        assert_eq!(
            classify("worker killed: out of memory"),
            ErrorClassification::ResourceExhaustion
        );
    }

    #[test]
    fn test_other_rules() {
        assert_eq!(classify("Permission denied"), ErrorClassification::Security);
        assert_eq!(classify("syntax error near line 3"), ErrorClassification::Syntax);
        assert_eq!(
            classify("DATABASE_URL environment variable not set"),
            ErrorClassification::Configuration
        );
        assert_eq!(classify("thread panicked"), ErrorClassification::Runtime);
        assert_eq!(classify("something odd"), ErrorClassification::Unknown);
    }

    #[test]
    fn test_first_rule_wins() {
        // timeout beats memory
        assert_eq!(
            classify("memory probe timeout"),
            ErrorClassification::IntegrationFailure
        );
    }

    #[test]
    fn test_root_cause_mentions_deadline_for_timeouts() {
        let cause = infer_root_cause("upstream timeout", ErrorClassification::IntegrationFailure);
        assert!(cause.contains("deadline"));
        let cause = infer_root_cause("oom killed", ErrorClassification::ResourceExhaustion);
        assert!(cause.contains("memory"));
    }
}
