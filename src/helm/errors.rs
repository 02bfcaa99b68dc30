use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Helm failure classes that are surfaced on conditions instead of being
    /// retried: the chart or cluster state is what it is, and requeueing in a
    /// tight loop cannot fix it.
    static ref NON_RETRIABLE: Vec<Regex> = vec![
        // wait timeouts
        Regex::new(r"(?i)timed out waiting for").expect("static regex"),
        Regex::new(r"(?i)context deadline exceeded").expect("static regex"),
        // manifest validation
        Regex::new(r"(?i)error validating data").expect("static regex"),
        Regex::new(r"(?i)is invalid:").expect("static regex"),
        Regex::new(r#"(?i)duplicate value: "#).expect("static regex"),
        Regex::new(r"(?i)unable to build kubernetes objects").expect("static regex"),
        // atomic rollback after a failed upgrade
        Regex::new(r"(?i)atomic").expect("static regex"),
        Regex::new(r"(?i)rollback").expect("static regex"),
        // chart constraints
        Regex::new(r"(?i)chart requires kubeversion").expect("static regex"),
    ];
}

/// True when a helm error message belongs to one of the user-visible,
/// non-retriable classes. The caller records the verbatim message on the
/// Installed/Ready conditions and still advances the applied deployment ID.
pub fn is_non_retriable(message: &str) -> bool {
    NON_RETRIABLE.iter().any(|re| re.is_match(message))
}

/// Flattens helm stderr into a single condition-friendly line.
pub fn condense(stderr: &str) -> String {
    let mut lines: Vec<&str> = stderr
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    // helm prefixes the actual failure with "Error:" on the last lines
    if let Some(pos) = lines.iter().rposition(|l| l.starts_with("Error:")) {
        lines = lines.split_off(pos);
    }
    lines.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_wait_timeout() {
        assert!(is_non_retriable(
            "Error: INSTALLATION FAILED: timed out waiting for the condition"
        ));
    }

    #[test]
    fn classifies_validation_and_duplicate_values() {
        assert!(is_non_retriable(
            r#"Error: UPGRADE FAILED: Service "svc-test" is invalid: spec.ports[1].name: Duplicate value: "myport""#
        ));
        assert!(is_non_retriable(
            "Error: unable to build kubernetes objects from release manifest: error validating data"
        ));
    }

    #[test]
    fn classifies_kube_version_constraint() {
        assert!(is_non_retriable(
            "Error: chart requires kubeVersion: >=1.99.0-0 which is incompatible with Kubernetes v1.32.0"
        ));
    }

    #[test]
    fn connection_errors_stay_retriable() {
        assert!(!is_non_retriable(
            "Error: Kubernetes cluster unreachable: Get \"https://10.0.0.1:443/version\": dial tcp: i/o timeout"
        ));
        assert!(!is_non_retriable("Error: release: not found"));
    }

    #[test]
    fn condense_keeps_the_error_line() {
        let stderr = "walk.go:74: found symbolic link\nError: UPGRADE FAILED: another operation is in progress\n";
        assert_eq!(
            condense(stderr),
            "Error: UPGRADE FAILED: another operation is in progress"
        );
    }
}
