use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const CONDITION_DEPLOYED: &str = "Deployed";
pub const CONDITION_MONITORED: &str = "Monitored";
pub const CONDITION_INSTALLED: &str = "Installed";
pub const CONDITION_READY: &str = "Ready";

/// Status condition on a BundleDeployment. The transition timestamp only
/// moves when the observed status value changes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Upserts `type_` with the given status. The timestamp is preserved when the
/// status does not flip, so condition churn never produces status patches.
pub fn set(conditions: &mut Vec<Condition>, type_: &str, status: bool, reason: &str, message: &str) {
    let status = if status { "True" } else { "False" };
    let message = if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    };

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = Some(now());
        }
        existing.status = status.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = message;
        return;
    }

    conditions.push(Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message,
        last_transition_time: Some(now()),
    });
}

pub fn get<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    get(conditions, type_).map(|c| c.status == "True").unwrap_or(false)
}

/// Distinct from `!is_true`: an absent condition is neither true nor false.
pub fn is_false(conditions: &[Condition], type_: &str) -> bool {
    get(conditions, type_).map(|c| c.status == "False").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_inserts_and_updates() {
        let mut conditions = Vec::new();
        set(&mut conditions, CONDITION_DEPLOYED, true, "Deployed", "");
        assert!(is_true(&conditions, CONDITION_DEPLOYED));
        assert!(!is_false(&conditions, CONDITION_DEPLOYED));

        set(
            &mut conditions,
            CONDITION_DEPLOYED,
            false,
            "Error",
            "helm install failed",
        );
        assert_eq!(conditions.len(), 1);
        assert!(is_false(&conditions, CONDITION_DEPLOYED));
        assert_eq!(
            conditions[0].message.as_deref(),
            Some("helm install failed")
        );
    }

    #[test]
    fn transition_time_only_moves_on_flip() {
        let mut conditions = vec![Condition {
            type_: CONDITION_READY.to_string(),
            status: "True".to_string(),
            reason: None,
            message: None,
            last_transition_time: Some("2001-01-01T00:00:00Z".to_string()),
        }];

        set(&mut conditions, CONDITION_READY, true, "Ready", "");
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2001-01-01T00:00:00Z")
        );

        set(&mut conditions, CONDITION_READY, false, "NotReady", "boom");
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2001-01-01T00:00:00Z")
        );
    }

    #[test]
    fn absent_condition_is_neither() {
        let conditions = Vec::new();
        assert!(!is_true(&conditions, CONDITION_INSTALLED));
        assert!(!is_false(&conditions, CONDITION_INSTALLED));
    }
}
