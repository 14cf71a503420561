//! Backend inspect payload normalization.
//!
//! The backends disagree on JSON shape (podman wraps in an array, docker
//! sometimes does, apple `container` returns a bare object) and on field
//! casing (`State.Status` vs `state.status`). This module accepts every
//! combination and yields a lower-cased status plus the exit code.

use serde::Deserialize;
use serde_json::Value;

use super::RuntimeError;

#[derive(Debug, Default, Deserialize)]
struct InspectPayload {
    #[serde(rename = "State", alias = "state", default)]
    state: InspectState,
}

#[derive(Debug, Default, Deserialize)]
struct InspectState {
    #[serde(rename = "Status", alias = "status", default)]
    status: Option<String>,
    #[serde(rename = "ExitCode", alias = "exitCode", default)]
    exit_code: Option<i32>,
}

/// Extracts `(status, exit_code)` from a raw inspect payload.
///
/// The status comes back lower-cased and trimmed.
///
/// # Errors
///
/// [`RuntimeError::EmptyInspect`] for a blank payload,
/// [`RuntimeError::InspectParse`] for undecodable JSON,
/// [`RuntimeError::InspectMissingStatus`] when no status field is present
/// in any accepted spelling.
pub fn parse_container_state(raw: &str) -> Result<(String, Option<i32>), RuntimeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RuntimeError::EmptyInspect);
    }
    let value: Value = serde_json::from_str(trimmed).map_err(RuntimeError::InspectParse)?;
    let object = match value {
        Value::Array(items) => items.into_iter().next().ok_or(RuntimeError::EmptyInspect)?,
        other => other,
    };
    let payload: InspectPayload =
        serde_json::from_value(object).map_err(RuntimeError::InspectParse)?;
    let status = payload
        .state
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(RuntimeError::InspectMissingStatus)?
        .to_lowercase();
    Ok((status, payload.state.exit_code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_wrapped_pascal_case() {
        let raw = r#"[{"State":{"Status":"exited","ExitCode":0}}]"#;
        let (status, exit) = parse_container_state(raw).unwrap();
        assert_eq!(status, "exited");
        assert_eq!(exit, Some(0));
    }

    #[test]
    fn object_shaped_without_exit_code() {
        let raw = r#"{"State":{"Status":"running"}}"#;
        let (status, exit) = parse_container_state(raw).unwrap();
        assert_eq!(status, "running");
        assert_eq!(exit, None);
    }

    #[test]
    fn lowercase_field_names() {
        let raw = r#"{"state":{"status":"exited","exitCode":23}}"#;
        let (status, exit) = parse_container_state(raw).unwrap();
        assert_eq!(status, "exited");
        assert_eq!(exit, Some(23));
    }

    #[test]
    fn status_is_lowercased() {
        let raw = r#"{"State":{"Status":"Exited","ExitCode":1}}"#;
        let (status, _) = parse_container_state(raw).unwrap();
        assert_eq!(status, "exited");
    }

    #[test]
    fn empty_payloads_are_rejected() {
        assert!(matches!(
            parse_container_state("   "),
            Err(RuntimeError::EmptyInspect)
        ));
        assert!(matches!(
            parse_container_state("[]"),
            Err(RuntimeError::EmptyInspect)
        ));
    }

    #[test]
    fn missing_status_is_rejected() {
        assert!(matches!(
            parse_container_state(r#"{"State":{}}"#),
            Err(RuntimeError::InspectMissingStatus)
        ));
    }
}
