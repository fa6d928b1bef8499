use serde_json::Value;
use std::collections::HashMap;

use super::record::NodeFailure;
use crate::core::errors::ReasonCode;
use crate::external::{ExecutionSurface, LocatorResolver};
use crate::graph::{Assertion, OperationKind};

/// Access to the surface for assertions that probe the page
pub(crate) struct Probe<'a> {
    pub resolver: &'a dyn LocatorResolver,
    pub surface: &'a dyn ExecutionSurface,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        _ => true,
    }
}

fn contains(result: &Value, text: &str) -> bool {
    match result {
        Value::String(s) => s.contains(text),
        Value::Array(items) => items.iter().any(|v| v.as_str() == Some(text)),
        Value::Object(map) => map.contains_key(text),
        _ => false,
    }
}

/// Evaluate one assertion against an operation result.
///
/// A definitive negative is `AssertionFailed`; probe problems keep their
/// own classification so the retry loop can treat them accordingly.
pub(crate) async fn evaluate(
    assertion: &Assertion,
    result: &Value,
    probe: &Probe<'_>,
) -> Result<(), NodeFailure> {
    let failed = |detail: String| Err(NodeFailure::new(ReasonCode::AssertionFailed, detail));

    match assertion {
        Assertion::ResultPresent => {
            if result.is_null() {
                return failed("operation produced no result".to_string());
            }
        }
        Assertion::ResultEquals { value } => {
            if result != value {
                return failed(format!("expected {} but got {}", value, result));
            }
        }
        Assertion::ResultContains { text } => {
            if !contains(result, text) {
                return failed(format!("result does not contain '{}'", text));
            }
        }
        Assertion::FieldEquals { pointer, value } => match result.pointer(pointer) {
            Some(actual) if actual == value => {}
            Some(actual) => {
                return failed(format!("{} is {} but expected {}", pointer, actual, value))
            }
            None => return failed(format!("{} is absent from the result", pointer)),
        },
        Assertion::TargetPresent { target } => {
            let handle = probe
                .resolver
                .resolve(target)
                .await
                .map_err(|e| NodeFailure::new(ReasonCode::Unresolvable, e.to_string()))?;
            let seen = probe
                .surface
                .perform(OperationKind::Assert, Some(&handle), &HashMap::new())
                .await
                .map_err(|e| NodeFailure::new(e.reason_code(), e.to_string()))?;
            if !truthy(&seen) {
                return failed(format!("target '{}' is not present", target));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSurface, StaticResolver};
    use serde_json::json;

    async fn check(assertion: Assertion, result: Value) -> Result<(), NodeFailure> {
        let resolver = StaticResolver::new().unresolvable("gone");
        let surface = ScriptedSurface::new();
        let probe = Probe {
            resolver: &resolver,
            surface: &surface,
        };
        evaluate(&assertion, &result, &probe).await
    }

    #[tokio::test]
    async fn test_pure_assertions() {
        assert!(check(Assertion::ResultPresent, json!("x")).await.is_ok());
        assert!(check(Assertion::ResultPresent, Value::Null).await.is_err());
        assert!(check(
            Assertion::ResultContains { text: "Kindle".into() },
            json!("Kindle Paperwhite")
        )
        .await
        .is_ok());
        assert!(check(
            Assertion::FieldEquals {
                pointer: "/count".into(),
                value: json!(3)
            },
            json!({"count": 3})
        )
        .await
        .is_ok());

        let err = check(Assertion::ResultEquals { value: json!(1) }, json!(2))
            .await
            .unwrap_err();
        assert_eq!(err.code, ReasonCode::AssertionFailed);
    }

    #[tokio::test]
    async fn test_target_probe_classification() {
        let err = check(Assertion::TargetPresent { target: "gone".into() }, Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, ReasonCode::Unresolvable);

        assert!(check(Assertion::TargetPresent { target: "banner".into() }, Value::Null)
            .await
            .is_ok());
    }
}
