//! Builtin handlers
//!
//! | name          | kind           | behavior                                      |
//! |---------------|----------------|-----------------------------------------------|
//! | `passthrough` | passthrough    | returns its params                            |
//! | `sleep`       | passthrough    | waits `params.ms` milliseconds, returns params|
//! | `fail`        | passthrough    | fails with `params.message`                   |
//! | `json.pick`   | data_transform | subset of `params.input` named by `params.keys` |
//! | `json.merge`  | data_transform | upstream payloads merged, then params on top  |

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{ActionError, ActionHandler, ActionInput, ActionKind, ActionRegistry};
use crate::dag::Payload;

/// Registry preloaded with every builtin handler
pub fn builtin_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    register_builtins(&mut registry);
    registry
}

pub fn register_builtins(registry: &mut ActionRegistry) {
    registry.register("passthrough", Passthrough);
    registry.register("sleep", Sleep);
    registry.register("fail", Fail);
    registry.register("json.pick", JsonPick);
    registry.register("json.merge", JsonMerge);
}

pub struct Passthrough;

#[async_trait]
impl ActionHandler for Passthrough {
    fn kind(&self) -> ActionKind {
        ActionKind::Passthrough
    }

    fn cacheable(&self) -> bool {
        true
    }

    async fn call(&self, input: ActionInput) -> Result<Payload, ActionError> {
        Ok(input.params)
    }
}

pub struct Sleep;

#[async_trait]
impl ActionHandler for Sleep {
    fn kind(&self) -> ActionKind {
        ActionKind::Passthrough
    }

    async fn call(&self, input: ActionInput) -> Result<Payload, ActionError> {
        let ms = match input.params.get("ms") {
            None => 0,
            Some(value) => value.as_u64().ok_or_else(|| {
                ActionError::InvalidParams(format!("'ms' must be a non-negative integer, got {value}"))
            })?,
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(input.params)
    }
}

pub struct Fail;

#[async_trait]
impl ActionHandler for Fail {
    fn kind(&self) -> ActionKind {
        ActionKind::Passthrough
    }

    async fn call(&self, input: ActionInput) -> Result<Payload, ActionError> {
        let message = input
            .params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("step failed");
        Err(ActionError::Failed(message.to_string()))
    }
}

pub struct JsonPick;

#[async_trait]
impl ActionHandler for JsonPick {
    fn kind(&self) -> ActionKind {
        ActionKind::DataTransform
    }

    fn cacheable(&self) -> bool {
        true
    }

    async fn call(&self, input: ActionInput) -> Result<Payload, ActionError> {
        let source = input
            .params
            .get("input")
            .and_then(Value::as_object)
            .ok_or_else(|| ActionError::InvalidParams("'input' must be an object".to_string()))?;
        let keys = input
            .params
            .get("keys")
            .and_then(Value::as_array)
            .ok_or_else(|| ActionError::InvalidParams("'keys' must be an array".to_string()))?;

        let mut picked = Payload::new();
        for key in keys {
            let key = key
                .as_str()
                .ok_or_else(|| ActionError::InvalidParams(format!("key {key} is not a string")))?;
            if let Some(value) = source.get(key) {
                picked.insert(key.to_string(), value.clone());
            }
        }
        Ok(picked)
    }
}

pub struct JsonMerge;

#[async_trait]
impl ActionHandler for JsonMerge {
    fn kind(&self) -> ActionKind {
        ActionKind::DataTransform
    }

    async fn call(&self, input: ActionInput) -> Result<Payload, ActionError> {
        let mut merged = Payload::new();
        // upstream is keyed by step id, so later ids win on conflicts
        for payload in input.upstream.into_values() {
            merged.extend(payload);
        }
        merged.extend(input.params);
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionDispatcher;
    use crate::dag::Params;
    use serde_json::json;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("params must be an object"),
        }
    }

    #[tokio::test]
    async fn test_builtin_registry_names() {
        let registry = builtin_registry();
        assert_eq!(
            registry.names(),
            vec!["fail", "json.merge", "json.pick", "passthrough", "sleep"]
        );
        assert!(registry.is_cacheable("passthrough"));
        assert!(!registry.is_cacheable("json.merge"));
    }

    #[tokio::test]
    async fn test_fail_uses_message() {
        let err = Fail
            .call(ActionInput::new("s", params(json!({"message": "nope"}))))
            .await
            .unwrap_err();
        assert_eq!(err, ActionError::Failed("nope".to_string()));

        let err = Fail.call(ActionInput::default()).await.unwrap_err();
        assert_eq!(err, ActionError::Failed("step failed".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_waits() {
        let start = tokio::time::Instant::now();
        let out = Sleep
            .call(ActionInput::new("s", params(json!({"ms": 1500}))))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1500));
        assert_eq!(out["ms"], json!(1500));
    }

    #[tokio::test]
    async fn test_sleep_rejects_bad_ms() {
        let err = Sleep
            .call(ActionInput::new("s", params(json!({"ms": "soon"}))))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_json_pick() {
        let out = builtin_registry()
            .dispatch(
                "json.pick",
                ActionInput::new(
                    "s",
                    params(json!({"input": {"a": 1, "b": 2, "c": 3}, "keys": ["a", "c", "z"]})),
                ),
            )
            .await
            .unwrap();
        assert_eq!(Value::Object(out), json!({"a": 1, "c": 3}));
    }

    #[tokio::test]
    async fn test_json_merge_upstream_then_params() {
        let mut input = ActionInput::new("m", params(json!({"b": "param"})));
        input.upstream.insert("x".to_string(), params(json!({"a": 1, "b": 1})));
        input.upstream.insert("y".to_string(), params(json!({"c": 2})));

        let out = JsonMerge.call(input).await.unwrap();
        assert_eq!(Value::Object(out), json!({"a": 1, "b": "param", "c": 2}));
    }
}
