//! Splitting one invocation into sub-task units

use serde_json::{Map, Value as JsonValue};

use crate::config::{ExecutionMode, ParallelPolicy};
use crate::{Error, Result};

use super::types::SubTaskUnit;

/// Units for `arguments` under `policy`, in submission order.
///
/// Bad caller input (a missing or non-list list parameter) is
/// `Error::InvalidArguments`; a policy that cannot produce units is
/// `Error::Configuration`.
pub fn decompose(
    policy: &ParallelPolicy,
    arguments: &Map<String, JsonValue>,
) -> Result<Vec<SubTaskUnit>> {
    match policy.mode {
        ExecutionMode::PerParameter => Ok(arguments
            .iter()
            .filter(|(name, _)| !policy.excluded_parameters.contains(name.as_str()))
            .enumerate()
            .map(|(index, (name, value))| SubTaskUnit::new(index, name, value.clone()))
            .collect()),

        ExecutionMode::PerListItem => {
            let name = policy.list_parameter.as_deref().ok_or_else(|| {
                Error::Configuration("per_list_item mode needs a list parameter".to_string())
            })?;

            match arguments.get(name) {
                None | Some(JsonValue::Null) => Err(Error::InvalidArguments(format!(
                    "Parameter '{}' not found or is null",
                    name
                ))),
                Some(JsonValue::Array(items)) => Ok(items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| SubTaskUnit::new(index, name, item.clone()))
                    .collect()),
                Some(_) => Err(Error::InvalidArguments(format!(
                    "{} is not enumerable",
                    name
                ))),
            }
        }

        ExecutionMode::PerExternalListItem => match policy.external_list.as_deref() {
            Some(items) if !items.is_empty() => Ok(items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    SubTaskUnit::new(index, item.clone(), JsonValue::String(item.clone()))
                })
                .collect()),
            _ => Err(Error::Configuration(
                "ExternalStringList must not be null or empty".to_string(),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("arguments must be an object"),
        }
    }

    #[test]
    fn test_per_parameter_skips_excluded() {
        let policy = ParallelPolicy::new(ExecutionMode::PerParameter)
            .exclude("style")
            .exclude("absent");
        let units = decompose(
            &policy,
            &args(json!({"intro": "a", "style": "formal", "outro": "b"})),
        )
        .unwrap();

        // 3 keys, 1 excluded key present
        assert_eq!(units.len(), 2);
        let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["intro", "outro"]);
        assert_eq!(units[1].index, 1);
        assert_eq!(units[1].value, json!("b"));
    }

    #[test]
    fn test_per_parameter_empty_and_all_excluded() {
        let policy = ParallelPolicy::new(ExecutionMode::PerParameter).exclude("only");
        assert!(decompose(&policy, &Map::new()).unwrap().is_empty());
        assert!(decompose(&policy, &args(json!({"only": 1}))).unwrap().is_empty());
    }

    #[test]
    fn test_per_list_item_keeps_nulls_and_duplicates() {
        let policy = ParallelPolicy::new(ExecutionMode::PerListItem).with_list_parameter("files");
        let units = decompose(
            &policy,
            &args(json!({"files": ["a.rs", null, "a.rs", {"path": "b.rs"}], "focus": "bugs"})),
        )
        .unwrap();

        assert_eq!(units.len(), 4);
        assert!(units.iter().all(|u| u.name == "files"));
        assert_eq!(units[1].value, JsonValue::Null);
        assert_eq!(units[0].value, units[2].value);
        assert_eq!(units[3].index, 3);
    }

    #[test]
    fn test_per_list_item_missing_or_null() {
        let policy = ParallelPolicy::new(ExecutionMode::PerListItem).with_list_parameter("files");

        let err = decompose(&policy, &Map::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid arguments: Parameter 'files' not found or is null"
        );

        let err = decompose(&policy, &args(json!({"files": null}))).unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(_)));
    }

    #[test]
    fn test_per_list_item_not_enumerable() {
        let policy = ParallelPolicy::new(ExecutionMode::PerListItem).with_list_parameter("files");
        for value in [json!(42), json!("a.rs"), json!({"a": 1})] {
            let err = decompose(&policy, &args(json!({"files": value}))).unwrap_err();
            assert!(err.to_string().contains("files is not enumerable"));
        }
    }

    #[test]
    fn test_per_external_list_item() {
        let policy = ParallelPolicy::new(ExecutionMode::PerExternalListItem).with_external_list(
            vec!["fr".into(), "".into(), "fr".into()],
        );
        let units = decompose(&policy, &args(json!({"text": "hello"}))).unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[1].value, json!(""));
        assert_eq!(units[2].name, "fr");
    }

    #[test]
    fn test_per_external_list_item_empty() {
        for policy in [
            ParallelPolicy::new(ExecutionMode::PerExternalListItem),
            ParallelPolicy::new(ExecutionMode::PerExternalListItem).with_external_list(vec![]),
        ] {
            let err = decompose(&policy, &Map::new()).unwrap_err();
            assert!(err.is_configuration());
            assert!(err.to_string().contains("must not be null or empty"));
        }
    }
}
