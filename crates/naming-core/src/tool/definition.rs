//! Tool and parameter definitions
//!
//! `ParameterSpec` is the typed parameter model used for the entry point's
//! inputs and for the dynamically registered return / error-report tools.
//! Schemas are rendered to plain JSON Schema objects for hosts that need one.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

/// Parameter type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    #[serde(alias = "integer", alias = "float")]
    Number,
    #[serde(alias = "boolean")]
    Bool,
    Object,
    Array,
}

impl ParameterType {
    /// JSON Schema type name
    pub fn json_type(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// One parameter of a tool schema; object and array parameters nest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: ParameterType,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub required: bool,

    /// Properties of an object parameter
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<ParameterSpec>,

    /// Element spec of an array parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParameterSpec>>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, kind: ParameterType) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            required: false,
            properties: vec![],
            items: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_properties(mut self, properties: Vec<ParameterSpec>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_items(mut self, items: ParameterSpec) -> Self {
        self.items = Some(Box::new(items));
        self
    }

    /// Render this parameter as a JSON Schema fragment
    pub fn to_json_schema(&self) -> JsonValue {
        let mut schema = Map::new();
        schema.insert("type".into(), json!(self.kind.json_type()));
        if !self.description.is_empty() {
            schema.insert("description".into(), json!(self.description));
        }
        match self.kind {
            ParameterType::Object if !self.properties.is_empty() => {
                schema.insert("properties".into(), properties_schema(&self.properties));
                schema.insert("required".into(), required_names(&self.properties));
            }
            ParameterType::Array => {
                if let Some(items) = &self.items {
                    schema.insert("items".into(), items.to_json_schema());
                }
            }
            _ => {}
        }
        JsonValue::Object(schema)
    }
}

fn properties_schema(parameters: &[ParameterSpec]) -> JsonValue {
    let props: Map<String, JsonValue> = parameters
        .iter()
        .map(|p| (p.name.clone(), p.to_json_schema()))
        .collect();
    JsonValue::Object(props)
}

fn required_names(parameters: &[ParameterSpec]) -> JsonValue {
    let required: Vec<&str> = parameters
        .iter()
        .filter(|p| p.required)
        .map(|p| p.name.as_str())
        .collect();
    json!(required)
}

/// A tool the engine registers on a child session (or exposes to a parent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ParameterSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Object schema for the tool's input
    pub fn input_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": properties_schema(&self.parameters),
            "required": required_names(&self.parameters)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_schema() {
        let spec = ToolSpec::new(
            "search",
            "Search things",
            vec![
                ParameterSpec::new("query", ParameterType::String)
                    .with_description("What to look for")
                    .required(),
                ParameterSpec::new("limit", ParameterType::Number),
            ],
        );

        let schema = spec.input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["query"]["type"], "string");
        assert_eq!(schema["properties"]["query"]["description"], "What to look for");
        assert_eq!(schema["properties"]["limit"]["type"], "number");
        assert_eq!(schema["required"], json!(["query"]));
    }

    #[test]
    fn test_nested_schema() {
        let author = ParameterSpec::new("author", ParameterType::Object).with_properties(vec![
            ParameterSpec::new("name", ParameterType::String).required(),
            ParameterSpec::new("verified", ParameterType::Bool),
        ]);
        let tags = ParameterSpec::new("tags", ParameterType::Array)
            .with_items(ParameterSpec::new("tag", ParameterType::String));

        let schema = ToolSpec::new("t", "", vec![author, tags]).input_schema();
        assert_eq!(schema["properties"]["author"]["properties"]["verified"]["type"], "boolean");
        assert_eq!(schema["properties"]["author"]["required"], json!(["name"]));
        assert_eq!(schema["properties"]["tags"]["items"]["type"], "string");
    }

    #[test]
    fn test_type_aliases_deserialize() {
        let spec: ParameterSpec =
            serde_json::from_value(json!({"name": "n", "type": "integer"})).unwrap();
        assert_eq!(spec.kind, ParameterType::Number);
        let spec: ParameterSpec =
            serde_json::from_value(json!({"name": "b", "type": "boolean", "required": true}))
                .unwrap();
        assert_eq!(spec.kind, ParameterType::Bool);
        assert!(spec.required);
    }
}
