//! Tool parameter descriptors
//!
//! One [`ParamSchema`] value serves two purposes: it validates the arguments a
//! model sends before a handler runs, and it exports the JSON Schema the model
//! sees in its function-calling catalogue.
//!
//! ```text
//! ParamSchema::object()
//!     .property("text", ParamSchema::string().describe("Text to echo"), true)
//!        │
//!        ├── validate(&args)      → Ok(()) | Err("text: expected string")
//!        └── to_json_schema()     → {"type":"object","properties":{...},"required":["text"]}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Tagged union over the parameter shapes tools accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParamSchema {
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Boolean {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// A string restricted to a fixed set of values
    Enum {
        values: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Array {
        items: Box<ParamSchema>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Object {
        #[serde(default)]
        properties: BTreeMap<String, ParamSchema>,
        #[serde(default)]
        required: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl ParamSchema {
    pub fn string() -> Self {
        ParamSchema::String { description: None }
    }

    pub fn number() -> Self {
        ParamSchema::Number { description: None }
    }

    pub fn integer() -> Self {
        ParamSchema::Integer { description: None }
    }

    pub fn boolean() -> Self {
        ParamSchema::Boolean { description: None }
    }

    pub fn enumeration<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ParamSchema::Enum {
            values: values.into_iter().map(Into::into).collect(),
            description: None,
        }
    }

    pub fn array(items: ParamSchema) -> Self {
        ParamSchema::Array {
            items: Box::new(items),
            description: None,
        }
    }

    /// An object with no properties; add them with [`ParamSchema::property`].
    pub fn object() -> Self {
        ParamSchema::Object {
            properties: BTreeMap::new(),
            required: Vec::new(),
            description: None,
        }
    }

    /// Attach a human-readable description.
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        let text = Some(text.into());
        match &mut self {
            ParamSchema::String { description }
            | ParamSchema::Number { description }
            | ParamSchema::Integer { description }
            | ParamSchema::Boolean { description }
            | ParamSchema::Enum { description, .. }
            | ParamSchema::Array { description, .. }
            | ParamSchema::Object { description, .. } => *description = text,
        }
        self
    }

    /// Add a property to an object schema. No-op on other shapes.
    pub fn property(mut self, name: impl Into<String>, schema: ParamSchema, required: bool) -> Self {
        if let ParamSchema::Object {
            properties,
            required: req,
            ..
        } = &mut self
        {
            let name = name.into();
            if required && !req.contains(&name) {
                req.push(name.clone());
            }
            properties.insert(name, schema);
        }
        self
    }

    fn type_name(&self) -> &'static str {
        match self {
            ParamSchema::String { .. } | ParamSchema::Enum { .. } => "string",
            ParamSchema::Number { .. } => "number",
            ParamSchema::Integer { .. } => "integer",
            ParamSchema::Boolean { .. } => "boolean",
            ParamSchema::Array { .. } => "array",
            ParamSchema::Object { .. } => "object",
        }
    }

    /// Check `value` against this schema.
    ///
    /// The error names the offending path (`items[2].name: expected string`).
    /// Unknown object properties are accepted.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        self.validate_at(value, "")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), String> {
        let mismatch = || {
            let at = if path.is_empty() { "arguments" } else { path };
            format!("{}: expected {}", at, self.type_name())
        };

        match self {
            ParamSchema::String { .. } => value.is_string().then_some(()).ok_or_else(mismatch),
            ParamSchema::Number { .. } => value.is_number().then_some(()).ok_or_else(mismatch),
            ParamSchema::Integer { .. } => (value.is_i64() || value.is_u64())
                .then_some(())
                .ok_or_else(mismatch),
            ParamSchema::Boolean { .. } => value.is_boolean().then_some(()).ok_or_else(mismatch),
            ParamSchema::Enum { values, .. } => {
                let s = value.as_str().ok_or_else(mismatch)?;
                if values.iter().any(|v| v == s) {
                    Ok(())
                } else {
                    Err(format!(
                        "{}: '{}' is not one of [{}]",
                        if path.is_empty() { "arguments" } else { path },
                        s,
                        values.join(", ")
                    ))
                }
            }
            ParamSchema::Array { items, .. } => {
                let arr = value.as_array().ok_or_else(mismatch)?;
                for (i, item) in arr.iter().enumerate() {
                    items.validate_at(item, &format!("{}[{}]", path, i))?;
                }
                Ok(())
            }
            ParamSchema::Object {
                properties,
                required,
                ..
            } => {
                let obj = value.as_object().ok_or_else(mismatch)?;
                for name in required {
                    if obj.get(name).map(|v| v.is_null()).unwrap_or(true) {
                        return Err(format!("missing required parameter '{}'", join(path, name)));
                    }
                }
                for (name, schema) in properties {
                    match obj.get(name) {
                        // Optional parameters may be sent as null
                        None | Some(Value::Null) => {}
                        Some(v) => schema.validate_at(v, &join(path, name))?,
                    }
                }
                Ok(())
            }
        }
    }

    /// Export as JSON Schema.
    pub fn to_json_schema(&self) -> Value {
        let mut out = Map::new();
        out.insert("type".into(), json!(self.type_name()));

        let description = match self {
            ParamSchema::String { description }
            | ParamSchema::Number { description }
            | ParamSchema::Integer { description }
            | ParamSchema::Boolean { description }
            | ParamSchema::Enum { description, .. }
            | ParamSchema::Array { description, .. }
            | ParamSchema::Object { description, .. } => description,
        };
        if let Some(d) = description {
            out.insert("description".into(), json!(d));
        }

        match self {
            ParamSchema::Enum { values, .. } => {
                out.insert("enum".into(), json!(values));
            }
            ParamSchema::Array { items, .. } => {
                out.insert("items".into(), items.to_json_schema());
            }
            ParamSchema::Object {
                properties,
                required,
                ..
            } => {
                let props: Map<String, Value> = properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_schema()))
                    .collect();
                out.insert("properties".into(), Value::Object(props));
                out.insert("required".into(), json!(required));
            }
            _ => {}
        }
        Value::Object(out)
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_like() -> ParamSchema {
        ParamSchema::object()
            .property("command", ParamSchema::string().describe("Command to run"), true)
            .property("cwd", ParamSchema::string(), false)
            .property("retries", ParamSchema::integer(), false)
            .property("mode", ParamSchema::enumeration(["fast", "safe"]), false)
            .property("tags", ParamSchema::array(ParamSchema::string()), false)
    }

    #[test]
    fn test_validate_accepts_good_args() {
        let schema = shell_like();
        assert!(schema.validate(&json!({"command": "ls"})).is_ok());
        assert!(schema
            .validate(&json!({"command": "ls", "cwd": null, "retries": 2, "mode": "safe", "tags": ["a"], "extra": 1}))
            .is_ok());
    }

    #[test]
    fn test_validate_reports_path() {
        let schema = shell_like();
        assert_eq!(
            schema.validate(&json!({})).unwrap_err(),
            "missing required parameter 'command'"
        );
        assert_eq!(
            schema.validate(&json!({"command": 3})).unwrap_err(),
            "command: expected string"
        );
        assert_eq!(
            schema.validate(&json!({"command": "ls", "tags": ["a", 1]})).unwrap_err(),
            "tags[1]: expected string"
        );
        assert!(schema
            .validate(&json!({"command": "ls", "retries": 1.5}))
            .unwrap_err()
            .contains("integer"));
        assert!(schema
            .validate(&json!({"command": "ls", "mode": "slow"}))
            .unwrap_err()
            .contains("not one of"));
        assert_eq!(schema.validate(&json!("ls")).unwrap_err(), "arguments: expected object");
    }

    #[test]
    fn test_json_schema_export() {
        let exported = shell_like().to_json_schema();
        assert_eq!(exported["type"], "object");
        assert_eq!(exported["required"], json!(["command"]));
        assert_eq!(exported["properties"]["command"]["type"], "string");
        assert_eq!(exported["properties"]["command"]["description"], "Command to run");
        assert_eq!(exported["properties"]["mode"]["enum"], json!(["fast", "safe"]));
        assert_eq!(exported["properties"]["tags"]["items"]["type"], "string");
    }

    #[test]
    fn test_descriptor_is_serializable() {
        let schema = ParamSchema::object().property("text", ParamSchema::string(), true);
        let wire = serde_json::to_value(&schema).unwrap();
        assert_eq!(wire["type"], "object");
        let back: ParamSchema = serde_json::from_value(wire).unwrap();
        assert_eq!(back, schema);
    }
}
