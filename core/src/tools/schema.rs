//! Tool parameter schemas
//!
//! Every tool declares a typed input schema that is enforced at the
//! registry boundary before dispatch: unknown fields are rejected, numeric
//! bounds and enumerations are checked, nested objects recurse. The same
//! declaration renders to JSON Schema for the LLM's tool catalogue.

use serde_json::{json, Map, Value};

use crate::error::{HarveyError, Result};
use crate::llm::chat::{ChatFunction, ChatTool};

/// Side-effect classification of a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    Pure,
    Network,
    Destructive,
}

/// Parameter value type
#[derive(Debug, Clone)]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array(Box<ParamType>),
    /// Object with arbitrary string keys and a uniform value type
    Map(Box<ParamType>),
    Object(ObjectSchema),
}

/// One named parameter
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub param_type: ParamType,
    pub required: bool,
    pub description: String,
    pub enum_values: Option<Vec<String>>,
    pub minimum: Option<f64>,
}

impl ParamSpec {
    pub fn new(param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            param_type,
            required: true,
            description: description.into(),
            enum_values: None,
            minimum: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::new(ParamType::String, description)
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self::new(ParamType::Number, description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::new(ParamType::Boolean, description)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Constrain a string parameter to an enumeration
    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    /// Lower bound for numeric parameters
    pub fn minimum(mut self, minimum: f64) -> Self {
        self.minimum = Some(minimum);
        self
    }
}

/// Ordered field map with strictness control
#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    fields: Vec<(String, ParamSpec)>,
    pub allow_unknown: bool,
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.fields.push((name.into(), spec));
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &ParamSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    /// Validate an argument object against this schema.
    pub fn validate(&self, value: &Value, path: &str) -> Result<()> {
        let Some(object) = value.as_object() else {
            return Err(invalid(path, "expected an object"));
        };

        if !self.allow_unknown {
            for key in object.keys() {
                if !self.fields.iter().any(|(name, _)| name == key) {
                    return Err(invalid(&format!("{path}.{key}"), "unknown field"));
                }
            }
        }

        for (name, spec) in &self.fields {
            let field_path = format!("{path}.{name}");
            match object.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(invalid(&field_path, "required field is missing"));
                    }
                }
                Some(value) => validate_value(spec, value, &field_path)?,
            }
        }
        Ok(())
    }

    /// Render as a JSON Schema object for the LLM tool catalogue.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, spec) in &self.fields {
            properties.insert(name.clone(), param_json_schema(spec));
            if spec.required {
                required.push(Value::String(name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": self.allow_unknown,
        })
    }
}

fn validate_value(spec: &ParamSpec, value: &Value, path: &str) -> Result<()> {
    match &spec.param_type {
        ParamType::String => {
            let Some(text) = value.as_str() else {
                return Err(invalid(path, "expected a string"));
            };
            if let Some(allowed) = &spec.enum_values {
                if !allowed.iter().any(|v| v == text) {
                    return Err(invalid(
                        path,
                        &format!("'{text}' is not one of [{}]", allowed.join(", ")),
                    ));
                }
            }
        }
        ParamType::Number => {
            let Some(number) = value.as_f64() else {
                return Err(invalid(path, "expected a number"));
            };
            if let Some(minimum) = spec.minimum {
                if number < minimum {
                    return Err(invalid(path, &format!("{number} is below minimum {minimum}")));
                }
            }
        }
        ParamType::Boolean => {
            if !value.is_boolean() {
                return Err(invalid(path, "expected a boolean"));
            }
        }
        ParamType::Array(item_type) => {
            let Some(items) = value.as_array() else {
                return Err(invalid(path, "expected an array"));
            };
            let item_spec = ParamSpec {
                param_type: (**item_type).clone(),
                required: true,
                description: String::new(),
                enum_values: spec.enum_values.clone(),
                minimum: spec.minimum,
            };
            for (index, item) in items.iter().enumerate() {
                validate_value(&item_spec, item, &format!("{path}[{index}]"))?;
            }
        }
        ParamType::Map(value_type) => {
            let Some(object) = value.as_object() else {
                return Err(invalid(path, "expected an object"));
            };
            let value_spec = ParamSpec {
                param_type: (**value_type).clone(),
                required: true,
                description: String::new(),
                enum_values: None,
                minimum: spec.minimum,
            };
            for (key, entry) in object {
                validate_value(&value_spec, entry, &format!("{path}.{key}"))?;
            }
        }
        ParamType::Object(schema) => schema.validate(value, path)?,
    }
    Ok(())
}

fn param_json_schema(spec: &ParamSpec) -> Value {
    let mut schema = match &spec.param_type {
        ParamType::String => json!({"type": "string"}),
        ParamType::Number => json!({"type": "number"}),
        ParamType::Boolean => json!({"type": "boolean"}),
        ParamType::Array(item) => json!({
            "type": "array",
            "items": param_json_schema(&ParamSpec::new((**item).clone(), "")),
        }),
        ParamType::Map(value) => json!({
            "type": "object",
            "additionalProperties": param_json_schema(&ParamSpec::new((**value).clone(), "")),
        }),
        ParamType::Object(object) => object.to_json_schema(),
    };
    if let Some(object) = schema.as_object_mut() {
        if !spec.description.is_empty() {
            object.insert("description".into(), Value::String(spec.description.clone()));
        }
        if let Some(values) = &spec.enum_values {
            object.insert("enum".into(), json!(values));
        }
        if let Some(minimum) = spec.minimum {
            object.insert("minimum".into(), json!(minimum));
        }
    }
    schema
}

fn invalid(path: &str, reason: &str) -> HarveyError {
    HarveyError::ArgumentInvalid {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Tool metadata registered at startup; immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input: ObjectSchema,
    pub output_description: String,
    pub side_effect: SideEffect,
}

impl ToolDescriptor {
    /// Render for the LLM's native tool-calling interface.
    pub fn to_chat_tool(&self) -> ChatTool {
        ChatTool {
            type_: "function".into(),
            function: ChatFunction {
                name: self.name.clone(),
                description: Some(self.description.clone()),
                parameters: Some(self.input.to_json_schema()),
            },
        }
    }
}

/// Rewrite a JSON value with object keys in sorted order, recursively.
/// Used before logging tool arguments so transcripts are deterministic.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by_key(|(key, _)| key.as_str());
            let mut out = Map::new();
            for (key, entry) in sorted {
                out.insert(key.clone(), canonicalize(entry));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
