//! Argument schemas for tools.
//!
//! A schema is the single source of truth per tool: it validates in-process
//! argument objects (filling declared defaults) and serializes to the JSON
//! Schema object the provider receives. Validation errors are written for the
//! model to self-correct on the next turn.

use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Integer,
}

impl ArgKind {
    fn json_type(self) -> &'static str {
        match self {
            ArgKind::String => "string",
            ArgKind::Integer => "integer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArgField {
    pub name: String,
    pub description: String,
    pub kind: ArgKind,
    pub required: bool,
    pub default: Option<Value>,
    pub minimum: Option<i64>,
    pub maximum: Option<i64>,
    pub min_length: Option<usize>,
}

impl ArgField {
    pub fn string(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            kind: ArgKind::String,
            required: false,
            default: None,
            minimum: None,
            maximum: None,
            min_length: None,
        }
    }

    pub fn integer(name: &str, description: &str) -> Self {
        Self {
            kind: ArgKind::Integer,
            ..Self::string(name, description)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn range(mut self, minimum: i64, maximum: i64) -> Self {
        self.minimum = Some(minimum);
        self.maximum = Some(maximum);
        self
    }

    pub fn minimum(mut self, minimum: i64) -> Self {
        self.minimum = Some(minimum);
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn non_empty(mut self) -> Self {
        self.min_length = Some(1);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArgSchema {
    fields: Vec<ArgField>,
}

impl ArgSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: ArgField) -> Self {
        self.fields.push(field);
        self
    }

    /// The JSON Schema object sent to the provider for this tool.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut property = Map::new();
            property.insert("type".to_string(), json!(field.kind.json_type()));
            property.insert("description".to_string(), json!(field.description));
            if let Some(minimum) = field.minimum {
                property.insert("minimum".to_string(), json!(minimum));
            }
            if let Some(maximum) = field.maximum {
                property.insert("maximum".to_string(), json!(maximum));
            }
            if let Some(min_length) = field.min_length {
                property.insert("minLength".to_string(), json!(min_length));
            }
            if let Some(default) = &field.default {
                property.insert("default".to_string(), default.clone());
            }
            properties.insert(field.name.clone(), Value::Object(property));
            if field.required {
                required.push(json!(field.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Validate an argument object against the schema, filling defaults for
    /// absent optional fields. Returns every violation found, not just the
    /// first, so the model sees the full picture.
    pub fn validate_and_fill(&self, args: &mut Value) -> Result<(), Vec<String>> {
        let Some(obj) = args.as_object_mut() else {
            return Err(vec!["arguments must be a JSON object".to_string()]);
        };

        let mut errors = Vec::new();
        for key in obj.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                errors.push(format!("unknown argument '{key}'"));
            }
        }

        for field in &self.fields {
            match obj.get(&field.name).cloned() {
                None => {
                    if field.required {
                        errors.push(format!("'{}' is required", field.name));
                    } else if let Some(default) = &field.default {
                        obj.insert(field.name.clone(), default.clone());
                    }
                }
                Some(value) => match field.kind {
                    ArgKind::String => match value.as_str() {
                        Some(s) => {
                            if let Some(min_length) = field.min_length {
                                if s.chars().count() < min_length {
                                    errors.push(format!(
                                        "'{}' must be a non-empty string",
                                        field.name
                                    ));
                                }
                            }
                        }
                        None => errors.push(format!(
                            "'{}' must be a string, got {value}",
                            field.name
                        )),
                    },
                    ArgKind::Integer => match value.as_i64() {
                        Some(n) => {
                            if let Some(minimum) = field.minimum {
                                if n < minimum {
                                    errors.push(format!(
                                        "'{}' must be >= {minimum} (got {n})",
                                        field.name
                                    ));
                                }
                            }
                            if let Some(maximum) = field.maximum {
                                if n > maximum {
                                    errors.push(format!(
                                        "'{}' must be <= {maximum} (got {n})",
                                        field.name
                                    ));
                                }
                            }
                        }
                        None => errors.push(format!(
                            "'{}' must be an integer, got {value}",
                            field.name
                        )),
                    },
                },
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> ArgSchema {
        ArgSchema::new()
            .field(ArgField::string("query", "Search query").required().non_empty())
            .field(
                ArgField::integer("topK", "Result cap")
                    .range(1, 50)
                    .default_value(json!(10)),
            )
    }

    #[test]
    fn fills_default_for_absent_optional() {
        let mut args = json!({"query": "foo"});
        sample_schema().validate_and_fill(&mut args).expect("valid");
        assert_eq!(args["topK"], 10);
    }

    #[test]
    fn rejects_missing_required() {
        let mut args = json!({});
        let errors = sample_schema().validate_and_fill(&mut args).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("'query' is required")));
    }

    #[test]
    fn rejects_empty_required_string() {
        let mut args = json!({"query": ""});
        let errors = sample_schema().validate_and_fill(&mut args).unwrap_err();
        assert!(errors[0].contains("non-empty"));
    }

    #[test]
    fn rejects_out_of_range_integer() {
        let mut args = json!({"query": "x", "topK": 99});
        let errors = sample_schema().validate_and_fill(&mut args).unwrap_err();
        assert!(errors[0].contains("<= 50"));
    }

    #[test]
    fn rejects_negative_when_minimum_one() {
        let schema = ArgSchema::new()
            .field(ArgField::integer("startLine", "Start").required().minimum(1));
        let mut args = json!({"startLine": -1});
        let errors = schema.validate_and_fill(&mut args).unwrap_err();
        assert!(errors[0].contains(">= 1"));
    }

    #[test]
    fn rejects_unknown_argument() {
        let mut args = json!({"query": "x", "bogus": true});
        let errors = sample_schema().validate_and_fill(&mut args).unwrap_err();
        assert!(errors[0].contains("unknown argument 'bogus'"));
    }

    #[test]
    fn rejects_wrong_types() {
        let mut args = json!({"query": 7, "topK": "ten"});
        let errors = sample_schema().validate_and_fill(&mut args).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn json_schema_shape_carries_bounds_and_defaults() {
        let schema = sample_schema().to_json_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["topK"]["minimum"], 1);
        assert_eq!(schema["properties"]["topK"]["maximum"], 50);
        assert_eq!(schema["properties"]["topK"]["default"], 10);
        assert_eq!(schema["required"], json!(["query"]));
    }
}
