//! Declarative payload contracts.
//!
//! A [`Shape`] describes the structure of a JSON payload (types, tuple arity,
//! nullability). [`Contract`] pairs a shape with the event or command name it
//! guards and turns structural mismatches into [`SchemaViolation`]s that name
//! the offending field path. Business rules (axis ranges and the like) are not
//! checked here.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema violation in {contract} at {path}: {reason}")]
pub struct SchemaViolation {
    pub contract: String,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Any,
    Bool,
    /// A JSON number without a fractional representation.
    Integer,
    Number,
    Str,
    Literal(&'static str),
    Nullable(Box<Shape>),
    /// Object field that may be missing entirely.
    Optional(Box<Shape>),
    Tuple(Vec<Shape>),
    /// Fields listed here are required unless wrapped in [`Shape::Optional`].
    /// Unlisted fields are tolerated.
    Object(Vec<(&'static str, Shape)>),
}

#[derive(Debug)]
struct Mismatch {
    path: String,
    reason: String,
}

impl Shape {
    pub fn tuple_of(element: Shape, arity: usize) -> Self {
        Self::Tuple(vec![element; arity])
    }

    pub fn nullable(inner: Shape) -> Self {
        Self::Nullable(Box::new(inner))
    }

    pub fn optional(inner: Shape) -> Self {
        Self::Optional(Box::new(inner))
    }

    pub fn object(fields: impl IntoIterator<Item = (&'static str, Shape)>) -> Self {
        Self::Object(fields.into_iter().collect())
    }

    fn expected(&self) -> String {
        match self {
            Self::Any => "any value".into(),
            Self::Bool => "boolean".into(),
            Self::Integer => "integer".into(),
            Self::Number => "number".into(),
            Self::Str => "string".into(),
            Self::Literal(literal) => format!("literal \"{literal}\""),
            Self::Nullable(inner) => format!("{} or null", inner.expected()),
            Self::Optional(inner) => inner.expected(),
            Self::Tuple(elements) => format!("tuple of {}", elements.len()),
            Self::Object(_) => "object".into(),
        }
    }

    fn check_at(&self, value: &Value, path: &str) -> Result<(), Mismatch> {
        let mismatch = || Mismatch {
            path: path.to_string(),
            reason: format!("expected {}, got {}", self.expected(), describe(value)),
        };

        match self {
            Self::Any => Ok(()),
            Self::Bool if value.is_boolean() => Ok(()),
            Self::Integer if value.is_i64() || value.is_u64() => Ok(()),
            Self::Number if value.is_number() => Ok(()),
            Self::Str if value.is_string() => Ok(()),
            Self::Literal(literal) if value.as_str() == Some(*literal) => Ok(()),
            Self::Nullable(_) if value.is_null() => Ok(()),
            Self::Nullable(inner) | Self::Optional(inner) => inner.check_at(value, path),
            Self::Tuple(elements) => {
                let Some(items) = value.as_array() else {
                    return Err(mismatch());
                };
                if items.len() != elements.len() {
                    return Err(Mismatch {
                        path: path.to_string(),
                        reason: format!(
                            "expected tuple of {}, got {} elements",
                            elements.len(),
                            items.len()
                        ),
                    });
                }
                for (index, (shape, item)) in elements.iter().zip(items).enumerate() {
                    shape.check_at(item, &format!("{path}[{index}]"))?;
                }
                Ok(())
            }
            Self::Object(fields) => {
                let Some(map) = value.as_object() else {
                    return Err(mismatch());
                };
                for (name, shape) in fields {
                    let field_path = format!("{path}.{name}");
                    match (map.get(*name), shape) {
                        (None, Self::Optional(_)) => {}
                        (None, _) => {
                            return Err(Mismatch {
                                path: field_path,
                                reason: "missing required field".into(),
                            })
                        }
                        (Some(field), shape) => shape.check_at(field, &field_path)?,
                    }
                }
                Ok(())
            }
            _ => Err(mismatch()),
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "non-integer number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A named shape: the gate every inbound event payload and outbound command
/// envelope passes before it is trusted.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    name: String,
    root: &'static str,
    shape: Shape,
}

impl Contract {
    /// Contract for the `data` payload of the event called `name`.
    pub fn event_data(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            root: "data",
            shape,
        }
    }

    /// Contract for a whole `{action, value}` command envelope. `value: None`
    /// describes value-less commands such as `StopAllAxes`.
    pub fn command(action: &'static str, value: Option<Shape>) -> Self {
        let mut fields = vec![("action", Shape::Literal(action))];
        if let Some(value) = value {
            fields.push(("value", value));
        }
        Self {
            name: action.to_string(),
            root: "$",
            shape: Shape::Object(fields),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check(&self, value: &Value) -> Result<(), SchemaViolation> {
        self.shape
            .check_at(value, self.root)
            .map_err(|mismatch| SchemaViolation {
                contract: self.name.clone(),
                path: mismatch.path,
                reason: mismatch.reason,
            })
    }

    /// Structural check followed by a typed decode. Decode failures that slip
    /// past the structural check (integer overflow for narrow fields) are
    /// reported as violations too.
    pub fn parse<T: DeserializeOwned>(&self, value: Value) -> Result<T, SchemaViolation> {
        self.check(&value)?;
        serde_json::from_value(value).map_err(|err| SchemaViolation {
            contract: self.name.clone(),
            path: self.root.to_string(),
            reason: err.to_string(),
        })
    }
}
