//! Property schemas for action and condition classes.

use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};
use crate::types::{DeviceContext, PropertyValues};

/// Value type accepted by a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    String,
    Number,
    Boolean,
    /// A `plugin:device` reference
    Device,
    Object,
    Any,
}

impl PropertyKind {
    fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            PropertyKind::String => value.is_string(),
            PropertyKind::Number => value.is_number(),
            PropertyKind::Boolean => value.is_boolean(),
            PropertyKind::Device => value
                .as_str()
                .is_some_and(|s| s.parse::<DeviceContext>().is_ok()),
            PropertyKind::Object => value.is_object(),
            PropertyKind::Any => true,
        }
    }
}

/// One declared property of an action or condition class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedProperty {
    pub id: String,
    pub name: String,
    pub kind: PropertyKind,
    #[serde(default)]
    pub required: bool,
}

impl TypedProperty {
    pub fn required(id: impl Into<String>, name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(id: impl Into<String>, name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            required: false,
            ..Self::required(id, name, kind)
        }
    }
}

/// Validate property values against a schema.
///
/// Rejects unknown ids, missing required values and type mismatches. A null
/// value counts as missing.
pub fn validate(schema: &[TypedProperty], values: &PropertyValues) -> HubResult<()> {
    for key in values.keys() {
        if !schema.iter().any(|p| &p.id == key) {
            return Err(HubError::Validation(format!("Unknown property '{}'", key)));
        }
    }

    for prop in schema {
        match values.get(&prop.id) {
            None | Some(serde_json::Value::Null) => {
                if prop.required {
                    return Err(HubError::Validation(format!(
                        "Missing required property '{}'",
                        prop.id
                    )));
                }
            }
            Some(value) if !prop.kind.accepts(value) => {
                return Err(HubError::Validation(format!(
                    "Property '{}' expects {:?}, got {}",
                    prop.id, prop.kind, value
                )));
            }
            Some(_) => {}
        }
    }

    Ok(())
}
