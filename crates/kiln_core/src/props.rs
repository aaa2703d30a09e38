//! Component properties and their schemas.
//!
//! Typed components declare their props as a plain struct implementing
//! [`Props`]. The schema describes each field so untyped input (YAML files,
//! JSON maps) can be checked before it is deserialized:
//!
//! ```rust,ignore
//! impl Props for ResticProps {
//!     fn schema() -> PropSchema {
//!         PropSchema::new("ResticRepository")
//!             .field("repository", PropField::required(PropKind::String).deferrable())
//!             .field("restic_binary", PropField::optional(PropKind::String).default("restic"))
//!     }
//! }
//! ```

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{KilnError, KilnResult};
use crate::lazy::Origin;

/// Expected shape of a prop value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKind {
    String,
    Integer,
    Number,
    Bool,
    List,
    Map,
    Any,
}

impl PropKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            PropKind::String => value.is_string(),
            PropKind::Integer => value.is_i64() || value.is_u64(),
            PropKind::Number => value.is_number(),
            PropKind::Bool => value.is_boolean(),
            PropKind::List => value.is_array(),
            PropKind::Map => value.is_object(),
            PropKind::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PropKind::String => "a string",
            PropKind::Integer => "an integer",
            PropKind::Number => "a number",
            PropKind::Bool => "a boolean",
            PropKind::List => "a list",
            PropKind::Map => "a map",
            PropKind::Any => "any value",
        }
    }
}

/// One declared prop.
#[derive(Debug, Clone)]
pub struct PropField {
    pub kind: PropKind,
    pub required: bool,
    pub default: Option<Value>,
    /// Whether the field may carry a deferred value.
    pub deferrable: bool,
}

impl PropField {
    pub fn required(kind: PropKind) -> Self {
        Self {
            kind,
            required: true,
            default: None,
            deferrable: false,
        }
    }

    pub fn optional(kind: PropKind) -> Self {
        Self {
            required: false,
            ..Self::required(kind)
        }
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn deferrable(mut self) -> Self {
        self.deferrable = true;
        self
    }
}

/// Declared props of a component type.
#[derive(Debug, Clone)]
pub struct PropSchema {
    component: String,
    fields: BTreeMap<String, PropField>,
}

impl PropSchema {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, field: PropField) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &PropField)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    pub fn get(&self, name: &str) -> Option<&PropField> {
        self.fields.get(name)
    }

    /// Names of the fields that may carry a deferred value.
    pub fn deferrable_fields(&self) -> impl Iterator<Item = &str> {
        self.fields()
            .filter(|(_, field)| field.deferrable)
            .map(|(name, _)| name)
    }

    /// Check untyped props and fill in defaults.
    ///
    /// Unknown fields, missing required fields and values of the wrong shape
    /// are configuration errors. A `null` counts as missing.
    pub fn check(&self, value: Value) -> KilnResult<Map<String, Value>> {
        let mut input = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(KilnError::configuration(format!(
                    "{}: props must be a map, got {}",
                    self.component, other
                )));
            }
        };

        if let Some(unknown) = input.keys().find(|key| !self.fields.contains_key(*key)) {
            return Err(KilnError::configuration(format!(
                "{}: unknown prop `{}`",
                self.component, unknown
            )));
        }

        let mut checked = Map::new();
        for (name, field) in &self.fields {
            match input.remove(name) {
                Some(Value::Null) | None => {
                    if let Some(default) = &field.default {
                        checked.insert(name.clone(), default.clone());
                    } else if field.required {
                        return Err(KilnError::configuration(format!(
                            "{}: missing required prop `{}`",
                            self.component, name
                        )));
                    }
                }
                Some(value) => {
                    if !field.kind.accepts(&value) {
                        return Err(KilnError::configuration(format!(
                            "{}: prop `{}` must be {}",
                            self.component,
                            name,
                            field.kind.name()
                        )));
                    }
                    checked.insert(name.clone(), value);
                }
            }
        }

        Ok(checked)
    }
}

/// Props of a component type.
pub trait Props: Sized + Send + Sync {
    fn schema() -> PropSchema;

    /// Checks beyond the schema, e.g. "either `a` or `b`".
    fn validate(&self) -> KilnResult<()> {
        Ok(())
    }

    /// Origins of every deferred value the props carry, at most one per
    /// deferrable field.
    ///
    /// [`Node::bind`](crate::Node::bind) rejects props that read from a
    /// component constructed later using only what this returns. Props with
    /// deferrable fields must override it, or back-references in those fields
    /// go unnoticed until deploy.
    fn references(&self) -> Vec<Origin> {
        Vec::new()
    }

    /// Build props from an untyped value checked against [`Props::schema`].
    fn from_value(value: Value) -> KilnResult<Self>
    where
        Self: DeserializeOwned,
    {
        let schema = Self::schema();
        let checked = schema.check(value)?;
        serde_json::from_value(Value::Object(checked)).map_err(|err| {
            KilnError::configuration(format!("{}: {}", schema.component(), err))
        })
    }

    fn from_yaml(yaml: &str) -> KilnResult<Self>
    where
        Self: DeserializeOwned,
    {
        let value: Value = serde_yaml::from_str(yaml)
            .map_err(|err| KilnError::configuration(format!("invalid props: {}", err)))?;
        Self::from_value(value)
    }
}

/// Collect the origins of a set of maybe-deferred fields.
///
/// ```rust,ignore
/// fn references(&self) -> Vec<Origin> {
///     references([self.repository.origin(), self.password.origin()])
/// }
/// ```
pub fn references<'a>(origins: impl IntoIterator<Item = Option<&'a Origin>>) -> Vec<Origin> {
    origins.into_iter().flatten().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lazy::Maybe;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct RepoProps {
        repository: Maybe<String>,
        restic_binary: String,
        #[serde(default)]
        retries: Option<u32>,
    }

    impl Props for RepoProps {
        fn schema() -> PropSchema {
            PropSchema::new("Repo")
                .field(
                    "repository",
                    PropField::required(PropKind::String).deferrable(),
                )
                .field(
                    "restic_binary",
                    PropField::optional(PropKind::String).default("restic"),
                )
                .field("retries", PropField::optional(PropKind::Integer))
        }

        fn validate(&self) -> KilnResult<()> {
            if self.restic_binary.is_empty() {
                return Err(KilnError::configuration("restic_binary is empty"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_defaults_are_applied() {
        let props = RepoProps::from_value(json!({"repository": "/srv/restic"})).unwrap();

        assert_eq!(props.restic_binary, "restic");
        assert_eq!(props.retries, None);
        assert!(!props.repository.is_deferred());
    }

    #[test]
    fn test_missing_required_prop() {
        let err = RepoProps::from_value(json!({"repository": null})).unwrap_err();
        assert!(matches!(err, KilnError::Configuration(_)));
        assert!(err.to_string().contains("missing required prop `repository`"));
    }

    #[test]
    fn test_unknown_prop() {
        let err = RepoProps::from_value(json!({"repository": "x", "repo": "y"})).unwrap_err();
        assert!(err.to_string().contains("unknown prop `repo`"));
    }

    #[test]
    fn test_wrong_kind() {
        let err = RepoProps::from_value(json!({"repository": "x", "retries": "3"})).unwrap_err();
        assert!(err.to_string().contains("`retries` must be an integer"));
    }

    #[test]
    fn test_from_yaml() {
        let props = RepoProps::from_yaml("repository: \"b2:media:\"\nretries: 2\n").unwrap();
        assert_eq!(props.retries, Some(2));

        let err = RepoProps::from_yaml("- not\n- a map\n").unwrap_err();
        assert!(err.to_string().contains("props must be a map"));
    }

    #[test]
    fn test_schema_lookup() {
        let schema = RepoProps::schema();
        assert!(schema.get("repository").unwrap().deferrable);
        assert!(!schema.get("restic_binary").unwrap().required);
        assert_eq!(schema.fields().count(), 3);
    }
}
