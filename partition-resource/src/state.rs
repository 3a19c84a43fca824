//! Canonical partition state, built from either the user's parameters or the
//! device's responses.
//!
//! The two sources name the route domain differently (`route_domain` versus
//! `defaultRouteDomain`) and the user may pass it as a numeric string. Both are
//! converged here so that comparisons never see the difference.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::device::{CreatePayload, DeviceFields};

/// User-facing name of the route domain parameter.
pub const ROUTE_DOMAIN: &str = "route_domain";
/// Device-facing name of the route domain attribute.
pub const DEFAULT_ROUTE_DOMAIN: &str = "defaultRouteDomain";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("parameter {0} must not be empty")]
    EmptyParameter(&'static str),

    #[error("parameter {field} must be a string, got {found}")]
    NotAString { field: &'static str, found: Value },

    #[error("parameter {field} must be a non-negative integer or a numeric string, got {found}")]
    InvalidRouteDomain { field: &'static str, found: Value },
}

/// The normalized representation of a partition.
///
/// Optional fields are `None` when they were not specified, which is distinct
/// from being specified as empty or zero. Values are immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalState {
    name: String,
    description: Option<String>,
    route_domain: Option<u32>,
}

impl CanonicalState {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        route_domain: Option<u32>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::EmptyParameter("name"));
        }
        Ok(CanonicalState {
            name,
            description,
            route_domain,
        })
    }

    /// Build from the user vocabulary: `name`, `description`, `route_domain`.
    ///
    /// Unrelated keys, such as connection settings, are ignored.
    pub fn from_user_input(params: &Map<String, Value>) -> Result<Self, ValidationError> {
        Self::normalize(params, &[ROUTE_DOMAIN])
    }

    /// Build from a device read response: `name`, `description`,
    /// `defaultRouteDomain`.
    pub fn from_device_response(raw: &Map<String, Value>) -> Result<Self, ValidationError> {
        Self::normalize(raw, &[DEFAULT_ROUTE_DOMAIN])
    }

    /// Build from a mapping in either vocabulary, for callers holding maps
    /// that mix user parameters with fields copied from a device response.
    /// If both route domain keys are present, `route_domain` takes precedence.
    pub fn from_params(params: &Map<String, Value>) -> Result<Self, ValidationError> {
        Self::normalize(params, &[ROUTE_DOMAIN, DEFAULT_ROUTE_DOMAIN])
    }

    fn normalize(
        params: &Map<String, Value>,
        route_domain_keys: &[&'static str],
    ) -> Result<Self, ValidationError> {
        let name = optional_string(params, "name")?
            .ok_or(ValidationError::MissingParameter("name"))?;
        let description = optional_string(params, "description")?;
        let route_domain = route_domain_keys
            .iter()
            .copied()
            .find_map(|key| match params.get(key) {
                None | Some(Value::Null) => None,
                Some(value) => Some(coerce_route_domain(key, value)),
            })
            .transpose()?;
        Self::new(name, description, route_domain)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn route_domain(&self) -> Option<u32> {
        self.route_domain
    }

    /// Render in the user vocabulary, omitting unspecified fields.
    pub fn to_user_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("name".to_string(), Value::String(self.name.clone()));
        if let Some(description) = &self.description {
            params.insert(
                "description".to_string(),
                Value::String(description.clone()),
            );
        }
        if let Some(route_domain) = self.route_domain {
            params.insert(ROUTE_DOMAIN.to_string(), Value::from(route_domain));
        }
        params
    }

    pub fn to_create_payload(&self) -> CreatePayload {
        CreatePayload {
            name: self.name.clone(),
            fields: self.specified().to_device_fields(),
        }
    }

    /// All settable fields the caller specified.
    pub fn specified(&self) -> PartitionChanges {
        PartitionChanges {
            description: self.description.clone(),
            route_domain: self.route_domain,
        }
    }

    /// The specified fields of `self` that differ from `current`.
    ///
    /// Fields left unspecified in `self` are never reported, whatever their
    /// value on the device. The name is the lookup key and is not compared.
    pub fn diff(&self, current: &CanonicalState) -> PartitionChanges {
        let description = match &self.description {
            Some(want) if current.description.as_ref() != Some(want) => Some(want.clone()),
            _ => None,
        };
        let route_domain = match self.route_domain {
            Some(want) if current.route_domain != Some(want) => Some(want),
            _ => None,
        };
        PartitionChanges {
            description,
            route_domain,
        }
    }
}

/// A set of settable partition fields, keyed by their user-facing names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_domain: Option<u32>,
}

impl PartitionChanges {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.route_domain.is_none()
    }

    pub fn to_device_fields(&self) -> DeviceFields {
        DeviceFields {
            description: self.description.clone(),
            default_route_domain: self.route_domain,
        }
    }
}

fn optional_string(
    params: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ValidationError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ValidationError::NotAString {
            field,
            found: other.clone(),
        }),
    }
}

fn coerce_route_domain(field: &'static str, value: &Value) -> Result<u32, ValidationError> {
    let invalid = || ValidationError::InvalidRouteDomain {
        field,
        found: value.clone(),
    };
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(invalid),
        Value::String(s) => {
            let digits = s.trim();
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            digits.parse::<u32>().map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}
