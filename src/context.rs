//! Evaluation context and its query-string fingerprint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute value accepted in an evaluation context.
///
/// Only strings and numbers are representable; an absent attribute is
/// simply not present in the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Number(serde_json::Number),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Number(value.into())
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Number(value.into())
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        AttributeValue::Number(value.into())
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        // NaN and infinities have no JSON number form
        match serde_json::Number::from_f64(value) {
            Some(n) => AttributeValue::Number(n),
            None => AttributeValue::String(value.to_string()),
        }
    }
}

/// A user or company in the evaluation context.
///
/// `id` may be absent while the entity is not yet identified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<AttributeValue>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl EntityContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<AttributeValue>) -> Self {
        Self {
            id: Some(id.into()),
            attributes: BTreeMap::new(),
        }
    }

    pub fn name(self, name: impl Into<String>) -> Self {
        self.attribute("name", name.into())
    }

    pub fn email(self, email: impl Into<String>) -> Self {
        self.attribute("email", email.into())
    }

    /// Set an attribute. Setting `id` this way sets the identifier.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        let key = key.into();
        if key == "id" {
            self.id = Some(value.into());
        } else {
            self.attributes.insert(key, value.into());
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        if key == "id" {
            self.id.as_ref()
        } else {
            self.attributes.get(key)
        }
    }

    fn flatten_into(&self, prefix: &str, out: &mut Vec<(String, String)>) {
        if let Some(ref id) = self.id {
            out.push((format!("{}.id", prefix), id.to_string()));
        }
        for (key, value) in &self.attributes {
            out.push((format!("{}.{}", prefix, key), value.to_string()));
        }
    }
}

/// Attributes flags are evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<EntityContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<EntityContext>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub other: BTreeMap<String, AttributeValue>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> EvaluationContextBuilder {
        EvaluationContextBuilder::new()
    }

    pub fn is_empty(&self) -> bool {
        self.company.is_none() && self.user.is_none() && self.other.is_empty()
    }

    /// Flatten into `context.<section>.<attr>` pairs, unsorted.
    pub fn flatten(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(ref company) = self.company {
            company.flatten_into("context.company", &mut out);
        }
        if let Some(ref user) = self.user {
            user.flatten_into("context.user", &mut out);
        }
        for (key, value) in &self.other {
            out.push((format!("context.other.{}", key), value.to_string()));
        }
        out
    }

    /// Sorted query parameters for an evaluation request, including the
    /// publishable key.
    pub fn query_params(&self, publishable_key: &str) -> Vec<(String, String)> {
        let mut params = self.flatten();
        params.push(("publishableKey".to_string(), publishable_key.to_string()));
        // stable sort keeps insertion order between equal keys
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    /// Deterministic cache key for this context and publishable key.
    ///
    /// This is the URL-encoded query string sent to the evaluation endpoint.
    pub fn fingerprint(&self, publishable_key: &str) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query_params(publishable_key))
            .finish()
    }
}

/// Builder for [`EvaluationContext`].
#[derive(Debug, Default)]
pub struct EvaluationContextBuilder {
    company: Option<EntityContext>,
    user: Option<EntityContext>,
    other: BTreeMap<String, AttributeValue>,
}

impl EvaluationContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn company(mut self, company: EntityContext) -> Self {
        self.company = Some(company);
        self
    }

    pub fn user(mut self, user: EntityContext) -> Self {
        self.user = Some(user);
        self
    }

    pub fn other(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.other.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> EvaluationContext {
        EvaluationContext {
            company: self.company,
            user: self.user,
            other: self.other,
        }
    }
}
