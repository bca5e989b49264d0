//! Seed and extracted record shapes.
//!
//! Records are loosely typed: `name` is required, everything else is
//! optional and omitted when empty. Fields the model returns beyond the
//! known ones are preserved in `extra`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::key;

/// The seed record stored as `index.json` in each entity directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institute: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Seed {
    pub fn from_url(url: &str) -> Self {
        Seed {
            key: key::url_key(url),
            url: Some(url.trim().to_string()),
            ..Default::default()
        }
    }

    pub fn from_person(name: &str, institute: Option<&str>) -> Self {
        Seed {
            key: key::identity_key(name, institute),
            name: Some(name.trim().to_string()),
            institute: institute.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            ..Default::default()
        }
    }

    /// Short human label for logs.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.url.as_deref())
            .unwrap_or(&self.key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacultyMember {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub introduction: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profile_url: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    #[serde(default, deserialize_with = "year", skip_serializing_if = "String::is_empty")]
    pub start_year: String,
    #[serde(default, deserialize_with = "year", skip_serializing_if = "String::is_empty")]
    pub end_year: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub institute: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub department: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScholarProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub institute: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub department: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub research_interests: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub education: Vec<Experience>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub experiences: Vec<Experience>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profile_url: String,
    #[serde(default, deserialize_with = "year", skip_serializing_if = "String::is_empty")]
    pub start_year: String,
    #[serde(default, deserialize_with = "year", skip_serializing_if = "String::is_empty")]
    pub end_year: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_alumni: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Years arrive as `"2012"` or `2012`; both are stored as text.
fn year<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected a year, got {other}"))),
    }
}

const PLACEHOLDERS: &[&str] = &["n/a", "na", "unknown", "none", "null", "-", "--", "not available"];

/// Replace placeholder strings with empty ones, recursively, and drop
/// object keys whose value ends up empty or null.
pub fn scrub_placeholders(value: &mut Value) {
    match value {
        Value::String(s) => {
            let t = s.trim();
            if PLACEHOLDERS.iter().any(|p| t.eq_ignore_ascii_case(p)) {
                s.clear();
            } else if t.len() != s.len() {
                *s = t.to_string();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(scrub_placeholders),
        Value::Object(map) => {
            for v in map.values_mut() {
                scrub_placeholders(v);
            }
            map.retain(|k, v| k == "name" || !is_blank(v));
        }
        _ => {}
    }
}

fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
