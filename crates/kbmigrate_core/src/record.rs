use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

pub const ARTICLE_TABLE: &str = "kb_knowledge";
pub const ATTACHMENT_TABLE: &str = "sys_attachment";
pub const CATEGORY_TABLE: &str = "kb_category";

pub const STATE_PUBLISHED: &str = "published";
pub const STATE_OUTDATED: &str = "outdated";

/// Fields requested for full article records.
pub const ARTICLE_FIELDS: &[&str] = &[
    "sys_id",
    "number",
    "short_description",
    "text",
    "workflow_state",
    "kb_knowledge_base",
    "kb_category",
    "author",
    "sys_created_on",
    "sys_updated_on",
    "version",
    "language",
    "parent",
    "translated_from",
];

/// Fields requested when a record only takes part in translation discovery.
pub const TRANSLATION_FIELDS: &[&str] = &[
    "sys_id",
    "number",
    "short_description",
    "text",
    "language",
    "workflow_state",
    "sys_updated_on",
    "parent",
];

/// A single field as returned by the source platform, normalized once at the
/// store boundary so no component has to sniff shapes again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Reference {
        value: String,
        display_value: String,
    },
}

impl FieldValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Text(String::new()),
            Value::String(text) => Self::Text(text.clone()),
            Value::Bool(flag) => Self::Text(flag.to_string()),
            Value::Number(number) => Self::Text(number.to_string()),
            Value::Object(map) => {
                let value = map.get("value").map(json_scalar).unwrap_or_default();
                let display_value = map
                    .get("display_value")
                    .map(json_scalar)
                    .unwrap_or_default();
                Self::Reference {
                    value,
                    display_value,
                }
            }
            Value::Array(items) => Self::Text(
                items
                    .iter()
                    .map(json_scalar)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        }
    }

    /// Raw value (the sys_id for references).
    pub fn value(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Reference { value, .. } => value,
        }
    }

    /// Human-readable value, falling back to the raw value.
    pub fn display(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Reference {
                value,
                display_value,
            } => {
                if display_value.trim().is_empty() {
                    value
                } else {
                    display_value
                }
            }
        }
    }
}

fn json_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// A source record: field name to normalized value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn from_json(value: &Value) -> Self {
        let mut fields = BTreeMap::new();
        if let Some(map) = value.as_object() {
            for (key, field) in map {
                fields.insert(key.clone(), FieldValue::from_json(field));
            }
        }
        Self { fields }
    }

    pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn with_text(self, name: &str, value: &str) -> Self {
        self.with_field(name, FieldValue::Text(value.to_string()))
    }

    pub fn with_reference(self, name: &str, value: &str, display_value: &str) -> Self {
        self.with_field(
            name,
            FieldValue::Reference {
                value: value.to_string(),
                display_value: display_value.to_string(),
            },
        )
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn value(&self, name: &str) -> &str {
        self.field(name).map(FieldValue::value).unwrap_or("")
    }

    pub fn display(&self, name: &str) -> &str {
        self.field(name).map(FieldValue::display).unwrap_or("")
    }

    /// Non-empty trimmed raw value, if any.
    pub fn reference_id(&self, name: &str) -> Option<&str> {
        let value = self.value(name).trim();
        if value.is_empty() { None } else { Some(value) }
    }

    pub fn sys_id(&self) -> &str {
        self.value("sys_id")
    }
}

/// Outcome of a keyed lookup. Transport failures travel in the surrounding
/// `Result`, so "absent" stays an ordinary branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Typed view of a knowledge article record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleRecord {
    pub sys_id: String,
    pub number: String,
    pub title: String,
    pub text: String,
    pub workflow_state: String,
    pub language: String,
    pub author: String,
    pub created_on: String,
    pub updated_on: String,
    pub category_id: Option<String>,
    pub category_label: Option<String>,
    pub parent_id: Option<String>,
    pub translated_from: Option<String>,
}

impl ArticleRecord {
    pub fn from_record(record: &Record) -> Self {
        let category_label = record.display("kb_category").trim();
        Self {
            sys_id: record.value("sys_id").trim().to_string(),
            number: record.value("number").trim().to_string(),
            title: record.display("short_description").to_string(),
            text: record.value("text").to_string(),
            workflow_state: record.value("workflow_state").trim().to_string(),
            language: record.value("language").trim().to_string(),
            author: record.display("author").to_string(),
            created_on: record.value("sys_created_on").to_string(),
            updated_on: record.value("sys_updated_on").to_string(),
            category_id: record.reference_id("kb_category").map(ToString::to_string),
            category_label: if category_label.is_empty() {
                None
            } else {
                Some(category_label.to_string())
            },
            parent_id: record.reference_id("parent").map(ToString::to_string),
            translated_from: record
                .reference_id("translated_from")
                .map(ToString::to_string),
        }
    }

    /// Title used in filenames and reports, falling back to the number.
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.number
        } else {
            &self.title
        }
    }
}
