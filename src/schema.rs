//! Component B — the user's declared type catalog. Read-only from the
//! runtime's perspective: only `save_catalog` (invoked by the user via the
//! UI/REST, never by the improver) writes it.

use crate::error::Result;
use crate::model::{FieldValue, StructuredData};
use crate::persist;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    #[serde(rename = "string[]")]
    StringArray,
    Number,
    Boolean,
    Enum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub values: Option<Vec<String>>,
    #[serde(default)]
    pub default: Option<FieldValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaType {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub fields: BTreeMap<String, FieldSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub version: u32,
    pub types: Vec<SchemaType>,
}

impl Catalog {
    pub fn find(&self, name: &str) -> Option<&SchemaType> {
        self.types.iter().find(|t| t.name == name)
    }
}

/// Loads the catalog from `path`. Returns `Ok(None)` when the file is
/// absent so typed operations can degrade to untyped ones.
pub fn load_catalog(path: &Path) -> Result<Option<Catalog>> {
    persist::load_json(path)
}

pub fn save_catalog(path: &Path, catalog: &Catalog) -> Result<()> {
    persist::save_json(path, catalog)
}

/// Validates `data` against `type_name` in `catalog`. Unknown fields in
/// `data` are preserved and never reported as errors (forward-compatible).
/// Returns `(is_valid, errors)`; the caller persists the entry regardless.
pub fn validate(catalog: &Catalog, type_name: &str, data: &StructuredData) -> (bool, Vec<String>) {
    let Some(schema_type) = catalog.find(type_name) else {
        return (false, vec!["Unknown context type".to_string()]);
    };

    let mut errors = Vec::new();
    for (field_name, spec) in &schema_type.fields {
        let value = data.get(field_name);
        if spec.required && value.is_none() {
            errors.push(format!("\"{field_name}\" is required"));
            continue;
        }
        let Some(value) = value else { continue };
        match (spec.kind, value) {
            (FieldKind::String, FieldValue::String(s)) => {
                if spec.required && s.trim().is_empty() {
                    errors.push(format!("\"{field_name}\" must not be empty"));
                }
            }
            (FieldKind::StringArray, FieldValue::StringList(_)) => {}
            (FieldKind::Number, FieldValue::Number(_)) => {}
            (FieldKind::Boolean, FieldValue::Boolean(_)) => {}
            (FieldKind::Enum, FieldValue::String(s)) => {
                let allowed = spec.values.as_deref().unwrap_or(&[]);
                if !allowed.iter().any(|v| v == s) {
                    errors.push(format!("\"{field_name}\" must be one of the declared values"));
                }
            }
            _ => errors.push(format!("\"{field_name}\" has the wrong kind")),
        }
    }
    (errors.is_empty(), errors)
}

/// Deterministic rendering used so typed entries remain substring-searchable:
/// `"[type] key: value | key: value | ..."`, arrays joined with `", "`,
/// missing values skipped.
pub fn render_content(type_name: &str, data: &StructuredData) -> String {
    let parts: Vec<String> = data
        .iter()
        .map(|(k, v)| format!("{k}: {}", v.as_display()))
        .collect();
    format!("[{type_name}] {}", parts.join(" | "))
}

/// A human-readable description of the catalog for presentation to agents.
pub fn describe(catalog: Option<&Catalog>) -> String {
    let Some(catalog) = catalog else {
        return "No schema is configured. Use save_typed_context with an untyped save, \
                or ask the user to add a schema file."
            .to_string();
    };
    if catalog.types.is_empty() {
        return "The schema catalog is empty.".to_string();
    }

    let mut out = format!("Schema catalog (version {}):\n", catalog.version);
    for t in &catalog.types {
        out.push_str(&format!("\n- {} — {}\n", t.name, t.description));
        for (field_name, spec) in &t.fields {
            let req = if spec.required { "required" } else { "optional" };
            out.push_str(&format!("    {field_name}: {:?} ({req})\n", spec.kind));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision_catalog() -> Catalog {
        let mut fields = BTreeMap::new();
        fields.insert(
            "what".to_string(),
            FieldSpec {
                kind: FieldKind::String,
                required: true,
                description: None,
                values: None,
                default: None,
            },
        );
        fields.insert(
            "why".to_string(),
            FieldSpec {
                kind: FieldKind::String,
                required: true,
                description: None,
                values: None,
                default: None,
            },
        );
        Catalog {
            version: 1,
            types: vec![SchemaType {
                name: "decision".to_string(),
                description: "a decision and its rationale".to_string(),
                fields,
            }],
        }
    }

    #[test]
    fn missing_required_field_is_reported_by_name() {
        let catalog = decision_catalog();
        let mut data = StructuredData::new();
        data.insert(
            "what".to_string(),
            FieldValue::String("Use Redis".to_string()),
        );
        let (valid, errors) = validate(&catalog, "decision", &data);
        assert!(!valid);
        assert!(errors.iter().any(|e| e.contains("\"why\"")));
    }

    #[test]
    fn unknown_type_yields_single_error() {
        let catalog = decision_catalog();
        let (valid, errors) = validate(&catalog, "nonexistent", &StructuredData::new());
        assert!(!valid);
        assert_eq!(errors, vec!["Unknown context type".to_string()]);
    }

    #[test]
    fn render_content_skips_nothing_and_joins_with_pipes() {
        let mut data = StructuredData::new();
        data.insert(
            "what".to_string(),
            FieldValue::String("Use Redis".to_string()),
        );
        data.insert(
            "why".to_string(),
            FieldValue::String("fast cache".to_string()),
        );
        let rendered = render_content("decision", &data);
        assert!(rendered.starts_with("[decision] "));
        assert!(rendered.contains("what: Use Redis"));
        assert!(rendered.contains("why: fast cache"));
    }
}
