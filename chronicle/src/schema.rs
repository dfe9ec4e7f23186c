use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

// Salesforce record IDs: 15 or 18 alphanumeric characters
static SALESFORCE_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]{15,18}$").unwrap());

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldType {
    String,
    Numeric,
    Boolean,
    Timestamp,
    Json,
}

impl FieldType {
    /// Nulls are judged by the required-field rule, not here.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string() || value.is_null(),
            FieldType::Numeric => value.is_number() || value.is_null(),
            FieldType::Boolean => value.is_boolean() || value.is_null(),
            // Timestamps arrive as ISO strings; format is checked separately
            FieldType::Timestamp => value.is_string() || value.is_null(),
            FieldType::Json => value.is_object() || value.is_string() || value.is_null(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Numeric => "numeric",
            FieldType::Boolean => "boolean",
            FieldType::Timestamp => "timestamp",
            FieldType::Json => "json",
        }
    }
}

/// Validation descriptor for one object type. Everything the validator
/// and extractor need to know about an entity kind lives here, so adding
/// an object type means adding a descriptor, not another branch.
#[derive(Clone, Debug)]
pub struct ObjectSchema {
    pub name: String,
    pub required_fields: Vec<&'static str>,
    pub field_types: HashMap<&'static str, FieldType>,
    pub foreign_keys: Vec<&'static str>,
}

/// Registry mapping object-type tag to its schema descriptor.
pub struct SchemaRegistry {
    schemas: HashMap<String, ObjectSchema>,
}

impl SchemaRegistry {
    /// The object types the platform ingests today.
    pub fn with_defaults() -> Self {
        let mut schemas = HashMap::new();

        schemas.insert(
            "Account".to_string(),
            ObjectSchema {
                name: "Account".to_string(),
                required_fields: vec!["id", "name", "created_date", "last_modified_date"],
                field_types: HashMap::from([
                    ("id", FieldType::String),
                    ("name", FieldType::String),
                    ("type", FieldType::String),
                    ("industry", FieldType::String),
                    ("annual_revenue", FieldType::Numeric),
                    ("phone", FieldType::String),
                    ("website", FieldType::String),
                    ("billing_address", FieldType::Json),
                    ("shipping_address", FieldType::Json),
                    ("created_date", FieldType::Timestamp),
                    ("last_modified_date", FieldType::Timestamp),
                ]),
                foreign_keys: vec![],
            },
        );

        schemas.insert(
            "Contact".to_string(),
            ObjectSchema {
                name: "Contact".to_string(),
                required_fields: vec![
                    "id",
                    "first_name",
                    "last_name",
                    "created_date",
                    "last_modified_date",
                ],
                field_types: HashMap::from([
                    ("id", FieldType::String),
                    ("account_id", FieldType::String),
                    ("first_name", FieldType::String),
                    ("last_name", FieldType::String),
                    ("email", FieldType::String),
                    ("phone", FieldType::String),
                    ("title", FieldType::String),
                    ("created_date", FieldType::Timestamp),
                    ("last_modified_date", FieldType::Timestamp),
                ]),
                foreign_keys: vec!["account_id"],
            },
        );

        schemas.insert(
            "Opportunity".to_string(),
            ObjectSchema {
                name: "Opportunity".to_string(),
                required_fields: vec![
                    "id",
                    "name",
                    "stage_name",
                    "created_date",
                    "last_modified_date",
                ],
                field_types: HashMap::from([
                    ("id", FieldType::String),
                    ("account_id", FieldType::String),
                    ("name", FieldType::String),
                    ("stage_name", FieldType::String),
                    ("amount", FieldType::Numeric),
                    ("probability", FieldType::Numeric),
                    ("close_date", FieldType::Timestamp),
                    ("is_won", FieldType::Boolean),
                    ("is_closed", FieldType::Boolean),
                    ("created_date", FieldType::Timestamp),
                    ("last_modified_date", FieldType::Timestamp),
                ]),
                foreign_keys: vec!["account_id"],
            },
        );

        schemas.insert(
            "Case".to_string(),
            ObjectSchema {
                name: "Case".to_string(),
                required_fields: vec![
                    "id",
                    "subject",
                    "status",
                    "created_date",
                    "last_modified_date",
                ],
                field_types: HashMap::from([
                    ("id", FieldType::String),
                    ("account_id", FieldType::String),
                    ("contact_id", FieldType::String),
                    ("subject", FieldType::String),
                    ("description", FieldType::String),
                    ("status", FieldType::String),
                    ("origin", FieldType::String),
                    ("priority", FieldType::String),
                    ("is_escalated", FieldType::Boolean),
                    ("is_closed", FieldType::Boolean),
                    ("created_date", FieldType::Timestamp),
                    ("last_modified_date", FieldType::Timestamp),
                ]),
                foreign_keys: vec!["account_id", "contact_id"],
            },
        );

        Self { schemas }
    }

    pub fn get(&self, object_type: &str) -> Option<&ObjectSchema> {
        self.schemas.get(object_type)
    }

    pub fn contains(&self, object_type: &str) -> bool {
        self.schemas.contains_key(object_type)
    }

    pub fn object_types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(|k| k.as_str())
    }

    pub fn id_pattern(&self) -> &Regex {
        &SALESFORCE_ID_PATTERN
    }
}
