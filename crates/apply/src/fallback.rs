//! Fallback identification keys for tables without a unique index.
//!
//! A handful of system catalog relations carry no primary or unique key;
//! their rows are identified by tuple equality on a documented field set
//! instead. The set ships as configuration data with the catalog defaults
//! below, so a deployment with a different catalog version can override it
//! without rebuilding.

use std::collections::HashMap;

/// Relation-name → identifying-field-names map.
#[derive(Debug, Clone)]
pub struct FallbackKeys {
    tables: HashMap<String, Vec<String>>,
}

impl FallbackKeys {
    /// An empty set: every keyless table fails identification.
    pub fn empty() -> Self {
        FallbackKeys {
            tables: HashMap::new(),
        }
    }

    /// Register (or replace) the identifying fields of a relation.
    pub fn with_table(mut self, relation: &str, fields: &[&str]) -> Self {
        self.tables.insert(
            relation.to_owned(),
            fields.iter().map(|f| (*f).to_owned()).collect(),
        );
        self
    }

    /// The identifying field names of a relation, if registered.
    pub fn fields(&self, relation: &str) -> Option<&[String]> {
        self.tables.get(relation).map(Vec::as_slice)
    }
}

impl Default for FallbackKeys {
    /// The keyless system relations of the stock catalog.
    fn default() -> Self {
        FallbackKeys::empty()
            .with_table("RDB$INDEX_SEGMENTS", &["RDB$INDEX_NAME", "RDB$FIELD_NAME"])
            .with_table(
                "RDB$FUNCTION_ARGUMENTS",
                &["RDB$FUNCTION_NAME", "RDB$ARGUMENT_POSITION"],
            )
            .with_table(
                "RDB$CHECK_CONSTRAINTS",
                &["RDB$CONSTRAINT_NAME", "RDB$TRIGGER_NAME"],
            )
            .with_table("RDB$VIEW_RELATIONS", &["RDB$VIEW_NAME", "RDB$VIEW_CONTEXT"])
            .with_table(
                "RDB$TRIGGER_MESSAGES",
                &["RDB$TRIGGER_NAME", "RDB$MESSAGE_NUMBER"],
            )
            .with_table("RDB$FIELD_DIMENSIONS", &["RDB$FIELD_NAME", "RDB$DIMENSION"])
            .with_table("RDB$FILES", &["RDB$FILE_NAME"])
            .with_table(
                "RDB$USER_PRIVILEGES",
                &[
                    "RDB$USER",
                    "RDB$USER_TYPE",
                    "RDB$OBJECT_TYPE",
                    "RDB$PRIVILEGE",
                    "RDB$GRANT_OPTION",
                    "RDB$GRANTOR",
                    "RDB$RELATION_NAME",
                    "RDB$FIELD_NAME",
                ],
            )
            .with_table("RDB$DB_CREATORS", &["RDB$USER", "RDB$USER_TYPE"])
    }
}
