//! Metadata snapshot models.
//!
//! Introspection produces [`StructuralFact`]s. The extractor stamps them with a
//! connection id and extraction time to form [`MetadataEntry`] rows, grouped in
//! a [`Snapshot`] that is replaced as a whole on refresh.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Kind of schema object described by a metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Schema,
    Table,
    View,
    Column,
    Index,
    ForeignKey,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Table => "table",
            Self::View => "view",
            Self::Column => "column",
            Self::Index => "index",
            Self::ForeignKey => "foreign_key",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "schema" => Some(Self::Schema),
            "table" => Some(Self::Table),
            "view" => Some(Self::View),
            "column" => Some(Self::Column),
            "index" => Some(Self::Index),
            "foreign_key" => Some(Self::ForeignKey),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object attributes. Which fields are set depends on the object type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectAttributes {
    /// Native type name as reported by the database (columns)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    /// Dialect-neutral type name (columns)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    /// 1-based
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal_position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Indexed or referencing columns (indexes, foreign keys)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    /// Referenced `table(col, ...)` (foreign keys)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// One fact about the structure of a database, as reported by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralFact {
    pub object_type: ObjectType,
    pub schema_name: Option<String>,
    /// Columns, indexes and foreign keys are qualified by their table: `orders.id`
    pub object_name: String,
    pub attributes: ObjectAttributes,
}

impl StructuralFact {
    pub fn new(
        object_type: ObjectType,
        schema_name: Option<String>,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            object_type,
            schema_name,
            object_name: object_name.into(),
            attributes: ObjectAttributes::default(),
        }
    }

    /// Fact for an object that belongs to a table (column, index, foreign key).
    pub fn table_child(
        object_type: ObjectType,
        schema_name: Option<String>,
        table: &str,
        name: &str,
    ) -> Self {
        Self::new(object_type, schema_name, format!("{}.{}", table, name))
    }

    pub fn with_attributes(mut self, attributes: ObjectAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

/// A stored metadata row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub connection_id: String,
    pub object_type: ObjectType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub object_name: String,
    pub attributes: ObjectAttributes,
    pub extracted_at: DateTime<Utc>,
}

impl MetadataEntry {
    pub fn from_fact(
        connection_id: impl Into<String>,
        fact: StructuralFact,
        extracted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            object_type: fact.object_type,
            schema_name: fact.schema_name,
            object_name: fact.object_name,
            attributes: fact.attributes,
            extracted_at,
        }
    }
}

/// All metadata entries for one connection, produced by one extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub connection_id: String,
    pub extracted_at: DateTime<Utc>,
    pub entries: Vec<MetadataEntry>,
}

impl Snapshot {
    /// Build a snapshot from adapter facts, stamping every entry with the same time.
    pub fn from_facts(
        connection_id: &str,
        facts: Vec<StructuralFact>,
        extracted_at: DateTime<Utc>,
    ) -> Self {
        let entries = facts
            .into_iter()
            .map(|fact| MetadataEntry::from_fact(connection_id, fact, extracted_at))
            .collect();
        Self {
            connection_id: connection_id.to_string(),
            extracted_at,
            entries,
        }
    }

    /// True if the snapshot was extracted less than `window` before `now`.
    pub fn is_fresh(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.extracted_at);
        match chrono::Duration::from_std(window) {
            Ok(window) => age < window,
            Err(_) => true,
        }
    }

    /// Entries of one object type.
    pub fn entries_of(&self, object_type: ObjectType) -> impl Iterator<Item = &MetadataEntry> {
        self.entries
            .iter()
            .filter(move |e| e.object_type == object_type)
    }

    /// Look up an entry by its natural identity.
    pub fn find(
        &self,
        object_type: ObjectType,
        schema_name: Option<&str>,
        object_name: &str,
    ) -> Option<&MetadataEntry> {
        self.entries.iter().find(|e| {
            e.object_type == object_type
                && e.schema_name.as_deref() == schema_name
                && e.object_name == object_name
        })
    }
}

/// Options for one introspection call.
#[derive(Debug, Clone, Default)]
pub struct IntrospectRequest {
    /// Skip the cached snapshot even if it is fresh
    pub force_refresh: bool,
    /// Defaults to the configured introspection timeout, which also caps it
    pub timeout: Option<Duration>,
    /// Cancelling the token aborts a refresh in flight
    pub cancel: Option<CancellationToken>,
}

impl IntrospectRequest {
    pub fn new(force_refresh: bool) -> Self {
        Self {
            force_refresh,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn effective_timeout(&self, max: Duration) -> Duration {
        self.timeout.unwrap_or(max).min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_introspect_timeout_capped() {
        let max = Duration::from_secs(30);
        assert_eq!(IntrospectRequest::new(false).effective_timeout(max), max);
        let short = IntrospectRequest::new(true).with_timeout(Duration::from_secs(2));
        assert_eq!(short.effective_timeout(max), Duration::from_secs(2));
        let long = IntrospectRequest::new(true).with_timeout(Duration::from_secs(600));
        assert_eq!(long.effective_timeout(max), max);
    }

    fn sample_facts() -> Vec<StructuralFact> {
        vec![
            StructuralFact::new(ObjectType::Table, Some("public".into()), "orders"),
            StructuralFact::table_child(ObjectType::Column, Some("public".into()), "orders", "id")
                .with_attributes(ObjectAttributes {
                    data_type: Some("int4".into()),
                    normalized_type: Some("integer".into()),
                    nullable: Some(false),
                    ordinal_position: Some(1),
                    primary_key: Some(true),
                    ..Default::default()
                }),
        ]
    }

    #[test]
    fn test_snapshot_from_facts() {
        let now = Utc::now();
        let snapshot = Snapshot::from_facts("c1", sample_facts(), now);
        assert_eq!(snapshot.entries.len(), 2);
        assert!(snapshot.entries.iter().all(|e| e.connection_id == "c1"));
        assert!(snapshot.entries.iter().all(|e| e.extracted_at == now));

        let column = snapshot
            .find(ObjectType::Column, Some("public"), "orders.id")
            .unwrap();
        assert_eq!(column.attributes.primary_key, Some(true));
        assert_eq!(snapshot.entries_of(ObjectType::Table).count(), 1);
    }

    #[test]
    fn test_snapshot_freshness() {
        let now = Utc::now();
        let snapshot = Snapshot::from_facts("c1", vec![], now - chrono::Duration::seconds(10));
        assert!(snapshot.is_fresh(Duration::from_secs(60), now));
        assert!(!snapshot.is_fresh(Duration::from_secs(5), now));
        assert!(!snapshot.is_fresh(Duration::ZERO, now));
    }

    #[test]
    fn test_object_type_round_trip_names() {
        for ty in [
            ObjectType::Schema,
            ObjectType::Table,
            ObjectType::View,
            ObjectType::Column,
            ObjectType::Index,
            ObjectType::ForeignKey,
        ] {
            assert_eq!(ObjectType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(ObjectType::parse("trigger"), None);
    }

    #[test]
    fn test_attributes_skip_empty_fields() {
        let json = serde_json::to_value(ObjectAttributes {
            nullable: Some(true),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "nullable": true }));
    }
}
