//! Entity trait: identity, schema and row conversion for stored records.

use core::fmt::{Debug, Display};
use core::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DomainError, DomainResult};

/// A row as handed to and returned from a data store.
pub type Row = Map<String, Value>;

/// How many related records a relationship yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Many,
}

/// A relationship that can be eager-loaded alongside the primary record.
///
/// Related rows are fetched from `target` where `foreign_field` matches the
/// primary row's `local_field`, and attached to the primary row under `name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    pub name: &'static str,
    pub target: &'static str,
    pub local_field: &'static str,
    pub foreign_field: &'static str,
    pub cardinality: Cardinality,
}

/// Entity marker + schema.
///
/// The associated constants describe the stored shape so queries can be
/// validated before they reach a store.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + Hash + Debug + Display + Serialize + Send + Sync + 'static;

    /// Caller-supplied input used by `create`.
    type Input: Send + 'static;

    /// Table (collection) name in the backing store.
    const TABLE: &'static str;

    /// Stored attribute names, including the id field.
    const FIELDS: &'static [&'static str];

    /// Name of the identifier attribute.
    const ID_FIELD: &'static str = "id";

    /// Attributes that must be unique across the table.
    const UNIQUE_FIELDS: &'static [&'static str] = &[];

    /// Relationships available for eager loading.
    const RELATIONS: &'static [Relation] = &[];

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Build a new entity from caller input (assigns id and timestamps).
    fn from_input(input: Self::Input) -> Self;

    fn has_field(name: &str) -> bool {
        Self::FIELDS.contains(&name)
    }

    fn relation(name: &str) -> Option<&'static Relation> {
        Self::RELATIONS.iter().find(|r| r.name == name)
    }
}

/// Serialize an entity into a storable row.
///
/// Relationship attributes are stripped: they are populated on read only.
pub fn to_row<E: Entity>(entity: &E) -> DomainResult<Row> {
    match serde_json::to_value(entity)? {
        Value::Object(mut row) => {
            for relation in E::RELATIONS {
                row.remove(relation.name);
            }
            Ok(row)
        }
        other => Err(DomainError::serialization(format!(
            "{} serialized to a non-object value: {other}",
            E::TABLE
        ))),
    }
}

/// Deserialize an entity from a row.
pub fn from_row<E: Entity>(row: Row) -> DomainResult<E> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

/// A partial update expressed as field -> new value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch {
    fields: Row,
    /// First value that failed to serialize; reported by `validate_for`.
    #[serde(skip)]
    rejected: Option<DomainError>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field. A value that cannot be represented as JSON is not stored;
    /// the patch then fails [`validate_for`](Self::validate_for).
    pub fn set(mut self, field: impl Into<String>, value: impl Serialize) -> Self {
        let field = field.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.fields.insert(field, value);
            }
            Err(err) => {
                if self.rejected.is_none() {
                    self.rejected = Some(DomainError::invalid_query(
                        field,
                        format!("value cannot be serialized: {err}"),
                    ));
                }
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Reject unserializable values, unknown fields and attempts to change the identifier.
    pub fn validate_for<E: Entity>(&self) -> DomainResult<()> {
        if let Some(err) = &self.rejected {
            return Err(err.clone());
        }
        for field in self.fields() {
            if field == E::ID_FIELD {
                return Err(DomainError::invalid_query(field, "identifier is immutable"));
            }
            if !E::has_field(field) {
                return Err(DomainError::invalid_query(
                    field,
                    format!("unknown field for {}", E::TABLE),
                ));
            }
        }
        Ok(())
    }

    /// Overlay the patch onto a row.
    pub fn apply_to(&self, row: &mut Row) {
        for (field, value) in &self.fields {
            row.insert(field.clone(), value.clone());
        }
    }
}

impl From<Row> for Patch {
    fn from(fields: Row) -> Self {
        Self {
            fields,
            rejected: None,
        }
    }
}
