//! Query specification: filter predicates, sort order and pagination.
//!
//! A [`QuerySpec`] is an immutable, validated description of a read. It is
//! built against an [`Entity`] type so unknown fields are rejected when the
//! query is built rather than when it runs. Stores either translate it
//! (SQL) or evaluate it directly over rows with [`evaluate`].

use core::cmp::Ordering;
use core::fmt;
use core::marker::PhantomData;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{Entity, Row};
use crate::error::{DomainError, DomainResult};
use crate::value::{compare_values, like_matches, values_equal};

/// Comparison operator of a filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    In,
    NotIn,
}

impl FilterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "EQ",
            FilterOp::Ne => "NE",
            FilterOp::Gt => "GT",
            FilterOp::Gte => "GTE",
            FilterOp::Lt => "LT",
            FilterOp::Lte => "LTE",
            FilterOp::Like => "LIKE",
            FilterOp::Ilike => "ILIKE",
            FilterOp::In => "IN",
            FilterOp::NotIn => "NOT_IN",
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single predicate: `field <operator> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub field: String,
    #[serde(rename = "operator")]
    pub op: FilterOp,
    pub value: Value,
}

impl QueryFilter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Like [`new`](Self::new) for any serializable value.
    pub fn try_new(field: impl Into<String>, op: FilterOp, value: impl Serialize) -> DomainResult<Self> {
        let field = field.into();
        let value = serde_json::to_value(value)
            .map_err(|err| DomainError::invalid_query(&field, format!("value cannot be serialized: {err}")))?;
        Ok(Self { field, op, value })
    }

    /// Check operator/value compatibility (field existence is checked by
    /// [`QuerySpecBuilder::build`], which knows the entity schema).
    pub fn validate(&self) -> DomainResult<()> {
        match self.op {
            FilterOp::In | FilterOp::NotIn => match &self.value {
                Value::Array(items) if !items.is_empty() => Ok(()),
                Value::Array(_) => Err(DomainError::invalid_query(
                    &self.field,
                    format!("{} requires a non-empty sequence", self.op),
                )),
                _ => Err(DomainError::invalid_query(
                    &self.field,
                    format!("{} requires a sequence value", self.op),
                )),
            },
            FilterOp::Like | FilterOp::Ilike if !self.value.is_string() => Err(
                DomainError::invalid_query(&self.field, format!("{} requires a string pattern", self.op)),
            ),
            _ => Ok(()),
        }
    }

    /// Evaluate the predicate against a row.
    ///
    /// Follows SQL semantics: a missing or `null` attribute only matches
    /// `EQ null` (`IS NULL`) and `NE` against a non-null value never matches it.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.field).unwrap_or(&Value::Null);

        if self.value.is_null() {
            return match self.op {
                FilterOp::Eq => actual.is_null(),
                FilterOp::Ne => !actual.is_null(),
                _ => false,
            };
        }
        if actual.is_null() {
            return false;
        }

        match self.op {
            FilterOp::Eq => values_equal(actual, &self.value),
            FilterOp::Ne => !values_equal(actual, &self.value),
            FilterOp::Gt => compare_values(actual, &self.value) == Ordering::Greater,
            FilterOp::Gte => compare_values(actual, &self.value) != Ordering::Less,
            FilterOp::Lt => compare_values(actual, &self.value) == Ordering::Less,
            FilterOp::Lte => compare_values(actual, &self.value) != Ordering::Greater,
            FilterOp::Like | FilterOp::Ilike => match (actual.as_str(), self.value.as_str()) {
                (Some(text), Some(pattern)) => {
                    like_matches(pattern, text, self.op == FilterOp::Ilike)
                }
                _ => false,
            },
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|items| items.iter().any(|v| values_equal(actual, v))),
            FilterOp::NotIn => self
                .value
                .as_array()
                .is_some_and(|items| !items.iter().any(|v| values_equal(actual, v))),
        }
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySort {
    pub field: String,
    pub ascending: bool,
}

impl QuerySort {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }
}

/// Pagination window: `skip` rows are dropped, then at most `limit` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Page {
    pub skip: u64,
    pub limit: u64,
}

impl Default for Page {
    fn default() -> Self {
        Self { skip: 0, limit: 100 }
    }
}

impl Page {
    pub fn new(skip: u64, limit: u64) -> DomainResult<Self> {
        if limit == 0 {
            return Err(DomainError::validation("page limit must be greater than zero"));
        }
        Ok(Self { skip, limit })
    }

    pub fn first(limit: u64) -> DomainResult<Self> {
        Self::new(0, limit)
    }
}

/// Validated filters + sorts for entity `E`.
#[derive(Serialize)]
#[serde(bound = "")]
pub struct QuerySpec<E> {
    filters: Vec<QueryFilter>,
    sorts: Vec<QuerySort>,
    #[serde(skip)]
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for QuerySpec<E> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
            sorts: self.sorts.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> fmt::Debug for QuerySpec<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySpec")
            .field("filters", &self.filters)
            .field("sorts", &self.sorts)
            .finish()
    }
}

impl<E> PartialEq for QuerySpec<E> {
    fn eq(&self, other: &Self) -> bool {
        self.filters == other.filters && self.sorts == other.sorts
    }
}

impl<E: Entity> Default for QuerySpec<E> {
    fn default() -> Self {
        Self::all()
    }
}

impl<E: Entity> QuerySpec<E> {
    /// A query with no filters and no explicit order.
    pub fn all() -> Self {
        Self {
            filters: Vec::new(),
            sorts: Vec::new(),
            _entity: PhantomData,
        }
    }

    pub fn builder() -> QuerySpecBuilder<E> {
        QuerySpecBuilder {
            filters: Vec::new(),
            sorts: Vec::new(),
            rejected: None,
            _entity: PhantomData,
        }
    }

    /// Build from already-constructed parts, validating them against `E`.
    pub fn from_parts(filters: Vec<QueryFilter>, sorts: Vec<QuerySort>) -> DomainResult<Self> {
        QuerySpecBuilder::<E> {
            filters,
            sorts,
            rejected: None,
            _entity: PhantomData,
        }
        .build()
    }

    pub fn filters(&self) -> &[QueryFilter] {
        &self.filters
    }

    pub fn sorts(&self) -> &[QuerySort] {
        &self.sorts
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// The same query with filters in a canonical order.
    ///
    /// Filters are a conjunction, so their order never changes the result;
    /// sorts keep their order. Used to derive cache keys.
    pub fn canonical(&self) -> Self {
        let mut keyed: Vec<(String, &QueryFilter)> = self
            .filters
            .iter()
            .map(|f| (f.value.to_string(), f))
            .collect();
        keyed.sort_by(|(a_value, a), (b_value, b)| {
            a.field
                .cmp(&b.field)
                .then_with(|| a.op.as_str().cmp(b.op.as_str()))
                .then_with(|| a_value.cmp(b_value))
        });
        Self {
            filters: keyed.into_iter().map(|(_, f)| f.clone()).collect(),
            sorts: self.sorts.clone(),
            _entity: PhantomData,
        }
    }
}

/// Accumulates predicates and sort keys; validation happens in [`build`](Self::build).
pub struct QuerySpecBuilder<E> {
    filters: Vec<QueryFilter>,
    sorts: Vec<QuerySort>,
    rejected: Option<DomainError>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> QuerySpecBuilder<E> {
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Serialize) -> Self {
        match QueryFilter::try_new(field, op, value) {
            Ok(filter) => self.filters.push(filter),
            Err(err) => {
                self.rejected.get_or_insert(err);
            }
        }
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Serialize) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn sort(mut self, sort: QuerySort) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn order_by(self, field: impl Into<String>, ascending: bool) -> Self {
        self.sort(QuerySort {
            field: field.into(),
            ascending,
        })
    }

    pub fn build(self) -> DomainResult<QuerySpec<E>> {
        if let Some(err) = self.rejected {
            return Err(err);
        }
        for filter in &self.filters {
            if !E::has_field(&filter.field) {
                return Err(DomainError::invalid_query(
                    &filter.field,
                    format!("unknown field for {}", E::TABLE),
                ));
            }
            filter.validate()?;
        }
        for sort in &self.sorts {
            if !E::has_field(&sort.field) {
                return Err(DomainError::invalid_query(
                    &sort.field,
                    format!("cannot sort {} by unknown field", E::TABLE),
                ));
            }
        }

        Ok(QuerySpec {
            filters: self.filters,
            sorts: self.sorts,
            _entity: PhantomData,
        })
    }
}

/// Compare two rows by a list of sort keys, left to right.
pub fn compare_rows(a: &Row, b: &Row, sorts: &[QuerySort]) -> Ordering {
    for sort in sorts {
        let av = a.get(&sort.field).unwrap_or(&Value::Null);
        let bv = b.get(&sort.field).unwrap_or(&Value::Null);
        let ord = compare_values(av, bv);
        let ord = if sort.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Filter (AND), stable-sort, then paginate rows in memory.
pub fn evaluate(
    rows: impl IntoIterator<Item = Row>,
    filters: &[QueryFilter],
    sorts: &[QuerySort],
    page: Option<Page>,
) -> Vec<Row> {
    let mut selected: Vec<Row> = rows
        .into_iter()
        .filter(|row| filters.iter().all(|f| f.matches(row)))
        .collect();

    if !sorts.is_empty() {
        selected.sort_by(|a, b| compare_rows(a, b, sorts));
    }

    match page {
        Some(page) => selected
            .into_iter()
            .skip(usize::try_from(page.skip).unwrap_or(usize::MAX))
            .take(usize::try_from(page.limit).unwrap_or(usize::MAX))
            .collect(),
        None => selected,
    }
}
