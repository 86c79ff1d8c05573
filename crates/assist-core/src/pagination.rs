//! Cursor pagination for list endpoints.
//!
//! Cursors are object ids. Ids are time-ordered, so `after`/`before`
//! translate into plain id comparisons.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_LIMIT: u32 = 20;
pub const MAX_LIMIT: u32 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaginationError {
    #[error("limit must be between 1 and {MAX_LIMIT}, got {0}")]
    InvalidLimit(u32),
    #[error("only one of `after` and `before` may be given")]
    ConflictingCursors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    fn reversed(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

/// Query parameters accepted by list endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub order: Option<SortOrder>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
}

/// How the store should run a list query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    /// Order rows are fetched in.
    pub order: SortOrder,
    /// `(operator, id)` bound on the id column.
    pub cursor: Option<(&'static str, String)>,
    /// Rows requested: one more than the page size, to detect `has_more`.
    pub fetch: u32,
    /// Page size.
    pub limit: u32,
    /// Fetched rows must be reversed back into list order.
    pub reverse: bool,
}

impl ListParams {
    pub fn plan(&self) -> Result<QueryPlan, PaginationError> {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if limit == 0 || limit > MAX_LIMIT {
            return Err(PaginationError::InvalidLimit(limit));
        }
        let order = self.order.unwrap_or_default();

        match (&self.after, &self.before) {
            (Some(_), Some(_)) => Err(PaginationError::ConflictingCursors),
            (Some(after), None) => Ok(QueryPlan {
                order,
                cursor: Some((Self::past(order), after.clone())),
                fetch: limit + 1,
                limit,
                reverse: false,
            }),
            // The page just before a cursor is fetched walking backwards
            // from it, then flipped.
            (None, Some(before)) => Ok(QueryPlan {
                order: order.reversed(),
                cursor: Some((Self::past(order.reversed()), before.clone())),
                fetch: limit + 1,
                limit,
                reverse: true,
            }),
            (None, None) => Ok(QueryPlan {
                order,
                cursor: None,
                fetch: limit + 1,
                limit,
                reverse: false,
            }),
        }
    }

    /// Comparison selecting ids that come after the cursor in `order`.
    fn past(order: SortOrder) -> &'static str {
        match order {
            SortOrder::Asc => ">",
            SortOrder::Desc => "<",
        }
    }
}

/// A page of a list endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub object: &'static str,
    pub data: Vec<T>,
    pub first_id: Option<String>,
    pub last_id: Option<String>,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Build a page from rows fetched according to `plan`.
    pub fn from_rows(mut rows: Vec<T>, plan: &QueryPlan, id_of: impl Fn(&T) -> &str) -> Self {
        let has_more = rows.len() > plan.limit as usize;
        rows.truncate(plan.limit as usize);
        if plan.reverse {
            rows.reverse();
        }
        let first_id = rows.first().map(|row| id_of(row).to_string());
        let last_id = rows.last().map(|row| id_of(row).to_string());
        Self {
            object: "list",
            data: rows,
            first_id,
            last_id,
            has_more,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            object: self.object,
            data: self.data.into_iter().map(f).collect(),
            first_id: self.first_id,
            last_id: self.last_id,
            has_more: self.has_more,
        }
    }
}
