use serde_json::Value;
use sqlx::{query::Query, sqlite::SqliteArguments, Sqlite};

use shared::{
    domain::Collection,
    query::{Comparison, ListQuery, SortOrder, DEFAULT_LIMIT, DEFAULT_OFFSET, DEFAULT_ORDER_FIELD},
};

use crate::{Result, StorageError};

pub(crate) struct SelectPlan {
    pub sql: String,
    pub binds: Vec<BindValue>,
}

pub(crate) enum BindValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl BindValue {
    pub fn bind_to<'q>(
        self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            Self::Integer(value) => query.bind(value),
            Self::Real(value) => query.bind(value),
            Self::Text(value) => query.bind(value),
        }
    }
}

struct Condition<'a> {
    field: &'a str,
    comparison: Comparison,
    value: &'a Value,
}

struct Ordering<'a> {
    field: &'a str,
    order: SortOrder,
}

/// Checks that a list query uses at most one filter field with exactly one
/// operator and at most one sort field.
pub fn validate_query(query: &ListQuery) -> Result<()> {
    resolve(query).map(|_| ())
}

fn resolve(query: &ListQuery) -> Result<(Option<Condition<'_>>, Ordering<'_>)> {
    let condition = match &query.filter {
        None => None,
        Some(filter) if filter.is_empty() => None,
        Some(filter) if filter.len() > 1 => {
            return Err(StorageError::Validation(
                "only one where field is supported".into(),
            ))
        }
        Some(filter) => {
            let Some((field, filter)) = filter.iter().next() else {
                return Ok((None, default_ordering()));
            };
            let operators = filter.operators();
            let [(comparison, value)] = operators.as_slice() else {
                return Err(StorageError::Validation(format!(
                    "where.{field} must set exactly one of eq, ne, gt, gte, lt, lte"
                )));
            };
            check_field(field)?;
            Some(Condition {
                field,
                comparison: *comparison,
                value: *value,
            })
        }
    };

    let ordering = match &query.order_by {
        None => default_ordering(),
        Some(order_by) if order_by.is_empty() => default_ordering(),
        Some(order_by) if order_by.len() > 1 => {
            return Err(StorageError::Validation(
                "only one orderBy field is supported".into(),
            ))
        }
        Some(order_by) => match order_by.iter().next() {
            Some((field, order)) => {
                check_field(field)?;
                Ordering {
                    field,
                    order: *order,
                }
            }
            None => default_ordering(),
        },
    };

    Ok((condition, ordering))
}

pub(crate) fn select_plan(collection: Collection, query: &ListQuery) -> Result<SelectPlan> {
    let (condition, ordering) = resolve(query)?;
    let mut sql = format!("SELECT body FROM {}", collection.as_str());
    let mut binds = Vec::new();

    if let Some(condition) = condition {
        let column = json_path(condition.field);
        match (condition.comparison, condition.value) {
            (Comparison::Eq, Value::Null) => sql.push_str(&format!(" WHERE {column} IS NULL")),
            (Comparison::Ne, Value::Null) => sql.push_str(&format!(" WHERE {column} IS NOT NULL")),
            (comparison, value) => {
                sql.push_str(&format!(" WHERE {column} {} ?", comparison.sql_operator()));
                binds.push(bind_value(condition.field, value)?);
            }
        }
    }

    let direction = match ordering.order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    sql.push_str(&format!(
        " ORDER BY {} {direction}, rowid {direction} LIMIT ? OFFSET ?",
        json_path(ordering.field)
    ));
    binds.push(BindValue::Integer(i64::from(
        query.limit.unwrap_or(DEFAULT_LIMIT),
    )));
    binds.push(BindValue::Integer(i64::from(
        query.offset.unwrap_or(DEFAULT_OFFSET),
    )));

    Ok(SelectPlan { sql, binds })
}

fn default_ordering() -> Ordering<'static> {
    Ordering {
        field: DEFAULT_ORDER_FIELD,
        order: SortOrder::Asc,
    }
}

fn json_path(field: &str) -> String {
    format!("json_extract(body, '$.{field}')")
}

fn check_field(field: &str) -> Result<()> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::Validation(format!(
            "invalid field name '{field}'"
        )))
    }
}

fn bind_value(field: &str, value: &Value) -> Result<BindValue> {
    match value {
        Value::Bool(flag) => Ok(BindValue::Integer(i64::from(*flag))),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                Ok(BindValue::Integer(integer))
            } else if let Some(real) = number.as_f64() {
                Ok(BindValue::Real(real))
            } else {
                Err(StorageError::Validation(format!(
                    "where.{field} holds an unsupported number"
                )))
            }
        }
        Value::String(text) => Ok(BindValue::Text(text.clone())),
        Value::Null => Err(StorageError::Validation(format!(
            "where.{field} can only compare null with eq or ne"
        ))),
        Value::Array(_) | Value::Object(_) => Err(StorageError::Validation(format!(
            "where.{field} must compare against a scalar"
        ))),
    }
}
