use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::api::Command;

/// Row layout a statement produces, used to describe results before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Slots,
    Requests,
    Views,
    Stats,
}

/// Column order used when an INSERT names no columns.
const SLOT_COLUMNS: &[&str] = &["counselor_id", "date", "start_time", "end_time"];
const REQUEST_COLUMNS: &[&str] = &["requester_id", "counselor_id", "slot_id", "agenda"];
const ACCEPTANCE_COLUMNS: &[&str] = &["request_id", "meeting_reference"];
const REJECTION_COLUMNS: &[&str] = &["request_id", "reason"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmt = parse_one(sql)?;
    match &stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The row layout `sql` would return, without binding parameters.
/// `None` for statements that only report a tag.
pub fn result_shape(sql: &str) -> Option<Shape> {
    let stmt = parse_one(sql).ok()?;
    let table = match &stmt {
        Statement::Insert(insert) => insert_table_name(insert).ok()?,
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok()?,
            _ => return None,
        },
        _ => return None,
    };
    shape_of(&table)
}

fn shape_of(table: &str) -> Option<Shape> {
    match table {
        "open_slots" | "slots" => Some(Shape::Slots),
        "requests" | "acceptances" | "rejections" => Some(Shape::Requests),
        "counselor_requests" | "requester_requests" => Some(Shape::Views),
        "request_stats" => Some(Shape::Stats),
        _ => None,
    }
}

fn parse_one(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (name, defaults) = match table.as_str() {
        "slots" => ("slots", SLOT_COLUMNS),
        "requests" => ("requests", REQUEST_COLUMNS),
        "acceptances" => ("acceptances", ACCEPTANCE_COLUMNS),
        "rejections" => ("rejections", REJECTION_COLUMNS),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = InsertRow::new(insert, name, defaults)?;

    match name {
        "slots" => Ok(Command::PublishSlot {
            counselor_id: parse_ulid(row.get("counselor_id")?)?,
            date: parse_date(row.get("date")?)?,
            start_time: parse_time(row.get("start_time")?)?,
            end_time: parse_time(row.get("end_time")?)?,
        }),
        "requests" => Ok(Command::CreateMeetingRequest {
            requester_id: parse_ulid(row.get("requester_id")?)?,
            counselor_id: parse_ulid(row.get("counselor_id")?)?,
            slot_id: parse_ulid(row.get("slot_id")?)?,
            agenda: parse_text(row.get("agenda")?)?,
        }),
        "acceptances" => Ok(Command::AcceptMeetingRequest {
            request_id: parse_ulid(row.get("request_id")?)?,
            meeting_reference: parse_text(row.get("meeting_reference")?)?,
        }),
        _ => Ok(Command::RejectMeetingRequest {
            request_id: parse_ulid(row.get("request_id")?)?,
            reason: parse_text(row.get("reason")?)?,
        }),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "slots" => Ok(Command::RemoveSlot {
            slot_id: parse_ulid(filters.eq("id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = collect_filters(select.selection.as_ref())?;

    match table.as_str() {
        "open_slots" => Ok(Command::ListOpenSlots {
            counselor_id: parse_ulid(filters.eq("counselor_id")?)?,
            from: parse_date(filters.gte("date")?)?,
        }),
        "counselor_requests" => Ok(Command::ListCounselorRequests {
            counselor_id: parse_ulid(filters.eq("counselor_id")?)?,
        }),
        "requester_requests" => Ok(Command::ListRequesterRequests {
            requester_id: parse_ulid(filters.eq("requester_id")?)?,
        }),
        "request_stats" => Ok(Command::GetStats {
            counselor_id: parse_ulid(filters.eq("counselor_id")?)?,
        }),
        "requests" => Ok(Command::GetRequest {
            request_id: parse_ulid(filters.eq("id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// The first VALUES row of an INSERT, addressable by column name.
struct InsertRow<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> InsertRow<'a> {
    fn new(
        insert: &'a ast::Insert,
        table: &'static str,
        defaults: &'static [&'static str],
    ) -> Result<Self, SqlError> {
        let row = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if row.len() != columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), row.len()));
        }
        Ok(Self {
            table,
            values: columns.into_iter().zip(row.iter()).collect(),
        })
    }

    fn get(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.values
            .get(column)
            .copied()
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

/// Column comparisons joined by AND in a WHERE clause.
#[derive(Default)]
struct Filters<'a> {
    eq: HashMap<String, &'a Expr>,
    gte: HashMap<String, &'a Expr>,
}

impl<'a> Filters<'a> {
    fn eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.eq.get(column).copied().ok_or(SqlError::MissingFilter(column))
    }

    fn gte(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.gte.get(column).copied().ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_filters(selection: Option<&Expr>) -> Result<Filters<'_>, SqlError> {
    let mut filters = Filters::default();
    if let Some(expr) = selection {
        walk_filters(expr, &mut filters)?;
    }
    Ok(filters)
}

fn walk_filters<'a>(expr: &'a Expr, filters: &mut Filters<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => walk_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                walk_filters(left, filters)?;
                walk_filters(right, filters)
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    filters.eq.insert(col, &**right);
                }
                Ok(())
            }
            ast::BinaryOperator::GtEq => {
                if let Some(col) = expr_column_name(left) {
                    filters.gte.insert(col, &**right);
                }
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE clause {other}"))),
    }
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// A quoted string literal. Dates and times also arrive this way.
fn string_literal(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = string_literal(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    string_literal(expr).map(str::to_string)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = string_literal(expr)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// Accepts `HH:MM` and `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = string_literal(expr)?;
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const S: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_list_open_slots() {
        let sql = format!(r#"SELECT * FROM open_slots WHERE counselor_id = '{C}' AND "date" >= '2025-12-28'"#);
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::ListOpenSlots {
                counselor_id: ulid(C),
                from: NaiveDate::from_ymd_opt(2025, 12, 28).unwrap(),
            }
        );
    }

    #[test]
    fn parse_list_open_slots_requires_from() {
        let sql = format!("SELECT * FROM open_slots WHERE counselor_id = '{C}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn parse_publish_slot_with_columns() {
        let sql = format!(
            r#"INSERT INTO slots (counselor_id, "date", start_time, end_time) VALUES ('{C}', '2025-12-28', '09:00', '09:30:00')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::PublishSlot {
                counselor_id,
                date,
                start_time,
                end_time,
            } => {
                assert_eq!(counselor_id, ulid(C));
                assert_eq!(date.to_string(), "2025-12-28");
                assert_eq!(start_time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
                assert_eq!(end_time, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
            }
            other => panic!("expected PublishSlot, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_columns_in_any_order() {
        let sql = format!(
            "INSERT INTO requests (agenda, slot_id, counselor_id, requester_id) VALUES ('discuss apps', '{S}', '{C}', '{S}')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CreateMeetingRequest {
                requester_id: ulid(S),
                counselor_id: ulid(C),
                slot_id: ulid(S),
                agenda: "discuss apps".into(),
            }
        );
    }

    #[test]
    fn parse_insert_without_columns_is_positional() {
        let sql = format!("INSERT INTO rejections VALUES ('{S}', 'conflict')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::RejectMeetingRequest {
                request_id: ulid(S),
                reason: "conflict".into(),
            }
        );
    }

    #[test]
    fn parse_acceptance() {
        let sql = format!("INSERT INTO acceptances (request_id, meeting_reference) VALUES ('{S}', 'https://call.example/x')");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::AcceptMeetingRequest { meeting_reference, .. } if meeting_reference == "https://call.example/x"
        ));
    }

    #[test]
    fn parse_escaped_quotes_in_text() {
        let sql = format!("INSERT INTO requests VALUES ('{S}', '{C}', '{S}', 'it''s about essays')");
        match parse_sql(&sql).unwrap() {
            Command::CreateMeetingRequest { agenda, .. } => assert_eq!(agenda, "it's about essays"),
            other => panic!("expected CreateMeetingRequest, got {other:?}"),
        }
    }

    #[test]
    fn parse_wrong_arity() {
        let sql = format!("INSERT INTO acceptances VALUES ('{S}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity(..))));
    }

    #[test]
    fn parse_missing_column() {
        let sql = format!("INSERT INTO acceptances (request_id, note) VALUES ('{S}', 'x')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn(_, "meeting_reference"))
        ));
    }

    #[test]
    fn parse_remove_slot() {
        let sql = format!("DELETE FROM slots WHERE id = '{S}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::RemoveSlot { slot_id: ulid(S) });
    }

    #[test]
    fn parse_delete_requests_is_unknown() {
        let sql = format!("DELETE FROM requests WHERE id = '{S}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_request_listings() {
        assert_eq!(
            parse_sql(&format!("SELECT * FROM counselor_requests WHERE counselor_id = '{C}'")).unwrap(),
            Command::ListCounselorRequests { counselor_id: ulid(C) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM requester_requests WHERE (requester_id = '{S}')")).unwrap(),
            Command::ListRequesterRequests { requester_id: ulid(S) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM request_stats WHERE counselor_id = '{C}'")).unwrap(),
            Command::GetStats { counselor_id: ulid(C) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM requests WHERE id = '{S}'")).unwrap(),
            Command::GetRequest { request_id: ulid(S) }
        );
    }

    #[test]
    fn parse_bad_values() {
        let bad_ulid = "SELECT * FROM requests WHERE id = 'nope'";
        assert!(matches!(parse_sql(bad_ulid), Err(SqlError::Parse(_))));
        let bad_date = format!(r#"SELECT * FROM open_slots WHERE counselor_id = '{C}' AND "date" >= '28/12/2025'"#);
        assert!(matches!(parse_sql(&bad_date), Err(SqlError::Parse(_))));
        let or = format!("SELECT * FROM requests WHERE id = '{S}' OR id = '{S}'");
        assert!(matches!(parse_sql(&or), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn shapes_resolve_with_placeholders() {
        assert_eq!(result_shape("SELECT * FROM counselor_requests WHERE counselor_id = $1"), Some(Shape::Views));
        assert_eq!(result_shape("INSERT INTO acceptances VALUES ($1, $2)"), Some(Shape::Requests));
        assert_eq!(result_shape("SELECT * FROM request_stats WHERE counselor_id = $1"), Some(Shape::Stats));
        assert_eq!(result_shape("DELETE FROM slots WHERE id = $1"), None);
        assert_eq!(result_shape("not sql"), None);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = "INSERT INTO foobar (id) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
