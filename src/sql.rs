use chrono::{DateTime, NaiveDateTime};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::DEFAULT_DURATION_MINUTES;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertPractitioner {
        id: Ulid,
        name: Option<String>,
    },
    /// Soft delete.
    DeletePractitioner {
        id: Ulid,
    },
    InsertSubject {
        id: Ulid,
        name: Option<String>,
    },
    InsertBooking {
        request: BookingRequest,
    },
    BatchInsertBookings {
        requests: Vec<BookingRequest>,
    },
    /// Cancel.
    DeleteBooking {
        id: Ulid,
    },
    InsertBookingStatus {
        booking_id: Ulid,
        status: BookingStatus,
    },
    InsertReschedule {
        booking_id: Ulid,
        start: Ms,
        duration_minutes: Option<i64>,
    },
    /// Replace a booking's notes. `NULL` or a missing column clears them.
    InsertBookingNotes {
        booking_id: Ulid,
        notes: Option<String>,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectPractitioners,
    SelectSubjects,
    SelectAvailability {
        practitioner_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectConflicts {
        practitioner_id: Ulid,
        start: Ms,
        duration_minutes: i64,
    },
    SelectAuditLog {
        limit: Option<usize>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column order used when an INSERT has no explicit column list.
fn default_columns(table: &str) -> Option<&'static [&'static str]> {
    match table {
        "practitioners" | "subjects" => Some(&["id", "name"]),
        "bookings" => Some(&[
            "id",
            "practitioner_id",
            "subject_id",
            "start",
            "duration_minutes",
            "notes",
        ]),
        "booking_status" => Some(&["booking_id", "status"]),
        "reschedules" => Some(&["booking_id", "start", "duration_minutes"]),
        "booking_notes" => Some(&["booking_id", "notes"]),
        _ => None,
    }
}

/// One VALUES row with its cells keyed by column name.
struct Row<'a> {
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn insert_rows<'a>(
    table: &str,
    insert: &'a ast::Insert,
) -> Result<Vec<Row<'a>>, SqlError> {
    let defaults = default_columns(table).ok_or_else(|| SqlError::UnknownTable(table.to_string()))?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(unknown.clone()));
    }

    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if values.rows.is_empty() {
        return Err(SqlError::Parse("empty VALUES".into()));
    }

    let explicit = !insert.columns.is_empty();
    values
        .rows
        .iter()
        .map(|row| {
            let arity_ok = if explicit {
                row.len() == columns.len()
            } else {
                row.len() <= columns.len()
            };
            if !arity_ok {
                return Err(SqlError::WrongArity(
                    "VALUES row",
                    columns.len(),
                    row.len(),
                ));
            }
            Ok(Row {
                cells: columns.iter().cloned().zip(row.iter()).collect(),
            })
        })
        .collect()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = insert_rows(&table, insert)?;

    match table.as_str() {
        "practitioners" | "subjects" => {
            let row = single_row(&table, &rows)?;
            let id = parse_ulid_expr(row.required("id")?)?;
            let name = row.get("name").map(parse_optional_string).transpose()?.flatten();
            if table == "practitioners" {
                Ok(Command::InsertPractitioner { id, name })
            } else {
                Ok(Command::InsertSubject { id, name })
            }
        }
        "bookings" => {
            let mut requests = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let request = booking_request(row).map_err(|e| match e {
                    SqlError::Parse(msg) if rows.len() > 1 => {
                        SqlError::Parse(format!("row {i}: {msg}"))
                    }
                    other => other,
                })?;
                requests.push(request);
            }
            if requests.len() == 1 {
                let request = requests.remove(0);
                Ok(Command::InsertBooking { request })
            } else {
                Ok(Command::BatchInsertBookings { requests })
            }
        }
        "booking_status" => {
            let row = single_row(&table, &rows)?;
            Ok(Command::InsertBookingStatus {
                booking_id: parse_ulid_expr(row.required("booking_id")?)?,
                status: parse_status_expr(row.required("status")?)?,
            })
        }
        "reschedules" => {
            let row = single_row(&table, &rows)?;
            Ok(Command::InsertReschedule {
                booking_id: parse_ulid_expr(row.required("booking_id")?)?,
                start: parse_timestamp_expr(row.required("start")?)?,
                duration_minutes: row
                    .get("duration_minutes")
                    .map(parse_i64_or_null)
                    .transpose()?
                    .flatten(),
            })
        }
        "booking_notes" => {
            let row = single_row(&table, &rows)?;
            Ok(Command::InsertBookingNotes {
                booking_id: parse_ulid_expr(row.required("booking_id")?)?,
                notes: row.get("notes").map(parse_optional_string).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn single_row<'r, 'a>(table: &str, rows: &'r [Row<'a>]) -> Result<&'r Row<'a>, SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}"
        ))),
    }
}

fn booking_request(row: &Row<'_>) -> Result<BookingRequest, SqlError> {
    Ok(BookingRequest {
        id: parse_ulid_expr(row.required("id")?)?,
        practitioner_id: parse_ulid_expr(row.required("practitioner_id")?)?,
        subject_id: parse_ulid_expr(row.required("subject_id")?)?,
        start: parse_timestamp_expr(row.required("start")?)?,
        duration_minutes: row
            .get("duration_minutes")
            .map(parse_i64_or_null)
            .transpose()?
            .flatten()
            .unwrap_or(DEFAULT_DURATION_MINUTES),
        notes: row.get("notes").map(parse_optional_string).transpose()?.flatten(),
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "practitioners" => Ok(Command::DeletePractitioner { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let (limit, offset) = limit_offset(query)?;

    match table.as_str() {
        "bookings" => {
            let mut filter = BookingFilter {
                limit,
                offset,
                ..Default::default()
            };
            for (col, op, value) in filters {
                match (col.as_str(), &op) {
                    ("id", BinaryOperator::Eq) => filter.id = Some(parse_ulid_expr(value)?),
                    ("practitioner_id", BinaryOperator::Eq) => {
                        filter.practitioner_id = Some(parse_ulid_expr(value)?)
                    }
                    ("subject_id", BinaryOperator::Eq) => {
                        filter.subject_id = Some(parse_ulid_expr(value)?)
                    }
                    ("status", BinaryOperator::Eq) => filter.status = Some(parse_status_expr(value)?),
                    ("start", BinaryOperator::GtEq) => filter.from = Some(parse_timestamp_expr(value)?),
                    ("end", BinaryOperator::LtEq) => filter.until = Some(parse_timestamp_expr(value)?),
                    _ => return Err(unsupported_filter(&col, &op)),
                }
            }
            Ok(Command::SelectBookings { filter })
        }
        "practitioners" | "subjects" => {
            if !filters.is_empty() {
                return Err(SqlError::Unsupported(format!("WHERE on {table}")));
            }
            if table == "practitioners" {
                Ok(Command::SelectPractitioners)
            } else {
                Ok(Command::SelectSubjects)
            }
        }
        "availability" => {
            let (mut practitioner_id, mut start, mut end, mut min_duration) = (None, None, None, None);
            for (col, op, value) in filters {
                match (col.as_str(), &op) {
                    ("practitioner_id", BinaryOperator::Eq) => {
                        practitioner_id = Some(parse_ulid_expr(value)?)
                    }
                    ("start", BinaryOperator::GtEq) => start = Some(parse_timestamp_expr(value)?),
                    ("end", BinaryOperator::LtEq) => end = Some(parse_timestamp_expr(value)?),
                    ("min_duration", BinaryOperator::Eq) => min_duration = Some(parse_i64_expr(value)?),
                    _ => return Err(unsupported_filter(&col, &op)),
                }
            }
            Ok(Command::SelectAvailability {
                practitioner_id: practitioner_id.ok_or(SqlError::MissingFilter("practitioner_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                min_duration,
            })
        }
        "conflicts" => {
            let (mut practitioner_id, mut start, mut duration_minutes) = (None, None, None);
            for (col, op, value) in filters {
                match (col.as_str(), &op) {
                    ("practitioner_id", BinaryOperator::Eq) => {
                        practitioner_id = Some(parse_ulid_expr(value)?)
                    }
                    ("start", BinaryOperator::Eq) => start = Some(parse_timestamp_expr(value)?),
                    ("duration_minutes", BinaryOperator::Eq) => {
                        duration_minutes = parse_i64_or_null(value)?
                    }
                    _ => return Err(unsupported_filter(&col, &op)),
                }
            }
            Ok(Command::SelectConflicts {
                practitioner_id: practitioner_id.ok_or(SqlError::MissingFilter("practitioner_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                duration_minutes: duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES),
            })
        }
        "audit_log" => {
            if !filters.is_empty() {
                return Err(SqlError::Unsupported("WHERE on audit_log".into()));
            }
            Ok(Command::SelectAuditLog { limit })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn unsupported_filter(col: &str, op: &BinaryOperator) -> SqlError {
    SqlError::Unsupported(format!("filter {col} {op}"))
}

/// Flatten a conjunction of `column <op> value` comparisons.
fn collect_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn limit_offset(query: &ast::Query) -> Result<(Option<usize>, usize), SqlError> {
    match &query.limit_clause {
        None => Ok((None, 0)),
        Some(ast::LimitClause::LimitOffset { limit, offset, .. }) => {
            let limit = limit.as_ref().map(parse_usize_expr).transpose()?;
            let offset = offset
                .as_ref()
                .map(|o| parse_usize_expr(&o.value))
                .transpose()?
                .unwrap_or(0);
            Ok((limit, offset))
        }
        Some(ast::LimitClause::OffsetCommaLimit { offset, limit }) => {
            Ok((Some(parse_usize_expr(limit)?), parse_usize_expr(offset)?))
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────

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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_i64_expr(expr).map(Some)
    }
}

fn parse_usize_expr(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64_expr(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid count")))
}

fn parse_optional_string(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_status_expr(expr: &Expr) -> Result<BookingStatus, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => s.parse().map_err(SqlError::Parse),
        _ => Err(SqlError::Parse(format!("expected status string, got {expr}"))),
    }
}

fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => parse_timestamp(s),
        _ => parse_i64_expr(expr),
    }
}

/// Naive formats, tried in order, all read as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M",
];

/// Parse a time literal: integer Unix milliseconds, RFC 3339, or one of
/// `NAIVE_FORMATS` in UTC.
pub fn parse_timestamp(s: &str) -> Result<Ms, SqlError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const S: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";
    /// 2025-01-01T10:00:00Z
    const TEN_AM: Ms = 1_735_725_600_000;

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_practitioner() {
        let cmd = parse_sql(&format!(
            "INSERT INTO practitioners (id, name) VALUES ('{P}', 'Dr. Carvalho')"
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::InsertPractitioner {
                id: ulid(P),
                name: Some("Dr. Carvalho".into())
            }
        );
    }

    #[test]
    fn parse_insert_subject_without_column_list() {
        let cmd = parse_sql(&format!("INSERT INTO subjects VALUES ('{S}')")).unwrap();
        assert_eq!(cmd, Command::InsertSubject { id: ulid(S), name: None });
    }

    #[test]
    fn parse_delete_practitioner() {
        let cmd = parse_sql(&format!("DELETE FROM practitioners WHERE id = '{P}'")).unwrap();
        assert_eq!(cmd, Command::DeletePractitioner { id: ulid(P) });
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            "INSERT INTO bookings (id, practitioner_id, subject_id, start, duration_minutes, notes) \
             VALUES ('{B}', '{P}', '{S}', {TEN_AM}, 45, 'first visit')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { request } => {
                assert_eq!(request.id, ulid(B));
                assert_eq!(request.practitioner_id, ulid(P));
                assert_eq!(request.subject_id, ulid(S));
                assert_eq!(request.start, TEN_AM);
                assert_eq!(request.duration_minutes, 45);
                assert_eq!(request.notes.as_deref(), Some("first visit"));
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn booking_duration_defaults_to_thirty() {
        for sql in [
            format!("INSERT INTO bookings (id, practitioner_id, subject_id, start) VALUES ('{B}', '{P}', '{S}', {TEN_AM})"),
            format!("INSERT INTO bookings VALUES ('{B}', '{P}', '{S}', {TEN_AM}, NULL)"),
        ] {
            match parse_sql(&sql).unwrap() {
                Command::InsertBooking { request } => {
                    assert_eq!(request.duration_minutes, DEFAULT_DURATION_MINUTES)
                }
                other => panic!("expected InsertBooking, got {other:?}"),
            }
        }
    }

    #[test]
    fn negative_duration_is_passed_through() {
        let sql = format!(
            "INSERT INTO bookings (id, practitioner_id, subject_id, start, duration_minutes) \
             VALUES ('{B}', '{P}', '{S}', {TEN_AM}, -15)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { request } => assert_eq!(request.duration_minutes, -15),
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn booking_start_accepts_text_timestamps() {
        let sql = format!(
            "INSERT INTO bookings (id, practitioner_id, subject_id, start) \
             VALUES ('{B}', '{P}', '{S}', '01/01/2025 10:00')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { request } => assert_eq!(request.start, TEN_AM),
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn multi_row_insert_is_batch() {
        let sql = format!(
            "INSERT INTO bookings (id, practitioner_id, subject_id, start, duration_minutes) VALUES \
             ('{B}', '{P}', '{S}', {TEN_AM}, 30), \
             ('{}', '{P}', '{S}', {}, 30)",
            Ulid::new(),
            TEN_AM + 1_800_000
        );
        match parse_sql(&sql).unwrap() {
            Command::BatchInsertBookings { requests } => {
                assert_eq!(requests.len(), 2);
                assert_eq!(requests[1].start, TEN_AM + 1_800_000);
            }
            other => panic!("expected BatchInsertBookings, got {other:?}"),
        }
    }

    #[test]
    fn batch_row_errors_name_the_row() {
        let sql = format!(
            "INSERT INTO bookings (id, practitioner_id, subject_id, start) VALUES \
             ('{B}', '{P}', '{S}', {TEN_AM}), ('nope', '{P}', '{S}', {TEN_AM})"
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(err.to_string().contains("row 1"), "{err}");
    }

    #[test]
    fn insert_arity_and_columns_checked() {
        assert!(matches!(
            parse_sql(&format!("INSERT INTO bookings (id, practitioner_id) VALUES ('{B}')")),
            Err(SqlError::WrongArity(..))
        ));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO bookings (id, room) VALUES ('{B}', 1)")),
            Err(SqlError::UnknownColumn(c)) if c == "room"
        ));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO bookings (id, practitioner_id) VALUES ('{B}', '{P}')")),
            Err(SqlError::MissingColumn("subject_id"))
        ));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO beds (id) VALUES ('{B}')")),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_delete_booking() {
        let cmd = parse_sql(&format!("DELETE FROM bookings WHERE id = '{B}'")).unwrap();
        assert_eq!(cmd, Command::DeleteBooking { id: ulid(B) });
        assert!(matches!(
            parse_sql("DELETE FROM bookings"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_status_transition() {
        let cmd = parse_sql(&format!(
            "INSERT INTO booking_status (booking_id, status) VALUES ('{B}', 'CONFIRMED')"
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::InsertBookingStatus {
                booking_id: ulid(B),
                status: BookingStatus::Confirmed
            }
        );
        assert!(matches!(
            parse_sql(&format!("INSERT INTO booking_status VALUES ('{B}', 'maybe')")),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn parse_reschedule() {
        let cmd = parse_sql(&format!(
            "INSERT INTO reschedules (booking_id, start) VALUES ('{B}', '2025-01-01T10:00:00Z')"
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::InsertReschedule {
                booking_id: ulid(B),
                start: TEN_AM,
                duration_minutes: None
            }
        );
    }

    #[test]
    fn parse_booking_notes() {
        assert_eq!(
            parse_sql(&format!(
                "INSERT INTO booking_notes (booking_id, notes) VALUES ('{B}', 'bring exams')"
            ))
            .unwrap(),
            Command::InsertBookingNotes {
                booking_id: ulid(B),
                notes: Some("bring exams".into())
            }
        );
        assert_eq!(
            parse_sql(&format!("INSERT INTO booking_notes VALUES ('{B}', NULL)")).unwrap(),
            Command::InsertBookingNotes {
                booking_id: ulid(B),
                notes: None
            }
        );
        assert!(matches!(
            parse_sql("INSERT INTO booking_notes (notes) VALUES ('x')"),
            Err(SqlError::MissingColumn("booking_id"))
        ));
    }

    #[test]
    fn parse_select_bookings_with_filters() {
        let sql = format!(
            "SELECT * FROM bookings WHERE practitioner_id = '{P}' AND status = 'scheduled' \
             AND start >= '2025-01-01 10:00' AND \"end\" <= {} LIMIT 10 OFFSET 5",
            TEN_AM + 3_600_000
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectBookings { filter } => {
                assert_eq!(filter.practitioner_id, Some(ulid(P)));
                assert_eq!(filter.status, Some(BookingStatus::Scheduled));
                assert_eq!(filter.from, Some(TEN_AM));
                assert_eq!(filter.until, Some(TEN_AM + 3_600_000));
                assert_eq!(filter.limit, Some(10));
                assert_eq!(filter.offset, 5);
                assert_eq!(filter.subject_id, None);
            }
            other => panic!("expected SelectBookings, got {other:?}"),
        }
    }

    #[test]
    fn select_bookings_without_filters() {
        assert_eq!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::default()
            }
        );
    }

    #[test]
    fn disjunctions_are_rejected() {
        let sql = format!("SELECT * FROM bookings WHERE subject_id = '{S}' OR practitioner_id = '{P}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        let sql = "SELECT * FROM bookings WHERE notes = 'x'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_directory() {
        assert_eq!(parse_sql("SELECT * FROM practitioners").unwrap(), Command::SelectPractitioners);
        assert_eq!(parse_sql("select * from subjects").unwrap(), Command::SelectSubjects);
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE practitioner_id = '{P}' AND start >= {TEN_AM} \
             AND \"end\" <= {} AND min_duration = 1800000",
            TEN_AM + 8 * 3_600_000
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                practitioner_id: ulid(P),
                start: TEN_AM,
                end: TEN_AM + 8 * 3_600_000,
                min_duration: Some(1_800_000),
            }
        );
        assert!(matches!(
            parse_sql(&format!("SELECT * FROM availability WHERE practitioner_id = '{P}'")),
            Err(SqlError::MissingFilter("start"))
        ));
    }

    #[test]
    fn parse_select_conflicts() {
        let sql = format!("SELECT * FROM conflicts WHERE practitioner_id = '{P}' AND start = {TEN_AM}");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectConflicts {
                practitioner_id: ulid(P),
                start: TEN_AM,
                duration_minutes: DEFAULT_DURATION_MINUTES,
            }
        );
    }

    #[test]
    fn parse_select_audit_log() {
        assert_eq!(
            parse_sql("SELECT * FROM audit_log LIMIT 3").unwrap(),
            Command::SelectAuditLog { limit: Some(3) }
        );
    }

    #[test]
    fn unsupported_statements() {
        assert!(matches!(parse_sql("DROP TABLE bookings"), Err(SqlError::Unsupported(_))));
        assert!(matches!(parse_sql("SELEC nothing"), Err(SqlError::Parse(_))));
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn timestamp_formats() {
        for s in [
            "1735725600000",
            "2025-01-01T10:00:00Z",
            "2025-01-01T07:00:00-03:00",
            "2025-01-01 10:00:00",
            "2025-01-01 10:00",
            "2025-01-01T10:00",
            "01/01/2025 10:00",
            "01-01-2025 10:00",
        ] {
            assert_eq!(parse_timestamp(s).unwrap(), TEN_AM, "{s}");
        }
        assert!(parse_timestamp("tomorrow at ten").is_err());
        assert!(parse_timestamp("2025-13-01 10:00").is_err());
    }
}
