use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::locks::LockToken;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectSlots {
        instructor_id: Ulid,
        date: NaiveDate,
        vehicle_type: VehicleType,
    },
    InsertLock {
        instructor_id: Ulid,
        start: Ms,
        end: Ms,
    },
    DeleteLock {
        instructor_id: Ulid,
        start: Ms,
        end: Ms,
        token: LockToken,
    },
    InsertBooking {
        student_id: Ulid,
        instructor_id: Ulid,
        start: Ms,
        end: Ms,
        vehicle_type: VehicleType,
        token: LockToken,
    },
    SelectBookings {
        student_id: Option<Ulid>,
    },
    /// Cancels; bookings are never physically deleted.
    DeleteBooking {
        id: Ulid,
    },
    TransitionBooking {
        id: Ulid,
        status: BookingStatus,
        note: Option<String>,
    },
    InsertRule {
        id: Ulid,
        instructor_id: Ulid,
        day_of_week: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
        tenant_id: Option<TenantId>,
    },
    DeleteRule {
        id: Ulid,
    },
    SelectRules {
        instructor_id: Ulid,
        day_of_week: Option<u8>,
    },
    InsertVehicle {
        id: Ulid,
        vehicle_type: VehicleType,
        status: VehicleStatus,
        plate: Option<String>,
        model: Option<String>,
        tenant_id: Option<TenantId>,
    },
    InsertStudent {
        id: Ulid,
        credits: u32,
        tenant_id: Option<TenantId>,
    },
    SelectStudent {
        id: Ulid,
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

/// One VALUES row addressed by column name. Without a column list the
/// table's documented column order applies.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(table: &'static str, insert: &ast::Insert, default_columns: &[&str], values: &'a [Expr]) -> Self {
        let columns = if insert.columns.is_empty() {
            default_columns.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        Self { table, columns, values }
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx).filter(|e| !is_null(e))
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "locks" => {
            let row = Row::new("locks", insert, &["instructor_id", "start_at", "end_at"], &values);
            let (start, end) = parse_span(row.required("start_at")?, row.required("end_at")?)?;
            Ok(Command::InsertLock {
                instructor_id: parse_ulid_expr(row.required("instructor_id")?)?,
                start,
                end,
            })
        }
        "bookings" => {
            let row = Row::new(
                "bookings",
                insert,
                &["student_id", "instructor_id", "start_at", "end_at", "vehicle_type", "token"],
                &values,
            );
            let (start, end) = parse_span(row.required("start_at")?, row.required("end_at")?)?;
            Ok(Command::InsertBooking {
                student_id: parse_ulid_expr(row.required("student_id")?)?,
                instructor_id: parse_ulid_expr(row.required("instructor_id")?)?,
                start,
                end,
                vehicle_type: parse_enum(row.required("vehicle_type")?)?,
                token: parse_token(row.required("token")?)?,
            })
        }
        "booking_transitions" => {
            let row = Row::new("booking_transitions", insert, &["booking_id", "status", "note"], &values);
            Ok(Command::TransitionBooking {
                id: parse_ulid_expr(row.required("booking_id")?)?,
                status: parse_enum(row.required("status")?)?,
                note: row.get("note").map(parse_string).transpose()?,
            })
        }
        "availability" => {
            let row = Row::new(
                "availability",
                insert,
                &["id", "instructor_id", "day_of_week", "start_time", "end_time", "tenant_id"],
                &values,
            );
            Ok(Command::InsertRule {
                id: parse_ulid_expr(row.required("id")?)?,
                instructor_id: parse_ulid_expr(row.required("instructor_id")?)?,
                day_of_week: parse_u8(row.required("day_of_week")?)?,
                start_time: parse_time(row.required("start_time")?)?,
                end_time: parse_time(row.required("end_time")?)?,
                tenant_id: parse_tenant(&row)?,
            })
        }
        "vehicles" => {
            let row = Row::new(
                "vehicles",
                insert,
                &["id", "type", "status", "plate", "model", "tenant_id"],
                &values,
            );
            Ok(Command::InsertVehicle {
                id: parse_ulid_expr(row.required("id")?)?,
                vehicle_type: parse_enum(row.required("type")?)?,
                status: match row.get("status") {
                    Some(e) => parse_enum(e)?,
                    None => VehicleStatus::Active,
                },
                plate: row.get("plate").map(parse_string).transpose()?,
                model: row.get("model").map(parse_string).transpose()?,
                tenant_id: parse_tenant(&row)?,
            })
        }
        "students" => {
            let row = Row::new("students", insert, &["id", "credits", "tenant_id"], &values);
            Ok(Command::InsertStudent {
                id: parse_ulid_expr(row.required("id")?)?,
                credits: parse_u32(row.required("credits")?)?,
                tenant_id: parse_tenant(&row)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "availability" => Ok(Command::DeleteRule {
            id: extract_where_id(&delete.selection)?,
        }),
        "bookings" => Ok(Command::DeleteBooking {
            id: extract_where_id(&delete.selection)?,
        }),
        "locks" => {
            let filters = collect_filters(delete.selection.as_ref());
            let (start, end) = parse_span(
                required_filter(&filters, "start_at")?,
                required_filter(&filters, "end_at")?,
            )?;
            Ok(Command::DeleteLock {
                instructor_id: parse_ulid_expr(required_filter(&filters, "instructor_id")?)?,
                start,
                end,
                token: parse_token(required_filter(&filters, "token")?)?,
            })
        }
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
    let filters = collect_filters(select.selection.as_ref());

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            instructor_id: parse_ulid_expr(required_filter(&filters, "instructor_id")?)?,
            date: parse_date(required_filter(&filters, "date")?)?,
            vehicle_type: parse_enum(required_filter(&filters, "vehicle_type")?)?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            student_id: find_filter(&filters, "student_id").map(parse_ulid_expr).transpose()?,
        }),
        "availability" => Ok(Command::SelectRules {
            instructor_id: parse_ulid_expr(required_filter(&filters, "instructor_id")?)?,
            day_of_week: find_filter(&filters, "day_of_week").map(parse_u8).transpose()?,
        }),
        "students" => Ok(Command::SelectStudent {
            id: parse_ulid_expr(required_filter(&filters, "id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` pairs joined by AND. Anything else in the WHERE is ignored.
fn collect_filters(selection: Option<&Expr>) -> Vec<(String, &Expr)> {
    fn walk<'e>(expr: &'e Expr, out: &mut Vec<(String, &'e Expr)>) {
        match expr {
            Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
                walk(left, out);
                walk(right, out);
            }
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, right.as_ref()));
                }
            }
            Expr::Nested(inner) => walk(inner, out),
            _ => {}
        }
    }
    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out);
    }
    out
}

fn find_filter<'e>(filters: &[(String, &'e Expr)], column: &str) -> Option<&'e Expr> {
    filters.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
}

fn required_filter<'e>(filters: &[(String, &'e Expr)], column: &'static str) -> Result<&'e Expr, SqlError> {
    find_filter(filters, column).ok_or(SqlError::MissingFilter(column))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let filters = collect_filters(selection.as_ref());
    parse_ulid_expr(required_filter(&filters, "id")?)
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_token(expr: &Expr) -> Result<LockToken, SqlError> {
    let s = parse_string(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("bad lock token: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(expr: &Expr) -> Result<T, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

/// `start_at`/`end_at` pair; an empty or inverted range is refused here so
/// no `Span` is ever built from it.
fn parse_span(start: &Expr, end: &Expr) -> Result<(Ms, Ms), SqlError> {
    let (start, end) = (parse_i64_expr(start)?, parse_i64_expr(end)?);
    if start >= end {
        return Err(SqlError::InvalidSpan { start, end });
    }
    Ok((start, end))
}

fn parse_tenant(row: &Row<'_>) -> Result<Option<TenantId>, SqlError> {
    row.get("tenant_id")
        .map(|e| parse_string(e).map(TenantId::new))
        .transpose()
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
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("end_at {end} must be after start_at {start}")]
    InvalidSpan { start: Ms, end: Ms },
}
