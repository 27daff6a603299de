use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertInstructor {
        id: Ulid,
        name: Option<String>,
    },
    DeleteInstructor {
        id: Ulid,
    },
    InsertScheduleEntry {
        id: Ulid,
        instructor_id: Ulid,
        day: Weekday,
        start: NaiveTime,
        end: NaiveTime,
        active: bool,
    },
    DeleteScheduleEntry {
        id: Ulid,
    },
    InsertTimeOff {
        id: Ulid,
        instructor_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        start_time: Option<NaiveTime>,
        end_time: Option<NaiveTime>,
        reason: Option<String>,
    },
    DeleteTimeOff {
        id: Ulid,
    },
    InsertCustomAvailability {
        id: Ulid,
        instructor_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        active: bool,
    },
    DeleteCustomAvailability {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        instructor_id: Ulid,
        student_id: Ulid,
        start: NaiveDateTime,
        duration_minutes: Option<u32>,
    },
    /// `DELETE FROM bookings` cancels; bookings are never physically removed.
    CancelBooking {
        id: Ulid,
    },
    SelectInstructors,
    SelectSchedule {
        instructor_id: Ulid,
    },
    SelectTimeOff {
        instructor_id: Ulid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    SelectCustomAvailability {
        instructor_id: Ulid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    SelectBookings {
        instructor_id: Ulid,
    },
    SelectAvailableSlots {
        instructor_id: Ulid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        duration_minutes: Option<u32>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arity = |min: usize| {
        if values.len() < min {
            Err(SqlError::WrongArity(table_label(&table), min, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "instructors" => {
            arity(1)?;
            let name = values.get(1).map(parse_string_or_null).transpose()?.flatten();
            Ok(Command::InsertInstructor {
                id: parse_ulid(&values[0])?,
                name,
            })
        }
        "schedule" => {
            arity(5)?;
            Ok(Command::InsertScheduleEntry {
                id: parse_ulid(&values[0])?,
                instructor_id: parse_ulid(&values[1])?,
                day: parse_weekday(&values[2])?,
                start: parse_time(&values[3])?,
                end: parse_time(&values[4])?,
                active: values.get(5).map(parse_bool).transpose()?.unwrap_or(true),
            })
        }
        "time_off" => {
            arity(4)?;
            let start_time = values.get(4).map(parse_time_or_null).transpose()?.flatten();
            let end_time = values.get(5).map(parse_time_or_null).transpose()?.flatten();
            let reason = values.get(6).map(parse_string_or_null).transpose()?.flatten();
            Ok(Command::InsertTimeOff {
                id: parse_ulid(&values[0])?,
                instructor_id: parse_ulid(&values[1])?,
                start_date: parse_date(&values[2])?,
                end_date: parse_date(&values[3])?,
                start_time,
                end_time,
                reason,
            })
        }
        "custom_availability" => {
            arity(5)?;
            Ok(Command::InsertCustomAvailability {
                id: parse_ulid(&values[0])?,
                instructor_id: parse_ulid(&values[1])?,
                date: parse_date(&values[2])?,
                start: parse_time(&values[3])?,
                end: parse_time(&values[4])?,
                active: values.get(5).map(parse_bool).transpose()?.unwrap_or(true),
            })
        }
        "bookings" => {
            arity(4)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                instructor_id: parse_ulid(&values[1])?,
                student_id: parse_ulid(&values[2])?,
                start: parse_datetime(&values[3])?,
                duration_minutes: values.get(4).map(parse_u32).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "instructors" => Ok(Command::DeleteInstructor { id }),
        "schedule" => Ok(Command::DeleteScheduleEntry { id }),
        "time_off" => Ok(Command::DeleteTimeOff { id }),
        "custom_availability" => Ok(Command::DeleteCustomAvailability { id }),
        "bookings" => Ok(Command::CancelBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// WHERE-clause filters understood by the SELECT surface.
#[derive(Default)]
struct Filters {
    instructor_id: Option<Ulid>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    duration_minutes: Option<u32>,
}

impl Filters {
    fn instructor(&self) -> Result<Ulid, SqlError> {
        self.instructor_id.ok_or(SqlError::MissingFilter("instructor_id"))
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "instructors" => Ok(Command::SelectInstructors),
        "schedule" => Ok(Command::SelectSchedule {
            instructor_id: filters.instructor()?,
        }),
        "time_off" => Ok(Command::SelectTimeOff {
            instructor_id: filters.instructor()?,
            from: filters.from,
            to: filters.to,
        }),
        "custom_availability" => Ok(Command::SelectCustomAvailability {
            instructor_id: filters.instructor()?,
            from: filters.from,
            to: filters.to,
        }),
        "bookings" => Ok(Command::SelectBookings {
            instructor_id: filters.instructor()?,
        }),
        "available_slots" => Ok(Command::SelectAvailableSlots {
            instructor_id: filters.instructor()?,
            from: filters.from,
            to: filters.to,
            duration_minutes: filters.duration_minutes,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect the supported WHERE predicates. Anything else is rejected rather
/// than ignored, so a filter can't silently widen to the rolling window.
fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    let Expr::BinaryOp { left, op, right } = expr else {
        return match expr {
            Expr::Nested(inner) => extract_filters(inner, filters),
            other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
        };
    };
    let col = expr_column_name(left);
    match (op, col.as_deref()) {
        (ast::BinaryOperator::And, _) => {
            extract_filters(left, filters)?;
            extract_filters(right, filters)?;
        }
        (ast::BinaryOperator::Eq, Some("instructor_id")) => {
            filters.instructor_id = Some(parse_ulid(right)?);
        }
        (ast::BinaryOperator::Eq, Some("duration_minutes")) => {
            filters.duration_minutes = Some(parse_u32(right)?);
        }
        (ast::BinaryOperator::Eq, Some("date")) => {
            let date = parse_date(right)?;
            filters.from = Some(date);
            filters.to = Some(date);
        }
        (ast::BinaryOperator::GtEq, Some("date")) => filters.from = Some(parse_date(right)?),
        (ast::BinaryOperator::LtEq, Some("date")) => filters.to = Some(parse_date(right)?),
        _ => return Err(SqlError::Unsupported(format!("WHERE {expr}"))),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn table_label(table: &str) -> &'static str {
    match table {
        "instructors" => "instructors",
        "schedule" => "schedule",
        "time_off" => "time_off",
        "custom_availability" => "custom_availability",
        "bookings" => "bookings",
        _ => "table",
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

/// Literal text of a string or number, `None` for NULL.
fn literal_or_null(expr: &Expr) -> Result<Option<&str>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.as_str())),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn literal(expr: &Expr) -> Result<&str, SqlError> {
    literal_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    Ok(literal_or_null(expr)?.map(str::to_string))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = literal(expr)?;
    s.parse().map_err(|_| SqlError::Parse(format!("bad minutes: {s}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// `'monday'`, `'Mon'`, or ISO day number 1 (Monday) to 7 (Sunday).
fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = literal(expr)?;
    if let Ok(n) = s.parse::<u8>() {
        return match n {
            1..=7 => Ok(Weekday::try_from(n - 1).map_err(|e| SqlError::Parse(e.to_string()))?),
            _ => Err(SqlError::Parse(format!("day of week out of range: {n}"))),
        };
    }
    s.parse().map_err(|_| SqlError::Parse(format!("bad day of week: {s}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal(expr)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_time_str(s: &str) -> Result<NaiveTime, SqlError> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    parse_time_str(literal(expr)?)
}

fn parse_time_or_null(expr: &Expr) -> Result<Option<NaiveTime>, SqlError> {
    literal_or_null(expr)?.map(parse_time_str).transpose()
}

/// `'2025-03-03 09:00'`, with optional seconds and `T` separator.
fn parse_datetime(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    let s = literal(expr)?;
    let (date, time) = s
        .split_once(['T', ' '])
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}")))?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad timestamp {s}: {e}")))?;
    Ok(date.and_time(parse_time_str(time)?))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
