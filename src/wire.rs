use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{Credentials, DriveAliveAuthSource};
use crate::engine::{local_now, Engine, EngineError};
use crate::model::Span;
use crate::observability;
use crate::sql::{self, Command};

pub struct DriveAliveHandler {
    engine: Arc<Engine>,
    query_parser: Arc<DriveAliveQueryParser>,
}

impl DriveAliveHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(DriveAliveQueryParser),
        }
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run_sql(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertInstructor { id, name } => {
                engine.register_instructor(id, name).await.map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::DeleteInstructor { id } => {
                engine.remove_instructor(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag()])
            }
            Command::InsertScheduleEntry { id, instructor_id, day, start, end, active } => {
                engine
                    .add_schedule_entry(id, instructor_id, day, start, end, active)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::DeleteScheduleEntry { id } => {
                engine.remove_schedule_entry(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag()])
            }
            Command::InsertTimeOff {
                id,
                instructor_id,
                start_date,
                end_date,
                start_time,
                end_time,
                reason,
            } => {
                engine
                    .add_time_off(id, instructor_id, start_date, end_date, start_time, end_time, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::DeleteTimeOff { id } => {
                engine.remove_time_off(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag()])
            }
            Command::InsertCustomAvailability { id, instructor_id, date, start, end, active } => {
                engine
                    .add_custom_availability(id, instructor_id, date, start, end, active)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::DeleteCustomAvailability { id } => {
                engine.remove_custom_availability(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag()])
            }
            Command::InsertBooking { id, instructor_id, student_id, start, duration_minutes } => {
                let minutes = duration_minutes.unwrap_or(engine.policy.lesson_minutes);
                engine
                    .create_booking(id, instructor_id, student_id, start, minutes, local_now())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag()])
            }
            Command::SelectInstructors => {
                let schema = Arc::new(instructors_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_instructors()
                    .into_iter()
                    .map(|info| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&info.id.to_string())?;
                        encoder.encode_field(&info.name)?;
                        encoder.encode_field(&(info.schedule_entries as i64))?;
                        encoder.encode_field(&(info.active_bookings as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectSchedule { instructor_id } => {
                let entries = engine.list_schedule_entries(instructor_id).await.map_err(engine_err)?;
                let schema = Arc::new(schedule_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.instructor_id.to_string())?;
                        encoder.encode_field(&e.day.to_string())?;
                        encoder.encode_field(&e.start.to_string())?;
                        encoder.encode_field(&e.end.to_string())?;
                        encoder.encode_field(&e.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectTimeOff { instructor_id, from, to } => {
                let (from, to) = self.date_window(from, to);
                let entries = engine
                    .list_time_off(instructor_id, from, to)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(time_off_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .iter()
                    .map(|t| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&t.id.to_string())?;
                        encoder.encode_field(&t.instructor_id.to_string())?;
                        encoder.encode_field(&t.start_date.to_string())?;
                        encoder.encode_field(&t.end_date.to_string())?;
                        encoder.encode_field(&t.start_time.map(|s| s.to_string()))?;
                        encoder.encode_field(&t.end_time.map(|e| e.to_string()))?;
                        encoder.encode_field(&t.reason)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectCustomAvailability { instructor_id, from, to } => {
                let (from, to) = self.date_window(from, to);
                let entries = engine
                    .list_custom_availability(instructor_id, from, to)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(custom_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.id.to_string())?;
                        encoder.encode_field(&c.instructor_id.to_string())?;
                        encoder.encode_field(&c.date.to_string())?;
                        encoder.encode_field(&c.start.to_string())?;
                        encoder.encode_field(&c.end.to_string())?;
                        encoder.encode_field(&c.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBookings { instructor_id } => {
                let bookings = engine.get_bookings(instructor_id).await.map_err(engine_err)?;
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.instructor_id.to_string())?;
                        encoder.encode_field(&b.student_id.to_string())?;
                        encoder.encode_field(&format_timestamp(&b.span.start))?;
                        encoder.encode_field(&format_timestamp(&b.span.end))?;
                        encoder.encode_field(&b.status.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAvailableSlots { instructor_id, from, to, duration_minutes } => {
                let (from, to) = self.date_window(from, to);
                let by_date = engine
                    .available_slots(instructor_id, from, to, duration_minutes)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(slots_schema());
                let iid = instructor_id.to_string();
                // One row per slot. A date with nothing free still gets a row,
                // with NULL start and end, so every date in the window is listed.
                let rows: Vec<PgWireResult<_>> = by_date
                    .iter()
                    .flat_map(|(date, slots)| {
                        let free: Vec<Option<&Span>> = if slots.is_empty() {
                            vec![None]
                        } else {
                            slots.iter().map(Some).collect()
                        };
                        free.into_iter().map(move |slot| (date, slot))
                    })
                    .map(|(date, slot)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&iid)?;
                        encoder.encode_field(&date.to_string())?;
                        encoder.encode_field(&slot.map(|s| format_timestamp(&s.start)))?;
                        encoder.encode_field(&slot.map(|s| format_timestamp(&s.end)))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }

    /// Fill open ends of a date filter from the rolling booking window.
    fn date_window(
        &self,
        from: Option<chrono::NaiveDate>,
        to: Option<chrono::NaiveDate>,
    ) -> (chrono::NaiveDate, chrono::NaiveDate) {
        let today = local_now().date();
        let start = from.unwrap_or(today);
        let (_, default_end) = self.engine.policy.window_from(start);
        (start, to.unwrap_or(default_end))
    }
}

fn format_timestamp(ts: &chrono::NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn insert_tag() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn delete_tag() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn instructors_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        typed_field("schedule_entries", Type::INT8),
        typed_field("active_bookings", Type::INT8),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("instructor_id"),
        text_field("day_of_week"),
        text_field("start_time"),
        text_field("end_time"),
        typed_field("active", Type::BOOL),
    ]
}

fn time_off_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("instructor_id"),
        text_field("start_date"),
        text_field("end_date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("reason"),
    ]
}

fn custom_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("instructor_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        typed_field("active", Type::BOOL),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("instructor_id"),
        text_field("student_id"),
        text_field("start"),
        text_field("end"),
        text_field("status"),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("instructor_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
    ]
}

/// Result columns for a statement, judged from the table it reads.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_end_matches(';'))
        .unwrap_or_default();
    match table {
        "instructors" => instructors_schema(),
        "schedule" => schedule_schema(),
        "time_off" => time_off_schema(),
        "custom_availability" => custom_schema(),
        "bookings" => bookings_schema(),
        "available_slots" => slots_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for DriveAliveHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run_sql(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct DriveAliveQueryParser;

#[async_trait]
impl QueryParser for DriveAliveQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for DriveAliveHandler {
    type Statement = String;
    type QueryParser = DriveAliveQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run_sql(&sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // highest index first so $1 doesn't clobber the prefix of $10
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct DriveAliveFactory {
    handler: Arc<DriveAliveHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<DriveAliveAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl DriveAliveFactory {
    pub fn new(engine: Arc<Engine>, credentials: Credentials) -> Self {
        let auth_source = DriveAliveAuthSource::new(credentials);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(DriveAliveHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for DriveAliveFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    credentials: Credentials,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(DriveAliveFactory::new(engine, credentials));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// SQLSTATE for an engine error. Booking conflicts surface as
/// `exclusion_violation` so clients can tell them apart from bad input.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ConflictReason;
    use ulid::Ulid;

    #[test]
    fn conflicts_map_to_exclusion_violation() {
        let e = EngineError::Conflict(ConflictReason::DoubleBooked(Ulid::new()));
        assert_eq!(sqlstate(&e), "23P01");
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::new())), "P0002");
        assert_eq!(sqlstate(&EngineError::InvalidTimeRange), "P0001");
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM bookings WHERE instructor_id = $1"), 1);
        assert_eq!(count_params("INSERT INTO bookings VALUES ($1, $2, $3, $10)"), 10);
        assert_eq!(count_params("SELECT * FROM instructors"), 0);
    }

    #[test]
    fn result_schema_by_table() {
        let cols: Vec<_> = result_schema("SELECT * FROM available_slots WHERE instructor_id = $1")
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(cols, ["instructor_id", "date", "start", "end"]);
        assert_eq!(result_schema("select * from bookings;").len(), 6);
        assert!(result_schema("DELETE FROM bookings WHERE id = $1").is_empty());
    }
}
