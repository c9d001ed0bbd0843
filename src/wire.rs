use std::collections::HashMap;
use std::fmt::Debug;
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
use tracing::error;

use crate::auth::LessondAuthSource;
use crate::engine::{BookingError, Engine, EngineError, FailureKind};
use crate::locks::{Acquire, LockEntry, LockKey};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::{Locale, TenantContext, TenantManager, Timezone};

/// Timezone and locale for sessions that do not send their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionDefaults {
    pub timezone: Timezone,
    pub locale: Locale,
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
    defaults: SessionDefaults,
) -> std::io::Result<()> {
    let factory = LessondFactory::new(tenant_manager, password, defaults);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct LessondHandler {
    tenant_manager: Arc<TenantManager>,
    defaults: SessionDefaults,
    query_parser: Arc<LessondQueryParser>,
}

/// A startup setting, either sent directly or as `-c name=value` in `options`.
fn startup_setting(metadata: &HashMap<String, String>, name: &str) -> Option<String> {
    if let Some((_, v)) = metadata.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        return Some(v.clone());
    }
    let options = metadata.get("options")?;
    let mut words = options.split_whitespace();
    while let Some(word) = words.next() {
        let setting = match word {
            "-c" => words.next()?,
            w => match w.strip_prefix("--").or_else(|| w.strip_prefix("-c")) {
                Some(rest) => rest,
                None => continue,
            },
        };
        if let Some((k, v)) = setting.split_once('=')
            && k.eq_ignore_ascii_case(name)
        {
            return Some(v.to_string());
        }
    }
    None
}

/// Tenant context for a session: tenant from the database name, timezone and
/// locale from startup settings, else the daemon defaults.
pub fn session_context(metadata: &HashMap<String, String>, defaults: SessionDefaults) -> TenantContext {
    let db = metadata
        .get("database")
        .cloned()
        .unwrap_or_else(|| "default".to_string());
    let timezone = startup_setting(metadata, "TimeZone")
        .and_then(|tz| tz.parse().ok())
        .unwrap_or(defaults.timezone);
    let locale = startup_setting(metadata, "lc_messages")
        .and_then(|tag| Locale::from_tag(&tag))
        .unwrap_or(defaults.locale);
    TenantContext::new(db).with_timezone(timezone).with_locale(locale)
}

impl LessondHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, defaults: SessionDefaults) -> Self {
        Self {
            tenant_manager,
            defaults,
            query_parser: Arc::new(LessondQueryParser),
        }
    }

    fn resolve<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Engine>, Locale)> {
        let ctx = session_context(client.metadata(), self.defaults);
        let engine = self
            .tenant_manager
            .get_or_create(&ctx)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))?;
        Ok((engine, ctx.locale))
    }

    /// Parse, execute and record one statement.
    async fn run(&self, engine: &Engine, locale: Locale, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, locale, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, locale: Locale, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::SelectSlots {
                instructor_id,
                date,
                vehicle_type,
            } => {
                let slots = engine
                    .compute_slots(instructor_id, date, vehicle_type)
                    .await
                    .map_err(engine_err)?;
                let tz = engine.tenant().timezone;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let local = tz
                            .to_local(slot.span.start)
                            .map(|dt| dt.format("%Y-%m-%dT%H:%M%:z").to_string());
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.instructor_id.to_string())?;
                        encoder.encode_field(&slot.span.start)?;
                        encoder.encode_field(&slot.span.end)?;
                        encoder.encode_field(&slot.vehicle_type.as_str())?;
                        encoder.encode_field(&local)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertLock {
                instructor_id,
                start,
                end,
            } => {
                let key = LockKey::new(engine.tenant().id.clone(), instructor_id, Span::new(start, end));
                let outcome = engine
                    .locks()
                    .acquire(&key)
                    .await
                    .map_err(|e| booking_err(BookingError::from(e), locale))?;
                match outcome {
                    Acquire::Granted(entry) => Ok(vec![lock_response(entry)?]),
                    Acquire::Denied => Err(booking_err(BookingError::SlotNoLongerAvailable, locale)),
                }
            }
            Command::DeleteLock {
                instructor_id,
                start,
                end,
                token,
            } => {
                let key = LockKey::new(engine.tenant().id.clone(), instructor_id, Span::new(start, end));
                let released = engine
                    .locks()
                    .release(&key, token)
                    .await
                    .map_err(|e| booking_err(BookingError::from(e), locale))?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(released as usize))])
            }
            Command::InsertBooking {
                student_id,
                instructor_id,
                start,
                end,
                vehicle_type,
                token,
            } => {
                let slot = Slot {
                    instructor_id,
                    span: Span::new(start, end),
                    vehicle_type,
                };
                let booking = engine
                    .confirm_booking(student_id, &slot, token)
                    .await
                    .map_err(|e| booking_err(e, locale))?;
                Ok(vec![bookings_response(vec![booking])])
            }
            Command::SelectBookings { student_id } => {
                let bookings = match student_id {
                    Some(id) => engine.bookings_for_student(id),
                    None => engine.list_bookings(),
                };
                Ok(vec![bookings_response(bookings)])
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id, None).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::TransitionBooking { id, status, note } => {
                engine
                    .transition_booking(id, status, note)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertRule {
                id,
                instructor_id,
                day_of_week,
                start_time,
                end_time,
                tenant_id,
            } => {
                engine
                    .add_rule(id, instructor_id, day_of_week, start_time, end_time, tenant_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteRule { id } => {
                engine.remove_rule(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectRules {
                instructor_id,
                day_of_week,
            } => {
                let days: Vec<u8> = match day_of_week {
                    Some(d) => vec![d],
                    None => (0..7).collect(),
                };
                let schema = Arc::new(rules_schema());
                let rows: Vec<PgWireResult<_>> = days
                    .into_iter()
                    .flat_map(|d| engine.rules_for(instructor_id, d))
                    .map(|rule| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rule.id.to_string())?;
                        encoder.encode_field(&rule.instructor_id.to_string())?;
                        encoder.encode_field(&(rule.day_of_week as i16))?;
                        encoder.encode_field(&rule.start_time.format("%H:%M:%S").to_string())?;
                        encoder.encode_field(&rule.end_time.format("%H:%M:%S").to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertVehicle {
                id,
                vehicle_type,
                status,
                plate,
                model,
                tenant_id,
            } => {
                engine
                    .upsert_vehicle(id, vehicle_type, status, plate, model, tenant_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertStudent { id, credits, tenant_id } => {
                engine
                    .upsert_student(id, credits, tenant_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectStudent { id } => {
                let schema = Arc::new(student_schema());
                let mut rows: Vec<PgWireResult<_>> = Vec::new();
                if let Some(credits) = engine.student_credits(id).await {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&id.to_string())?;
                    encoder.encode_field(&(credits as i64))?;
                    rows.push(Ok(encoder.take_row()));
                }
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn column(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        column("instructor_id", Type::VARCHAR),
        column("start_at", Type::INT8),
        column("end_at", Type::INT8),
        column("vehicle_type", Type::VARCHAR),
        column("local_start", Type::VARCHAR),
    ]
}

fn lock_schema() -> Vec<FieldInfo> {
    vec![column("token", Type::VARCHAR), column("expires_at", Type::INT8)]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::VARCHAR),
        column("student_id", Type::VARCHAR),
        column("instructor_id", Type::VARCHAR),
        column("vehicle_id", Type::VARCHAR),
        column("start_at", Type::INT8),
        column("end_at", Type::INT8),
        column("status", Type::VARCHAR),
        column("credits_cost", Type::INT8),
        column("cancellation_reason", Type::VARCHAR),
        column("cancelled_at", Type::INT8),
        column("completed_at", Type::INT8),
        column("instructor_notes", Type::VARCHAR),
    ]
}

fn rules_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::VARCHAR),
        column("instructor_id", Type::VARCHAR),
        column("day_of_week", Type::INT2),
        column("start_time", Type::VARCHAR),
        column("end_time", Type::VARCHAR),
    ]
}

fn student_schema() -> Vec<FieldInfo> {
    vec![column("id", Type::VARCHAR), column("credits", Type::INT8)]
}

/// Result columns for a statement, judged from its verb and target table so
/// it works before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_ascii_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    let target = words
        .iter()
        .position(|w| *w == "from" || *w == "into")
        .and_then(|i| words.get(i + 1))
        .copied();
    match (words.first().copied(), target) {
        (Some("select"), Some("slots")) => slots_schema(),
        (Some("select"), Some("bookings")) | (Some("insert"), Some("bookings")) => bookings_schema(),
        (Some("select"), Some("availability")) => rules_schema(),
        (Some("select"), Some("students")) => student_schema(),
        (Some("insert"), Some("locks")) => lock_schema(),
        _ => vec![],
    }
}

fn lock_response(entry: LockEntry) -> PgWireResult<Response> {
    let schema = Arc::new(lock_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&entry.token.to_string())?;
    encoder.encode_field(&entry.expires_at)?;
    let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn bookings_response(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.student_id.to_string())?;
            encoder.encode_field(&b.instructor_id.to_string())?;
            encoder.encode_field(&b.vehicle_id.map(|v| v.to_string()))?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&(b.credits_cost as i64))?;
            encoder.encode_field(&b.cancellation_reason)?;
            encoder.encode_field(&b.cancelled_at)?;
            encoder.encode_field(&b.completed_at)?;
            encoder.encode_field(&b.instructor_notes)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for LessondHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, locale) = self.resolve(client)?;
        self.run(&engine, locale, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LessondQueryParser;

#[async_trait]
impl QueryParser for LessondQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LessondHandler {
    type Statement = String;
    type QueryParser = LessondQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, locale) = self.resolve(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&engine, locale, &sql).await?;
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LessondFactory {
    handler: Arc<LessondHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<LessondAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LessondFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String, defaults: SessionDefaults) -> Self {
        Self {
            handler: Arc::new(LessondHandler::new(tenant_manager, defaults)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                LessondAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LessondFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE and student-facing text. Internal detail is logged, never sent.
fn booking_failure(e: &BookingError, locale: Locale) -> (&'static str, &'static str) {
    if e.kind() == FailureKind::PersistenceFailure {
        error!("booking failed: {e}");
    }
    (e.sqlstate(), e.user_message(locale))
}

fn booking_err(e: BookingError, locale: Locale) -> PgWireError {
    let (code, message) = booking_failure(&e, locale);
    user_error(code, message.to_string())
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::NotFound(_) => "P0002",
        EngineError::TenantMismatch { .. } => "42501",
        EngineError::WalError(_) => "XX000",
        _ => "P0001",
    };
    user_error(code, e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    let code = match e {
        sql::SqlError::InvalidSpan { .. } => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
