use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotkeeperAuthSource;
use crate::engine::{
    BookingRequest, ConsultantProfile, Engine, EngineError, PullOutcome, SyncRetryPolicy,
    TransitionMeta, after_success,
};
use crate::model::*;
use crate::notify::BookingEvent;
use crate::observability;
use crate::sql::{self, BookingFilter, Command, SqlError};
use crate::tenant::TenantManager;

fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub struct SlotkeeperHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotkeeperQueryParser>,
}

impl SlotkeeperHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotkeeperQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(
        &self,
        engine: &Engine,
        query: &str,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::UpsertConsultant {
                id,
                timezone,
                buffer_minutes,
                min_advance_hours,
                max_advance_days,
                calendar_id,
                name,
            } => {
                let mut profile = ConsultantProfile::new(id, timezone);
                if let Some(v) = buffer_minutes {
                    profile.buffer_minutes = v;
                }
                if let Some(v) = min_advance_hours {
                    profile.min_advance_hours = v;
                }
                if let Some(v) = max_advance_days {
                    profile.max_advance_days = v;
                }
                profile.calendar_id = calendar_id;
                profile.display_name = name;
                engine.upsert_consultant(profile).await.map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::DeleteConsultant { id } => {
                engine.remove_consultant(id).await.map_err(engine_err)?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::SelectConsultants => {
                let schedules = engine.list_consultants().await;
                Ok(vec![query_rows(
                    fields(CONSULTANT_COLUMNS, format),
                    schedules.iter(),
                    encode_consultant,
                )])
            }
            Command::SetWorkingHours { days } => {
                let mut rows = 0;
                for (consultant_id, weekday, ranges) in days {
                    rows += ranges.len();
                    engine
                        .set_weekday_hours(consultant_id, weekday, ranges)
                        .await
                        .map_err(engine_err)?;
                }
                Ok(vec![execution("INSERT", rows)])
            }
            Command::ClearWorkingHours {
                consultant_id,
                weekday,
            } => {
                engine
                    .set_weekday_hours(consultant_id, weekday, Vec::new())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::InsertBlackout {
                id,
                consultant_id,
                start,
                end,
                kind,
                label,
            } => {
                let blackout = Blackout {
                    id,
                    span: Span { start, end },
                    kind,
                    label,
                };
                engine
                    .add_blackout(consultant_id, blackout)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::DeleteBlackout { id } => {
                engine.remove_blackout(id).await.map_err(engine_err)?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::SetOffline {
                consultant_id,
                start,
                end,
            } => {
                engine
                    .set_offline(consultant_id, Span { start, end })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::SetOnline { consultant_id } => {
                let removed = engine.set_online(consultant_id).await.map_err(engine_err)?;
                Ok(vec![execution("DELETE", removed)])
            }
            Command::SelectSlots {
                consultant_id,
                start,
                end,
                duration,
            } => {
                let slots: Vec<Slot> = engine
                    .generate_slots(consultant_id, start, end, duration)
                    .await
                    .map_err(engine_err)?
                    .take(crate::limits::MAX_SLOTS_PER_QUERY)
                    .collect();
                Ok(vec![query_rows(
                    fields(SLOT_COLUMNS, format),
                    slots.iter(),
                    encode_slot,
                )])
            }
            Command::InsertBooking {
                id,
                consultant_id,
                start,
                duration,
                client,
                origin,
                returning,
            } => {
                let booking = engine
                    .commit_booking(BookingRequest {
                        id,
                        consultant_id,
                        start,
                        duration_minutes: duration,
                        client,
                        origin,
                    })
                    .await
                    .map_err(engine_err)?;
                if returning {
                    Ok(vec![bookings_response(std::slice::from_ref(&booking), format)])
                } else {
                    Ok(vec![execution("INSERT", 1)])
                }
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Id(id) => {
                        vec![engine.get_booking(id).await.map_err(engine_err)?]
                    }
                    BookingFilter::Reference(reference) => vec![
                        engine
                            .get_booking_by_reference(&reference)
                            .await
                            .map_err(engine_err)?,
                    ],
                    BookingFilter::Consultant {
                        consultant_id,
                        start,
                        end,
                    } => {
                        let range = match (start, end) {
                            (None, None) => None,
                            (s, e) => Some(Span {
                                start: s.unwrap_or(Ms::MIN),
                                end: e.unwrap_or(Ms::MAX),
                            }),
                        };
                        engine
                            .list_bookings(consultant_id, range)
                            .await
                            .map_err(engine_err)?
                    }
                };
                Ok(vec![bookings_response(&bookings, format)])
            }
            Command::CancelBooking {
                id,
                version,
                actor,
                reason,
            } => {
                let mut meta = TransitionMeta::new(actor);
                if let Some(reason) = reason {
                    meta = meta.with_reason(reason);
                }
                engine
                    .cancel_booking(id, version, meta)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::Reschedule {
                booking_id,
                version,
                start,
                duration,
                actor,
                returning,
            } => {
                let (_old, replacement) = engine
                    .reschedule_booking(
                        booking_id,
                        version,
                        start,
                        duration,
                        TransitionMeta::new(actor),
                    )
                    .await
                    .map_err(engine_err)?;
                if returning {
                    Ok(vec![bookings_response(std::slice::from_ref(&replacement), format)])
                } else {
                    Ok(vec![execution("INSERT", 1)])
                }
            }
            Command::NoShow {
                booking_id,
                version,
            } => {
                engine
                    .mark_no_show(booking_id, version, TransitionMeta::new(Actor::Admin))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::CalendarChange(change) => {
                let outcome = engine
                    .pull_from_external(change)
                    .await
                    .map_err(engine_err)?;
                let rows = usize::from(!matches!(outcome, PullOutcome::Ignored));
                Ok(vec![execution("INSERT", rows)])
            }
            Command::RecordSync {
                booking_id,
                version,
                state,
                external_event_id,
                error,
            } => {
                let current = engine.get_booking(booking_id).await.map_err(engine_err)?;
                let now = now_ms();
                let sync = match state {
                    SyncState::Synced => after_success(&current.sync, external_event_id, now),
                    SyncState::SyncFailed => SyncRetryPolicy::from_config(&engine.config)
                        .after_failure(
                            &current.sync,
                            error.unwrap_or_else(|| "push failed".into()),
                            now,
                        ),
                    SyncState::Unsynced | SyncState::ExternalDeleted => SyncStatus {
                        state,
                        ..current.sync.clone()
                    },
                };
                engine
                    .record_sync(booking_id, version, &current.sync, sync)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::SelectSyncBacklog { as_of } => {
                let backlog = engine.sync_backlog(as_of).await;
                Ok(vec![bookings_response(&backlog, format)])
            }
            Command::SelectDueNotifications { as_of } => {
                let jobs = engine.due_notifications(as_of).await;
                Ok(vec![query_rows(
                    fields(NOTIFICATION_COLUMNS, format),
                    jobs.iter(),
                    encode_job,
                )])
            }
            Command::RunNotificationPass { as_of } => {
                let jobs = engine
                    .run_notification_pass(as_of)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![query_rows(
                    fields(NOTIFICATION_COLUMNS, format),
                    jobs.iter(),
                    encode_job,
                )])
            }
            Command::SelectReconciliation => {
                let flagged = engine.needs_reconciliation().await;
                Ok(vec![bookings_response(&flagged, format)])
            }
            Command::ResolveReconciliation { booking_id } => {
                engine
                    .resolve_reconciliation(booking_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::SelectBookingEvents { after } => {
                let events = engine.notify.events_since(after);
                Ok(vec![query_rows(
                    fields(EVENT_COLUMNS, format),
                    events.iter(),
                    encode_event,
                )])
            }
        }
    }
}

fn execution(tag: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(tag).with_rows(rows))
}

/// Encode `items` into a query response with `schema`.
fn query_rows<'a, T: 'a>(
    schema: Vec<FieldInfo>,
    items: impl Iterator<Item = &'a T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn bookings_response(bookings: &[Booking], format: &Format) -> Response {
    query_rows(fields(BOOKING_COLUMNS, format), bookings.iter(), encode_booking)
}

// ── Result schemas ───────────────────────────────────────────────

type Columns = &'static [(&'static str, Type)];

const SLOT_COLUMNS: Columns = &[
    ("consultant_id", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("duration", Type::INT8),
];

const BOOKING_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("reference", Type::VARCHAR),
    ("consultant_id", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("duration", Type::INT8),
    ("status", Type::VARCHAR),
    ("version", Type::INT8),
    ("client_name", Type::VARCHAR),
    ("client_email", Type::VARCHAR),
    ("client_timezone", Type::VARCHAR),
    ("supersedes", Type::VARCHAR),
    ("superseded_by", Type::VARCHAR),
    ("sync_state", Type::VARCHAR),
    ("external_event_id", Type::VARCHAR),
    ("needs_reconciliation", Type::BOOL),
    ("reconciliation_note", Type::VARCHAR),
];

const CONSULTANT_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("timezone", Type::VARCHAR),
    ("buffer_minutes", Type::INT8),
    ("min_advance_hours", Type::INT8),
    ("max_advance_days", Type::INT8),
    ("calendar_id", Type::VARCHAR),
    ("weekly_hours", Type::VARCHAR),
    ("blackouts", Type::INT8),
];

const NOTIFICATION_COLUMNS: Columns = &[
    ("booking_id", Type::VARCHAR),
    ("reference", Type::VARCHAR),
    ("consultant_id", Type::VARCHAR),
    ("kind", Type::VARCHAR),
    ("recipient", Type::VARCHAR),
    ("due_at", Type::INT8),
    ("payload", Type::VARCHAR),
];

const EVENT_COLUMNS: Columns = &[
    ("seq", Type::INT8),
    ("kind", Type::VARCHAR),
    ("booking_id", Type::VARCHAR),
    ("reference", Type::VARCHAR),
    ("consultant_id", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("version", Type::INT8),
    ("start", Type::INT8),
    ("end", Type::INT8),
];

/// Field descriptions for `columns`, each in the format the client asked for.
fn fields(columns: Columns, format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

fn encode_slot(encoder: &mut DataRowEncoder, slot: &Slot) -> PgWireResult<()> {
    encoder.encode_field(&slot.consultant_id.to_string())?;
    encoder.encode_field(&slot.start)?;
    encoder.encode_field(&slot.end)?;
    encoder.encode_field(&(slot.duration_minutes as i64))?;
    Ok(())
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.reference)?;
    encoder.encode_field(&b.consultant_id.to_string())?;
    encoder.encode_field(&b.start())?;
    encoder.encode_field(&b.end())?;
    encoder.encode_field(&(b.duration_minutes as i64))?;
    encoder.encode_field(&b.status.to_string())?;
    encoder.encode_field(&(b.version as i64))?;
    encoder.encode_field(&b.client.name)?;
    encoder.encode_field(&b.client.email)?;
    encoder.encode_field(&b.client.timezone)?;
    encoder.encode_field(&b.supersedes.map(|id| id.to_string()))?;
    encoder.encode_field(&b.superseded_by.map(|id| id.to_string()))?;
    encoder.encode_field(&b.sync.state.as_str().to_string())?;
    encoder.encode_field(&b.sync.external_event_id)?;
    encoder.encode_field(&b.sync.needs_reconciliation)?;
    encoder.encode_field(&b.sync.reconciliation_note)?;
    Ok(())
}

fn encode_consultant(encoder: &mut DataRowEncoder, s: &ConsultantSchedule) -> PgWireResult<()> {
    let hours: Vec<String> = s
        .weekly_hours
        .iter()
        .filter(|(_, ranges)| !ranges.is_empty())
        .map(|(day, ranges)| {
            let ranges: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
            format!("{day} {}", ranges.join(","))
        })
        .collect();
    encoder.encode_field(&s.consultant_id.to_string())?;
    encoder.encode_field(&s.display_name)?;
    encoder.encode_field(&s.timezone)?;
    encoder.encode_field(&(s.buffer_minutes as i64))?;
    encoder.encode_field(&(s.min_advance_hours as i64))?;
    encoder.encode_field(&(s.max_advance_days as i64))?;
    encoder.encode_field(&s.calendar_id)?;
    encoder.encode_field(&hours.join("; "))?;
    encoder.encode_field(&(s.blackouts.len() as i64))?;
    Ok(())
}

fn encode_job(encoder: &mut DataRowEncoder, job: &NotificationJob) -> PgWireResult<()> {
    encoder.encode_field(&job.booking_id.to_string())?;
    encoder.encode_field(&job.reference)?;
    encoder.encode_field(&job.consultant_id.to_string())?;
    encoder.encode_field(&job.kind.label())?;
    encoder.encode_field(&job.recipient)?;
    encoder.encode_field(&job.due_at)?;
    encoder.encode_field(&job.payload.to_string())?;
    Ok(())
}

fn encode_event(encoder: &mut DataRowEncoder, event: &BookingEvent) -> PgWireResult<()> {
    let b = &event.booking;
    encoder.encode_field(&(event.seq as i64))?;
    encoder.encode_field(&event.kind.as_str().to_string())?;
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.reference)?;
    encoder.encode_field(&b.consultant_id.to_string())?;
    encoder.encode_field(&b.status.to_string())?;
    encoder.encode_field(&(b.version as i64))?;
    encoder.encode_field(&b.start())?;
    encoder.encode_field(&b.end())?;
    Ok(())
}

/// Result columns a statement will produce, judged from its text so that
/// statements with unbound `$N` placeholders can be described.
fn result_columns(sql: &str) -> Columns {
    let lower = sql.to_lowercase();
    if lower.contains("returning") {
        return BOOKING_COLUMNS;
    }
    if !lower.trim_start().starts_with("select") {
        return &[];
    }
    let table = lower
        .split_whitespace()
        .skip_while(|w| *w != "from")
        .nth(1)
        .unwrap_or_default()
        .trim_end_matches(';');
    match table {
        "slots" => SLOT_COLUMNS,
        "bookings" | "reconciliation" | "sync_backlog" => BOOKING_COLUMNS,
        "consultants" => CONSULTANT_COLUMNS,
        "due_notifications" | "notification_pass" => NOTIFICATION_COLUMNS,
        "booking_events" => EVENT_COLUMNS,
        _ => &[],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotkeeperHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query, &Format::UnifiedText).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotkeeperQueryParser;

#[async_trait]
impl QueryParser for SlotkeeperQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let format = column_format.unwrap_or(&Format::UnifiedText);
        Ok(fields(result_columns(stmt), format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotkeeperHandler {
    type Statement = String;
    type QueryParser = SlotkeeperQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let mut responses = self
            .run(&engine, &sql, &portal.result_column_format)
            .await?;
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
            fields(result_columns(&target.statement), &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(fields(
            result_columns(&target.statement.statement),
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
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

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine error class.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict { .. } | EngineError::VersionConflict { .. } => "40001",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Wal(_) => "58030",
        EngineError::Sync(_) => "08000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if matches!(e, EngineError::Wal(_)) {
        tracing::error!("{e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotkeeperFactory {
    handler: Arc<SlotkeeperHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotkeeperAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotkeeperFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotkeeperAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotkeeperHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotkeeperFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotkeeperFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgwire::api::results::FieldFormat;

    #[test]
    fn sqlstates_follow_error_class() {
        let id = ulid::Ulid::new();
        assert_eq!(sqlstate(&EngineError::validation("x")), "22023");
        assert_eq!(
            sqlstate(&EngineError::VersionConflict {
                id,
                expected: 1,
                actual: 2
            }),
            "40001"
        );
        assert_eq!(
            sqlstate(&EngineError::InvalidTransition {
                id,
                from: BookingStatus::Completed,
                to: BookingStatus::Cancelled
            }),
            "55000"
        );
        assert_eq!(sqlstate(&EngineError::not_found("booking", id)), "02000");
        assert_eq!(sqlstate(&EngineError::Sync("down".into())), "08000");
    }

    #[test]
    fn result_columns_by_table() {
        let cols =
            |sql: &str| -> Vec<&str> { result_columns(sql).iter().map(|(n, _)| *n).collect() };
        assert_eq!(
            cols("SELECT * FROM slots WHERE consultant_id = $1"),
            vec!["consultant_id", "start", "end", "duration"]
        );
        assert_eq!(cols("select * from reconciliation;")[0], "id");
        assert_eq!(cols("SELECT * FROM booking_events WHERE seq > $1")[0], "seq");
        assert_eq!(
            cols("INSERT INTO bookings (consultant_id) VALUES ($1) RETURNING *").len(),
            BOOKING_COLUMNS.len()
        );
        assert!(cols("DELETE FROM bookings WHERE id = $1 AND version = $2").is_empty());
    }

    #[test]
    fn binary_format_is_honoured_per_column() {
        let binary = fields(SLOT_COLUMNS, &Format::UnifiedBinary);
        assert!(binary.iter().all(|f| matches!(f.format(), FieldFormat::Binary)));
        let text = fields(SLOT_COLUMNS, &Format::UnifiedText);
        assert!(text.iter().all(|f| matches!(f.format(), FieldFormat::Text)));
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(count_params("VALUES ($1, $2, $10)"), 10);
    }
}
