use std::fmt::Debug;
use std::ops::Range;
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
use ulid::Ulid;

use crate::auth::MedSchedAuthSource;
use crate::engine::{Engine, EngineError};
use crate::limits::MAX_AUDIT_ENTRIES;
use crate::model::*;
use crate::observability::{self, command_label};
use crate::policy::{self, Action, Actor, Decision, Resource};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct MedSchedHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<MedSchedQueryParser>,
}

impl MedSchedHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(MedSchedQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("clinic error: {e}")))
    }

    /// Parse, authorize and run one statement, recording query metrics.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let actor = resolve_actor(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);

        let started = Instant::now();
        let result = match authorize_command(&engine, &actor, &cmd).await {
            Ok(()) => execute_command(&engine, &actor, cmd).await,
            Err(e) => {
                metrics::counter!(observability::ACCESS_DENIED_TOTAL, "command" => label)
                    .increment(1);
                Err(e)
            }
        };
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }
}

fn resolve_actor<C: ClientInfo>(client: &C) -> PgWireResult<Actor> {
    let user = client.metadata().get("user").cloned().unwrap_or_default();
    Actor::from_login(&user)
        .ok_or_else(|| user_error("42501", format!("role {user:?} is not allowed")))
}

// ── Authorization ────────────────────────────────────────────────

async fn booking_resource(engine: &Engine, id: Ulid) -> Resource {
    match engine.get_booking(id).await {
        Some(b) => Resource::Booking {
            practitioner_id: Some(b.practitioner_id),
            subject_id: Some(b.subject_id),
        },
        None => Resource::Booking {
            practitioner_id: None,
            subject_id: None,
        },
    }
}

async fn authorize_command(engine: &Engine, actor: &Actor, cmd: &Command) -> PgWireResult<()> {
    let checks: Vec<(Action, Resource)> = match cmd {
        Command::InsertPractitioner { .. }
        | Command::DeletePractitioner { .. }
        | Command::InsertSubject { .. } => vec![(Action::ManageDirectory, Resource::Directory)],
        Command::SelectPractitioners | Command::SelectSubjects => {
            vec![(Action::ViewDirectory, Resource::Directory)]
        }
        Command::InsertBooking { request } => vec![(
            Action::Book,
            Resource::Agenda {
                practitioner_id: request.practitioner_id,
            },
        )],
        Command::BatchInsertBookings { requests } => {
            let mut agendas: Vec<Ulid> = requests.iter().map(|r| r.practitioner_id).collect();
            agendas.sort();
            agendas.dedup();
            agendas
                .into_iter()
                .map(|practitioner_id| (Action::Book, Resource::Agenda { practitioner_id }))
                .collect()
        }
        Command::DeleteBooking { id } => vec![(Action::Cancel, booking_resource(engine, *id).await)],
        Command::InsertBookingStatus { booking_id, status } => {
            let action = if *status == BookingStatus::Cancelled {
                Action::Cancel
            } else {
                Action::Transition
            };
            vec![(action, booking_resource(engine, *booking_id).await)]
        }
        Command::InsertReschedule { booking_id, .. } => {
            vec![(Action::Reschedule, booking_resource(engine, *booking_id).await)]
        }
        Command::InsertBookingNotes { booking_id, .. } => {
            vec![(Action::EditNotes, booking_resource(engine, *booking_id).await)]
        }
        Command::SelectBookings { filter } => {
            let resource = match (filter.id, filter.practitioner_id, filter.subject_id) {
                (Some(id), _, _) => booking_resource(engine, id).await,
                (None, None, None) => Resource::AllBookings,
                (None, practitioner_id, subject_id) => Resource::Booking {
                    practitioner_id,
                    subject_id,
                },
            };
            vec![(Action::ViewBookings, resource)]
        }
        Command::SelectAvailability {
            practitioner_id, ..
        }
        | Command::SelectConflicts {
            practitioner_id, ..
        } => vec![(
            Action::ViewAvailability,
            Resource::Agenda {
                practitioner_id: *practitioner_id,
            },
        )],
        Command::SelectAuditLog { .. } => vec![(Action::ViewAuditLog, Resource::AuditLog)],
    };

    for (action, resource) in checks {
        if let Decision::Deny(reason) = policy::authorize(actor, action, &resource) {
            return Err(user_error(
                "42501",
                format!("permission denied for {actor}: {reason}"),
            ));
        }
    }
    Ok(())
}

// ── Execution ────────────────────────────────────────────────────

async fn execute_command(engine: &Engine, actor: &Actor, cmd: Command) -> PgWireResult<Response> {
    match cmd {
        Command::InsertPractitioner { id, name } => {
            engine
                .register_practitioner(actor, id, name)
                .await
                .map_err(engine_err)?;
            Ok(insert_tag(1))
        }
        Command::DeletePractitioner { id } => {
            engine
                .deactivate_practitioner(actor, id)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::InsertSubject { id, name } => {
            engine
                .register_subject(actor, id, name)
                .await
                .map_err(engine_err)?;
            Ok(insert_tag(1))
        }
        Command::InsertBooking { request } => {
            engine
                .book_appointment(actor, request)
                .await
                .map_err(engine_err)?;
            Ok(insert_tag(1))
        }
        Command::BatchInsertBookings { requests } => {
            let booked = engine
                .batch_book(actor, requests)
                .await
                .map_err(engine_err)?;
            Ok(insert_tag(booked.len()))
        }
        Command::DeleteBooking { id } => {
            engine.cancel_booking(actor, id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::InsertBookingStatus { booking_id, status } => {
            engine
                .transition_booking(actor, booking_id, status)
                .await
                .map_err(engine_err)?;
            Ok(insert_tag(1))
        }
        Command::InsertReschedule {
            booking_id,
            start,
            duration_minutes,
        } => {
            engine
                .reschedule_booking(actor, booking_id, start, duration_minutes)
                .await
                .map_err(engine_err)?;
            Ok(insert_tag(1))
        }
        Command::InsertBookingNotes { booking_id, notes } => {
            engine
                .update_booking_notes(actor, booking_id, notes)
                .await
                .map_err(engine_err)?;
            Ok(insert_tag(1))
        }
        Command::SelectBookings { filter } => {
            let bookings = engine.list_bookings(&filter).await;
            query_response(bookings_schema(), bookings, |encoder, b| {
                encoder.encode_field(&b.id.to_string())?;
                encoder.encode_field(&b.practitioner_id.to_string())?;
                encoder.encode_field(&b.subject_id.to_string())?;
                encoder.encode_field(&b.span.start)?;
                encoder.encode_field(&b.span.end)?;
                encoder.encode_field(&b.span.duration_minutes())?;
                encoder.encode_field(&b.status.as_str())?;
                encoder.encode_field(&b.notes)?;
                Ok(())
            })
        }
        Command::SelectPractitioners => {
            query_response(practitioners_schema(), engine.list_practitioners(), |encoder, p| {
                encoder.encode_field(&p.id.to_string())?;
                encoder.encode_field(&p.name)?;
                encoder.encode_field(&p.active)?;
                Ok(())
            })
        }
        Command::SelectSubjects => {
            query_response(subjects_schema(), engine.list_subjects(), |encoder, s| {
                encoder.encode_field(&s.id.to_string())?;
                encoder.encode_field(&s.name)?;
                Ok(())
            })
        }
        Command::SelectAvailability {
            practitioner_id,
            start,
            end,
            min_duration,
        } => {
            let slots = engine
                .free_slots(practitioner_id, start, end, min_duration)
                .await
                .map_err(engine_err)?;
            let pid = practitioner_id.to_string();
            query_response(availability_schema(), slots, |encoder, slot| {
                encoder.encode_field(&pid)?;
                encoder.encode_field(&slot.start)?;
                encoder.encode_field(&slot.end)?;
                Ok(())
            })
        }
        Command::SelectConflicts {
            practitioner_id,
            start,
            duration_minutes,
        } => {
            let conflict = engine
                .check_availability(practitioner_id, start, duration_minutes)
                .await
                .map_err(engine_err)?;
            query_response(conflicts_schema(), conflict.into_iter().collect(), |encoder, c| {
                encoder.encode_field(&c.booking_id.to_string())?;
                encoder.encode_field(&c.span.start)?;
                encoder.encode_field(&c.span.end)?;
                Ok(())
            })
        }
        Command::SelectAuditLog { limit } => {
            let entries = engine.audit_log(limit.unwrap_or(MAX_AUDIT_ENTRIES));
            query_response(audit_schema(), entries, |encoder, e| {
                encoder.encode_field(&e.at)?;
                encoder.encode_field(&e.actor)?;
                encoder.encode_field(&e.action.as_str())?;
                encoder.encode_field(&e.entity_type)?;
                encoder.encode_field(&e.entity_id.to_string())?;
                encoder.encode_field(&e.details.to_string())?;
                Ok(())
            })
        }
    }
}

fn insert_tag(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("practitioner_id", Type::VARCHAR),
        field("subject_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("duration_minutes", Type::INT8),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
    ]
}

fn practitioners_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("active", Type::BOOL),
    ]
}

fn subjects_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::VARCHAR), field("name", Type::VARCHAR)]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("practitioner_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        field("booking_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn audit_schema() -> Vec<FieldInfo> {
    vec![
        field("at", Type::INT8),
        field("actor", Type::VARCHAR),
        field("action", Type::VARCHAR),
        field("entity_type", Type::VARCHAR),
        field("entity_id", Type::VARCHAR),
        field("details", Type::VARCHAR),
    ]
}

/// Table named after the first FROM, for statements not yet bound.
fn select_table(sql: &str) -> Option<String> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return None;
    }
    let after = &lower[lower.find(" from ")? + " from ".len()..];
    let table = after
        .split(|c: char| c.is_whitespace() || c == ';')
        .find(|s| !s.is_empty())?;
    Some(table.trim_matches('"').to_string())
}

/// Row description for a statement, empty for anything that returns a tag.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match select_table(sql).as_deref() {
        Some("bookings") => bookings_schema(),
        Some("practitioners") => practitioners_schema(),
        Some("subjects") => subjects_schema(),
        Some("availability") => availability_schema(),
        Some("conflicts") => conflicts_schema(),
        Some("audit_log") => audit_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for MedSchedHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct MedSchedQueryParser;

#[async_trait]
impl QueryParser for MedSchedQueryParser {
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
impl ExtendedQueryHandler for MedSchedHandler {
    type Statement = String;
    type QueryParser = MedSchedQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(client, &sql).await
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

/// Byte ranges and indexes of the `$N` placeholders outside quoted text.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let digits = bytes[i + 1..].iter().take_while(|c| c.is_ascii_digit()).count();
                if let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() {
                    found.push((i..i + 1 + digits, n));
                    i += 1 + digits;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound parameters (text format) as quoted literals in one pass, so
/// a value that itself contains `$N` is never substituted again.
fn substitute_params(sql: &str, params: &[Option<impl AsRef<[u8]>>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct MedSchedFactory {
    handler: Arc<MedSchedHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<MedSchedAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl MedSchedFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(MedSchedHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                MedSchedAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for MedSchedFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(MedSchedFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
