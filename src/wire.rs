use std::fmt::Debug;
use std::io;
use std::sync::Arc;

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
use ulid::Ulid;

use crate::auth::CarrelAuthSource;
use crate::engine::{now_ms, Engine};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct CarrelHandler {
    engine: Arc<Engine>,
    query_parser: Arc<CarrelQueryParser>,
}

impl CarrelHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CarrelQueryParser),
        }
    }

    /// The connection's `user` startup parameter is the acting identity for
    /// every command on this connection.
    fn actor<C: ClientInfo>(client: &C) -> String {
        client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_else(|| "anonymous".to_string())
    }

    async fn execute_command(&self, actor: &str, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.dispatch(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, actor: &str, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertSpace {
                id,
                name,
                kind,
                capacity,
                description,
                location,
                image_ref,
            } => {
                let space = Space {
                    id,
                    name,
                    kind,
                    capacity,
                    description,
                    location,
                    image_ref,
                };
                engine.create_space(space, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateSpace { id, patch } => {
                engine
                    .update_space(id, patch, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteSpace { id } => {
                engine.delete_space(id, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertUser { profile } => {
                engine.upsert_user(profile, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertReservation {
                space_id,
                user_id,
                start,
            } => {
                // Booking on someone else's behalf is an admin privilege
                if user_id != actor && !engine.is_admin(actor) {
                    return Err(user_err("42501", format!("cannot reserve for {user_id}")));
                }
                let outcome = engine
                    .create_reservation(space_id, &user_id, start)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(reserve_outcome_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                match outcome {
                    ReserveOutcome::Reserved { id } => {
                        encoder.encode_field(&"reserved")?;
                        encoder.encode_field(&id.to_string())?;
                        encoder.encode_field(&None::<i64>)?;
                    }
                    ReserveOutcome::Waitlisted { id, position } => {
                        encoder.encode_field(&"waitlisted")?;
                        encoder.encode_field(&id.to_string())?;
                        encoder.encode_field(&Some(position as i64))?;
                    }
                }
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::ApproveReservation { id } => {
                engine
                    .approve_reservation(id, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::RejectReservation { id } => {
                engine
                    .reject_reservation(id, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CancelReservation { id } => {
                engine
                    .cancel_reservation(id, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::RescheduleReservation { id, start } => {
                engine
                    .reschedule_reservation(id, actor, start)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CheckIn { token } => {
                let outcome = engine
                    .check_in(&token, now_ms())
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(checkin_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&outcome.as_str())?;
                let id = match &outcome {
                    CheckInOutcome::CheckedIn { id, .. }
                    | CheckInOutcome::NoShow { id }
                    | CheckInOutcome::AlreadyCheckedIn { id }
                    | CheckInOutcome::NotCheckable { id, .. } => Some(id.to_string()),
                    CheckInOutcome::Invalid => None,
                };
                encoder.encode_field(&id)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::InsertFeedback {
                program_id,
                user_id,
                rating,
                comment,
            } => {
                if user_id != actor && !engine.is_admin(actor) {
                    return Err(user_err(
                        "42501",
                        format!("cannot submit feedback for {user_id}"),
                    ));
                }
                engine
                    .submit_feedback(program_id, &user_id, rating, comment)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectSpaces => {
                let spaces = engine.list_spaces().await;
                let schema = Arc::new(spaces_schema());
                let rows: Vec<PgWireResult<_>> = spaces
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&s.kind.as_str())?;
                        encoder.encode_field(&(s.capacity as i64))?;
                        encoder.encode_field(&s.description)?;
                        encoder.encode_field(&s.location)?;
                        encoder.encode_field(&s.image_ref)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectReservations {
                user_id,
                space_id,
                status,
            } => {
                let reservations = engine
                    .reservations_filtered(user_id.as_deref(), space_id, status)
                    .await;
                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<_>> = reservations
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.space_id.to_string())?;
                        encoder.encode_field(&r.user_id)?;
                        encoder.encode_field(&r.span.start)?;
                        encoder.encode_field(&r.span.end)?;
                        encoder.encode_field(&r.status.as_str())?;
                        encoder.encode_field(&r.created_at)?;
                        encoder.encode_field(&r.check_in_time)?;
                        encoder.encode_field(&r.reminder_sent)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectWaitlist { space_id } => {
                let entries = engine.waitlist_for_space(space_id).await;
                let schema = Arc::new(waitlist_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&w.id.to_string())?;
                        encoder.encode_field(&w.space_id.to_string())?;
                        encoder.encode_field(&w.user_id)?;
                        encoder.encode_field(&(w.position as i64))?;
                        encoder.encode_field(&w.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectFeedback { program_id } => {
                let feedback = engine.feedback_for_program(program_id);
                let schema = Arc::new(feedback_schema());
                let rows: Vec<PgWireResult<_>> = feedback
                    .into_iter()
                    .map(|f| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&f.id.to_string())?;
                        encoder.encode_field(&f.program_id.to_string())?;
                        encoder.encode_field(&f.user_id)?;
                        encoder.encode_field(&(f.rating as i64))?;
                        encoder.encode_field(&f.comment)?;
                        encoder.encode_field(&f.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectStats { day } => {
                let stats = match day {
                    Some(day) => engine.stats_for_day(&day),
                    None => engine.all_stats(),
                };
                let schema = Arc::new(stats_schema());
                let rows: Vec<PgWireResult<_>> = stats
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.day)?;
                        encoder.encode_field(&s.space_id.to_string())?;
                        encoder.encode_field(&(s.reservation_count as i64))?;
                        encoder.encode_field(&(s.check_in_count as i64))?;
                        encoder.encode_field(&(s.no_show_count as i64))?;
                        encoder.encode_field(&s.average_rating())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let space_id_str = channel.strip_prefix("space_").ok_or_else(|| {
                    user_err(
                        "42000",
                        format!("invalid channel: {channel} (expected space_{{id}})"),
                    )
                })?;
                let _space_id = Ulid::from_string(space_id_str)
                    .map_err(|e| user_err("42000", format!("bad ULID in channel: {e}")))?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn reserve_outcome_schema() -> Vec<FieldInfo> {
    vec![
        text_field("outcome"),
        text_field("id"),
        int8_field("position"),
    ]
}

fn checkin_schema() -> Vec<FieldInfo> {
    vec![text_field("status"), text_field("reservation_id")]
}

fn spaces_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("kind"),
        int8_field("capacity"),
        text_field("description"),
        text_field("location"),
        text_field("image_ref"),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("space_id"),
        text_field("user_id"),
        int8_field("start"),
        int8_field("end"),
        text_field("status"),
        int8_field("created_at"),
        int8_field("check_in_time"),
        FieldInfo::new(
            "reminder_sent".into(),
            None,
            None,
            Type::BOOL,
            FieldFormat::Text,
        ),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("space_id"),
        text_field("user_id"),
        int8_field("position"),
        int8_field("created_at"),
    ]
}

fn feedback_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("program_id"),
        text_field("user_id"),
        int8_field("rating"),
        text_field("comment"),
        int8_field("created_at"),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        text_field("day"),
        text_field("space_id"),
        int8_field("reservation_count"),
        int8_field("check_in_count"),
        int8_field("no_show_count"),
        FieldInfo::new(
            "average_rating".into(),
            None,
            None,
            Type::FLOAT8,
            FieldFormat::Text,
        ),
    ]
}

/// Result schema for a statement, used by simple and extended describe.
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.starts_with("CHECKIN") {
        return checkin_schema();
    }
    if upper.contains("INSERT INTO RESERVATIONS") {
        return reserve_outcome_schema();
    }
    if upper.contains("SELECT") {
        if upper.contains("FROM SPACES") {
            return spaces_schema();
        }
        if upper.contains("FROM RESERVATIONS") {
            return reservations_schema();
        }
        if upper.contains("FROM WAITLISTS") {
            return waitlist_schema();
        }
        if upper.contains("FROM FEEDBACK") {
            return feedback_schema();
        }
        if upper.contains("FROM STATS") {
            return stats_schema();
        }
    }
    vec![]
}

#[async_trait]
impl SimpleQueryHandler for CarrelHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = Self::actor(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&actor, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CarrelQueryParser;

#[async_trait]
impl QueryParser for CarrelQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CarrelHandler {
    type Statement = String;
    type QueryParser = CarrelQueryParser;

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
        let actor = Self::actor(client);
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&actor, cmd).await?;
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct CarrelFactory {
    handler: Arc<CarrelHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CarrelAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CarrelFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = CarrelAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CarrelHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CarrelFactory {
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
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = CarrelFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    user_err("P0001", e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_err("42601", e.to_string())
}

fn user_err(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}
