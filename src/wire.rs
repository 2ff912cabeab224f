use std::fmt::Debug;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::api::{Command, Outcome};
use crate::auth::SharedSecretAuth;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Shape, SqlError};
use crate::tenant::TenantManager;

pub struct CounselHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<CounselQueryParser>,
}

impl CounselHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(CounselQueryParser),
        }
    }

    async fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Engine> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).await.map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn run(&self, engine: &Engine, query: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        debug!("executing {}", observability::command_label(&cmd));
        let tag = command_tag(&cmd);
        let outcome = engine.execute(cmd).await.map_err(engine_err)?;
        encode_outcome(tag, outcome, format)
    }
}

/// Mutations report their verb; inserts also return the written row.
fn command_tag(cmd: &Command) -> &'static str {
    match cmd {
        Command::PublishSlot { .. }
        | Command::CreateMeetingRequest { .. }
        | Command::AcceptMeetingRequest { .. }
        | Command::RejectMeetingRequest { .. } => "INSERT",
        Command::RemoveSlot { .. } => "DELETE",
        _ => "SELECT",
    }
}

fn encode_outcome(tag: &'static str, outcome: Outcome, format: &Format) -> PgWireResult<Response> {
    if tag == "DELETE" {
        return Ok(Response::Execution(Tag::new("DELETE").with_rows(1)));
    }
    let (shape, rows) = match outcome {
        Outcome::Slots(slots) => (Shape::Slots, encode_rows(Shape::Slots, format, &slots, encode_slot)?),
        Outcome::Slot(slot) => (Shape::Slots, encode_rows(Shape::Slots, format, &[slot], encode_slot)?),
        Outcome::Request(request) => (
            Shape::Requests,
            encode_rows(Shape::Requests, format, &[request], encode_request)?,
        ),
        Outcome::Requests(views) => (
            Shape::Views,
            encode_rows(Shape::Views, format, &views, encode_view)?,
        ),
        Outcome::Stats(stats) => (
            Shape::Stats,
            encode_rows(Shape::Stats, format, &[stats], encode_stats)?,
        ),
    };
    let fields = Arc::new(schema(shape, format));
    Ok(Response::Query(QueryResponse::new(
        fields,
        stream::iter(rows.into_iter().map(Ok)),
    )))
}

fn encode_rows<T>(
    shape: Shape,
    format: &Format,
    items: &[T],
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Vec<DataRow>> {
    let fields = Arc::new(schema(shape, format));
    items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(fields.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect()
}

fn encode_slot(encoder: &mut DataRowEncoder, slot: &AvailabilitySlot) -> PgWireResult<()> {
    encoder.encode_field(&slot.id.to_string())?;
    encoder.encode_field(&slot.counselor_id.to_string())?;
    encoder.encode_field(&slot.date.to_string())?;
    encoder.encode_field(&slot.start_time.format("%H:%M:%S").to_string())?;
    encoder.encode_field(&slot.end_time.format("%H:%M:%S").to_string())?;
    encoder.encode_field(&slot.claimed)?;
    Ok(())
}

fn encode_request(encoder: &mut DataRowEncoder, r: &MeetingRequest) -> PgWireResult<()> {
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.requester_id.to_string())?;
    encoder.encode_field(&r.owner_id.to_string())?;
    encoder.encode_field(&r.availability_slot_id.map(|id| id.to_string()))?;
    encoder.encode_field(&r.agenda)?;
    encoder.encode_field(&r.status.to_string())?;
    encoder.encode_field(&r.rejection_reason)?;
    encoder.encode_field(&r.meeting_reference)?;
    encoder.encode_field(&r.requested_date.map(|d| d.to_string()))?;
    encoder.encode_field(&r.requested_time.map(|t| t.format("%H:%M:%S").to_string()))?;
    encoder.encode_field(&r.created_at)?;
    encoder.encode_field(&r.updated_at)?;
    Ok(())
}

fn encode_view(encoder: &mut DataRowEncoder, view: &RequestView) -> PgWireResult<()> {
    encode_request(encoder, &view.request)?;
    encoder.encode_field(&view.counterpart.id.to_string())?;
    encoder.encode_field(&view.counterpart.name)?;
    encoder.encode_field(&view.counterpart.email)?;
    let window = view.slot.as_ref();
    encoder.encode_field(&window.map(|w| w.date.to_string()))?;
    encoder.encode_field(&window.map(|w| w.start_time.format("%H:%M:%S").to_string()))?;
    encoder.encode_field(
        &window
            .and_then(|w| w.end_time)
            .map(|t| t.format("%H:%M:%S").to_string()),
    )?;
    Ok(())
}

fn encode_stats(encoder: &mut DataRowEncoder, stats: &RequestStats) -> PgWireResult<()> {
    encoder.encode_field(&(stats.total as i64))?;
    encoder.encode_field(&(stats.pending as i64))?;
    encoder.encode_field(&(stats.accepted as i64))?;
    encoder.encode_field(&(stats.rejected as i64))?;
    Ok(())
}

/// Result columns of a shape, before wire formats are applied.
fn columns(shape: Shape) -> Vec<(&'static str, Type)> {
    match shape {
        Shape::Slots => vec![
            ("id", Type::VARCHAR),
            ("counselor_id", Type::VARCHAR),
            ("date", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("claimed", Type::BOOL),
        ],
        Shape::Requests => request_columns(),
        Shape::Views => {
            let mut cols = request_columns();
            cols.extend([
                ("counterpart_id", Type::VARCHAR),
                ("counterpart_name", Type::VARCHAR),
                ("counterpart_email", Type::VARCHAR),
                ("slot_date", Type::VARCHAR),
                ("slot_start_time", Type::VARCHAR),
                ("slot_end_time", Type::VARCHAR),
            ]);
            cols
        }
        Shape::Stats => vec![
            ("total", Type::INT8),
            ("pending", Type::INT8),
            ("accepted", Type::INT8),
            ("rejected", Type::INT8),
        ],
    }
}

fn request_columns() -> Vec<(&'static str, Type)> {
    vec![
        ("id", Type::VARCHAR),
        ("requester_id", Type::VARCHAR),
        ("owner_id", Type::VARCHAR),
        ("availability_slot_id", Type::VARCHAR),
        ("agenda", Type::VARCHAR),
        ("status", Type::VARCHAR),
        ("rejection_reason", Type::VARCHAR),
        ("meeting_reference", Type::VARCHAR),
        ("requested_date", Type::VARCHAR),
        ("requested_time", Type::VARCHAR),
        ("created_at", Type::INT8),
        ("updated_at", Type::INT8),
    ]
}

/// Row description for a shape. Extended-protocol clients pick text or binary
/// per column through `format`; simple queries are always text.
fn schema(shape: Shape, format: &Format) -> Vec<FieldInfo> {
    columns(shape)
        .into_iter()
        .enumerate()
        .map(|(idx, (name, ty))| FieldInfo::new(name.into(), None, None, ty, format.format_for(idx)))
        .collect()
}

fn describe(sql: &str, format: &Format) -> Vec<FieldInfo> {
    sql::result_shape(sql)
        .map(|shape| schema(shape, format))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for CounselHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client).await?;
        Ok(vec![self.run(&engine, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CounselQueryParser;

#[async_trait]
impl QueryParser for CounselQueryParser {
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
        Ok(describe(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CounselHandler {
    type Statement = String;
    type QueryParser = CounselQueryParser;

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
        let engine = self.resolve_engine(client).await?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql, &portal.result_column_format).await
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
            describe(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(describe(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder outside string literals.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            // '' inside a literal toggles twice and stays inside
            in_literal = !in_literal;
            i += 1;
        } else if bytes[i] == b'$' && !in_literal {
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
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

/// Single left-to-right pass. Inserted values are never rescanned and
/// placeholders inside string literals are copied as-is.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;

    while let Some((i, c)) = chars.next() {
        if in_literal {
            out.push(c);
            if c == '\'' {
                // '' is an escaped quote, not the end of the literal
                if let Some(&(_, '\'')) = chars.peek() {
                    chars.next();
                    out.push('\'');
                } else {
                    in_literal = false;
                }
            }
            continue;
        }
        match c {
            '\'' => {
                in_literal = true;
                out.push(c);
            }
            '$' => {
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                let bound = sql[start..end]
                    .parse::<usize>()
                    .ok()
                    .filter(|n| (1..=params.len()).contains(n))
                    .map(|n| &params[n - 1]);
                match bound {
                    Some(Some(text)) => {
                        out.push('\'');
                        out.push_str(&text.replace('\'', "''"));
                        out.push('\'');
                    }
                    Some(None) => out.push_str("NULL"),
                    None => out.push_str(&sql[i..end]),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CounselFactory {
    handler: Arc<CounselHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedSecretAuth, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CounselFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SharedSecretAuth::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CounselHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CounselFactory {
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
) -> std::io::Result<()> {
    let factory = Arc::new(CounselFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for an engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match (e.kind(), e) {
        (ErrorKind::Validation, EngineError::LimitExceeded(_)) => "54000",
        (ErrorKind::Validation, _) => "22023",
        (
            ErrorKind::Conflict,
            EngineError::NotPending { .. } | EngineError::InvalidTransition { .. },
        ) => "55000",
        (ErrorKind::Conflict, _) => "40001",
        (ErrorKind::NotFound, _) => "P0002",
        (ErrorKind::Store, _) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
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
