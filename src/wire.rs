use std::fmt::Debug;
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

use crate::auth::InnLedgerAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct InnLedgerHandler {
    engine: Arc<Engine>,
    query_parser: Arc<InnLedgerQueryParser>,
}

impl InnLedgerHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(InnLedgerQueryParser),
        }
    }

    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertResource {
                id,
                name,
                total_units,
                price_per_night,
                first_night,
                last_night,
            } => {
                engine
                    .create_resource(id, name, total_units, price_per_night, first_night, last_night)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::ExtendInventory {
                resource_id,
                first_night,
                last_night,
            } => {
                let added = engine
                    .extend_inventory(resource_id, first_night, last_night)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(added))])
            }
            Command::Reserve(req) => {
                let reservation = engine.reserve(req).await.map_err(engine_err)?;
                let resp = ReserveResponse::from(&reservation);
                let schema = Arc::new(reserve_response_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&resp.reservation_id.to_string())?;
                encoder.encode_field(&resp.status.to_string())?;
                encoder.encode_field(&resp.total_amount)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Confirm(req) => {
                let reservation = engine
                    .confirm_with_payment(req.reservation_id)
                    .await
                    .map_err(engine_err)?;
                let resp = ConfirmResponse::from(&reservation);
                let schema = Arc::new(confirm_response_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&resp.reservation_id.to_string())?;
                encoder.encode_field(&resp.status.to_string())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Cancel { id } => {
                engine.cancel(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectReservation { id } => {
                let r = engine.get_reservation(&id).await.map_err(engine_err)?;
                reservation_rows(vec![r])
            }
            Command::SelectReservations { resource_id } => {
                if engine.get_resource(&resource_id).is_none() {
                    return Err(engine_err(EngineError::NotFound(resource_id)));
                }
                reservation_rows(engine.list_reservations(resource_id).await)
            }
            Command::SelectLedger {
                resource_id,
                from,
                until,
            } => {
                let entries = engine
                    .ledger(resource_id, from, until)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(ledger_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .into_iter()
                    .map(|entry| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&entry.resource_id.to_string())?;
                        encoder.encode_field(&entry.date.to_string())?;
                        encoder.encode_field(&i64::from(entry.units_remaining))?;
                        encoder.encode_field(&i64::from(entry.total_units))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectResources => {
                let schema = Arc::new(resource_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_resources()
                    .into_iter()
                    .map(|info| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&info.id.to_string())?;
                        encoder.encode_field(&info.name)?;
                        encoder.encode_field(&i64::from(info.total_units))?;
                        encoder.encode_field(&info.price_per_night)?;
                        encoder.encode_field(&info.first_night.map(|d| d.to_string()))?;
                        encoder.encode_field(&info.last_night.map(|d| d.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

fn reservation_rows(reservations: Vec<Reservation>) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.resource_id.to_string())?;
            encoder.encode_field(&r.requester_id.to_string())?;
            encoder.encode_field(&r.stay.start.to_string())?;
            encoder.encode_field(&r.stay.end.to_string())?;
            encoder.encode_field(&r.status.to_string())?;
            encoder.encode_field(&r.total_amount)?;
            encoder.encode_field(&r.expires_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn reserve_response_schema() -> Vec<FieldInfo> {
    vec![text("reservation_id"), text("status"), int8("total_amount")]
}

fn confirm_response_schema() -> Vec<FieldInfo> {
    vec![text("reservation_id"), text("status")]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("resource_id"),
        text("requester_id"),
        text("start_date"),
        text("end_date"),
        text("status"),
        int8("total_amount"),
        int8("expires_at"),
    ]
}

fn ledger_schema() -> Vec<FieldInfo> {
    vec![
        text("resource_id"),
        text("date"),
        int8("units_remaining"),
        int8("total_units"),
    ]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        int8("total_units"),
        int8("price_per_night"),
        text("first_night"),
        text("last_night"),
    ]
}

/// Row shape a statement will produce, judged from its verb and table so
/// it works before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let table_after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1).copied())
    };
    match words.first().copied() {
        Some("select") => match table_after("from") {
            Some("reservations") => reservation_schema(),
            Some("ledger") => ledger_schema(),
            Some("resources") => resource_schema(),
            _ => vec![],
        },
        Some("insert") => match table_after("into") {
            Some("reservations") => reserve_response_schema(),
            Some("confirmations") => confirm_response_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for InnLedgerHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InnLedgerQueryParser;

#[async_trait]
impl QueryParser for InnLedgerQueryParser {
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
impl ExtendedQueryHandler for InnLedgerHandler {
    type Statement = String;
    type QueryParser = InnLedgerQueryParser;

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
        let mut responses = self.run(&sql).await?;
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

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut chars = sql.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            continue;
        }
        let mut digits = String::new();
        while let Some(&(_, d)) = chars.peek()
            && d.is_ascii_digit()
        {
            digits.push(d);
            chars.next();
        }
        if let Ok(n) = digits.parse::<usize>() {
            max = max.max(n);
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

// ── Factory ──────────────────────────────────────────────────────

pub struct InnLedgerFactory {
    handler: Arc<InnLedgerHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<InnLedgerAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl InnLedgerFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(InnLedgerHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                InnLedgerAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnLedgerFactory {
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
) -> std::io::Result<()> {
    let factory = Arc::new(InnLedgerFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported to the client for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidRequest(_) => "22023",
        EngineError::InsufficientAvailability { .. } => "53400",
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidState { .. } => "55000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::LockTimeout(_) => "55P03",
        EngineError::Storage(_) => "58030",
        EngineError::PaymentDeclined(_) => "P0001",
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
