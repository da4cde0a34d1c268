use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
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

use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability;
use crate::sql::{self, format_rfc3339, BookingFilter, Command, VehicleFilter};

pub struct FleetHandler {
    engine: Arc<Engine>,
    query_parser: Arc<FleetQueryParser>,
}

impl FleetHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(FleetQueryParser),
        }
    }

    /// Run one command, recording its latency and outcome.
    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn dispatch(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertVehicle {
                id,
                name,
                capacity_kg,
                tyres,
                returning,
            } => {
                let vehicle = engine
                    .register_vehicle(id, name, capacity_kg, tyres)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    rows_response(vehicles_schema(), &[vehicle], encode_vehicle)
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::SelectVehicles { filter } => {
                let vehicles = match filter {
                    VehicleFilter::All => engine.list_vehicles(),
                    VehicleFilter::Id(id) => engine.get_vehicle(id).map(|v| vec![v]).unwrap_or_default(),
                    VehicleFilter::MinCapacity(kg) => engine.list_vehicles_by_min_capacity(kg),
                };
                rows_response(vehicles_schema(), &vehicles, encode_vehicle)
            }
            Command::SelectAvailableVehicles {
                capacity_required,
                origin,
                destination,
                start,
            } => {
                let available = engine
                    .search_available(capacity_required, &origin, &destination, start)
                    .await
                    .map_err(engine_err)?;
                rows_response(available_schema(), &available, encode_available)
            }
            Command::InsertBooking { request, returning } => {
                let booking = engine.create_booking(request).await.map_err(engine_err)?;
                if returning {
                    rows_response(bookings_schema(), &[booking], encode_booking)
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::All => engine.list_bookings(),
                    BookingFilter::Id(id) => engine.get_booking(id).map(|b| vec![b]).unwrap_or_default(),
                    BookingFilter::Vehicle(vid) => {
                        engine.list_bookings_for_vehicle(vid).map_err(engine_err)?
                    }
                };
                rows_response(bookings_schema(), &bookings, encode_booking)
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSlots { vehicle_id } => {
                let slots = engine.list_slots(vehicle_id).await.map_err(engine_err)?;
                rows_response(slots_schema(), &slots, encode_slot)
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn vehicles_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        int_field("capacity_kg"),
        int_field("tyres"),
    ]
}

fn available_schema() -> Vec<FieldInfo> {
    let mut schema = vehicles_schema();
    schema.push(int_field("estimated_duration_hours"));
    schema
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("vehicle_id"),
        text_field("origin"),
        text_field("destination"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("customer_id"),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("vehicle_id"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("state"),
        text_field("expires_at"),
        text_field("booking_id"),
    ]
}

/// Pick the result columns for a statement before it runs (Describe).
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let returns_rows = upper.trim_start().starts_with("SELECT") || upper.contains("RETURNING");
    if !returns_rows {
        vec![]
    } else if upper.contains("AVAILABLE_VEHICLES") {
        available_schema()
    } else if upper.contains("RESERVATION_SLOTS") {
        slots_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("VEHICLES") {
        vehicles_schema()
    } else {
        vec![]
    }
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
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
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_vehicle(encoder: &mut DataRowEncoder, v: &Vehicle) -> PgWireResult<()> {
    encoder.encode_field(&v.id.to_string())?;
    encoder.encode_field(&v.name)?;
    encoder.encode_field(&i64::from(v.capacity_kg))?;
    encoder.encode_field(&i64::from(v.tyres))
}

fn encode_available(encoder: &mut DataRowEncoder, a: &AvailableVehicle) -> PgWireResult<()> {
    encode_vehicle(encoder, &a.vehicle)?;
    encoder.encode_field(&(a.estimated_duration_ms / HOUR_MS))
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.vehicle_id.to_string())?;
    encoder.encode_field(&b.origin)?;
    encoder.encode_field(&b.destination)?;
    encoder.encode_field(&format_rfc3339(b.start))?;
    encoder.encode_field(&format_rfc3339(b.end))?;
    encoder.encode_field(&b.customer_id)
}

fn encode_slot(encoder: &mut DataRowEncoder, s: &SlotInfo) -> PgWireResult<()> {
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.vehicle_id.to_string())?;
    encoder.encode_field(&format_rfc3339(s.start))?;
    encoder.encode_field(&format_rfc3339(s.end))?;
    encoder.encode_field(&s.state.as_str())?;
    encoder.encode_field(&format_rfc3339(s.expires_at))?;
    encoder.encode_field(&s.booking_id.map(|id| id.to_string()))
}

#[async_trait]
impl SimpleQueryHandler for FleetHandler {
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
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute_command(cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetQueryParser;

#[async_trait]
impl QueryParser for FleetQueryParser {
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
impl ExtendedQueryHandler for FleetHandler {
    type Statement = String;
    type QueryParser = FleetQueryParser;

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
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute_command(cmd).await
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

/// Piece of a statement: literal SQL text or a `$N` placeholder.
#[derive(Debug, PartialEq)]
enum SqlPiece<'a> {
    Text(&'a str),
    Param(usize),
}

/// Split `sql` at its `$N` placeholders. Quoted strings and identifiers are
/// kept as text, so a `$1` inside `'...'` or `"..."` is not a placeholder.
fn split_placeholders(sql: &str) -> Vec<SqlPiece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut text_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // A doubled quote is an escaped quote.
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let digits_start = i + 1;
                let mut j = digits_start;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                match sql[digits_start..j].parse::<usize>() {
                    Ok(n) if n > 0 => {
                        if text_start < i {
                            pieces.push(SqlPiece::Text(&sql[text_start..i]));
                        }
                        pieces.push(SqlPiece::Param(n));
                        text_start = j;
                    }
                    _ => {}
                }
                i = j.max(i + 1);
            }
            _ => i += 1,
        }
    }
    if text_start < bytes.len() {
        pieces.push(SqlPiece::Text(&sql[text_start..]));
    }
    pieces
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    split_placeholders(sql)
        .iter()
        .filter_map(|piece| match piece {
            SqlPiece::Param(n) => Some(*n),
            SqlPiece::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Replace each `$N` with its bound value (text format) as a quoted literal,
/// in one left-to-right pass. Bound values are never rescanned.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    for piece in split_placeholders(sql) {
        match piece {
            SqlPiece::Text(text) => out.push_str(text),
            SqlPiece::Param(n) => match params.get(n - 1) {
                Some(Some(bytes)) => {
                    let text = String::from_utf8_lossy(bytes.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                Some(None) => out.push_str("NULL"),
                None => {
                    out.push('$');
                    out.push_str(&n.to_string());
                }
            },
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

/// Handlers for every connection. Startup is a no-op: clients are trusted.
pub struct FleetFactory {
    handler: Arc<FleetHandler>,
    noop: Arc<NoopHandler>,
}

impl FleetFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(FleetHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<FleetFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// SQLSTATE for an engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        other => match other.kind() {
            ErrorKind::Validation => "22023",
            ErrorKind::NotFound => "P0002",
            ErrorKind::Conflict => "23P01",
            ErrorKind::TransientStorage => "58030",
        },
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
