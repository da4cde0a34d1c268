use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        id: Ulid,
        name: String,
        capacity_kg: u32,
        tyres: u32,
        returning: bool,
    },
    SelectVehicles {
        filter: VehicleFilter,
    },
    SelectAvailableVehicles {
        capacity_required: u32,
        origin: String,
        destination: String,
        start: Ms,
    },
    InsertBooking {
        request: BookingRequest,
        returning: bool,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectSlots {
        vehicle_id: Ulid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleFilter {
    All,
    Id(Ulid),
    MinCapacity(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    All,
    Id(Ulid),
    Vehicle(Ulid),
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
    let row = InsertRow::from_insert(insert)?;

    match row.table.as_str() {
        "vehicles" => {
            row.check_columns(&["id", "name", "capacity_kg", "tyres"])?;
            Ok(Command::InsertVehicle {
                id: row.optional_id()?,
                name: parse_string_expr(row.require("name")?)?,
                capacity_kg: parse_u32(row.require("capacity_kg")?)?,
                tyres: parse_u32(row.require("tyres")?)?,
                returning: row.returning,
            })
        }
        "bookings" => {
            row.check_columns(&[
                "id",
                "vehicle_id",
                "origin",
                "destination",
                "start_time",
                "customer_id",
            ])?;
            Ok(Command::InsertBooking {
                request: BookingRequest {
                    id: row.optional_id()?,
                    vehicle_id: parse_ulid_expr(row.require("vehicle_id")?)?,
                    origin: parse_string_expr(row.require("origin")?)?,
                    destination: parse_string_expr(row.require("destination")?)?,
                    start: parse_timestamp_expr(row.require("start_time")?)?,
                    customer_id: parse_string_expr(row.require("customer_id")?)?,
                },
                returning: row.returning,
            })
        }
        "available_vehicles" | "reservation_slots" => {
            Err(SqlError::Unsupported(format!("INSERT into {}", row.table)))
        }
        _ => Err(SqlError::UnknownTable(row.table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: extract_where_id(&delete.selection)?,
        }),
        "vehicles" | "available_vehicles" | "reservation_slots" => {
            Err(SqlError::Unsupported(format!("DELETE from {table}")))
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "vehicles" => {
            let filter = match filters.as_slice() {
                [] => VehicleFilter::All,
                [f] if f.is("id", BinaryOperator::Eq) => VehicleFilter::Id(parse_ulid_expr(f.value)?),
                [f] if f.is("capacity_kg", BinaryOperator::GtEq) => {
                    VehicleFilter::MinCapacity(parse_u32(f.value)?)
                }
                _ => return Err(SqlError::Unsupported(
                    "vehicles can be filtered by id = .. or capacity_kg >= ..".into(),
                )),
            };
            Ok(Command::SelectVehicles { filter })
        }
        "available_vehicles" => parse_available_filters(&filters),
        "bookings" => {
            let filter = match filters.as_slice() {
                [] => BookingFilter::All,
                [f] if f.is("id", BinaryOperator::Eq) => BookingFilter::Id(parse_ulid_expr(f.value)?),
                [f] if f.is("vehicle_id", BinaryOperator::Eq) => {
                    BookingFilter::Vehicle(parse_ulid_expr(f.value)?)
                }
                _ => return Err(SqlError::Unsupported(
                    "bookings can be filtered by id = .. or vehicle_id = ..".into(),
                )),
            };
            Ok(Command::SelectBookings { filter })
        }
        "reservation_slots" => match filters.as_slice() {
            [f] if f.is("vehicle_id", BinaryOperator::Eq) => Ok(Command::SelectSlots {
                vehicle_id: parse_ulid_expr(f.value)?,
            }),
            _ => Err(SqlError::MissingFilter("vehicle_id")),
        },
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_available_filters(filters: &[Filter<'_>]) -> Result<Command, SqlError> {
    let (mut capacity_required, mut origin, mut destination, mut start) = (None, None, None, None);
    for f in filters {
        if f.op != BinaryOperator::Eq {
            return Err(SqlError::Unsupported(format!(
                "available_vehicles.{} only supports =",
                f.column
            )));
        }
        match f.column.as_str() {
            "capacity_required" => capacity_required = Some(parse_u32(f.value)?),
            "origin" => origin = Some(parse_string_expr(f.value)?),
            "destination" => destination = Some(parse_string_expr(f.value)?),
            "start_time" => start = Some(parse_timestamp_expr(f.value)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    Ok(Command::SelectAvailableVehicles {
        capacity_required: capacity_required.ok_or(SqlError::MissingFilter("capacity_required"))?,
        origin: origin.ok_or(SqlError::MissingFilter("origin"))?,
        destination: destination.ok_or(SqlError::MissingFilter("destination"))?,
        start: start.ok_or(SqlError::MissingFilter("start_time"))?,
    })
}

// ── Helpers ───────────────────────────────────────────────────

/// One `column <op> value` term of a WHERE clause.
struct Filter<'a> {
    column: String,
    op: BinaryOperator,
    value: &'a Expr,
}

impl Filter<'_> {
    fn is(&self, column: &str, op: BinaryOperator) -> bool {
        self.column == column && self.op == op
    }
}

/// Flatten an AND-tree of simple comparisons. Anything else is rejected
/// rather than silently ignored.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push(Filter {
                column,
                op: op.clone(),
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

/// A single-row INSERT with an explicit column list.
struct InsertRow {
    table: String,
    cells: Vec<(String, Expr)>,
    returning: bool,
}

impl InsertRow {
    fn from_insert(insert: &ast::Insert) -> Result<Self, SqlError> {
        let table = insert_table_name(insert)?;
        let rows = extract_insert_rows(insert)?;
        if rows.len() != 1 {
            return Err(SqlError::Unsupported("multi-row INSERT".into()));
        }
        if insert.columns.is_empty() {
            return Err(SqlError::Parse(format!("INSERT into {table} needs a column list")));
        }
        let values = &rows[0];
        if values.len() != insert.columns.len() {
            return Err(SqlError::WrongArity(insert.columns.len(), values.len()));
        }
        let cells = insert
            .columns
            .iter()
            .map(|c| c.value.to_lowercase())
            .zip(values.iter().cloned())
            .collect();
        Ok(Self {
            table,
            cells,
            returning: insert.returning.is_some(),
        })
    }

    fn check_columns(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.cells.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((c, _)) => Err(SqlError::UnknownColumn(format!("{}.{c}", self.table))),
            None => Ok(()),
        }
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    /// Client-supplied `id`, or a fresh ULID when absent or NULL.
    fn optional_id(&self) -> Result<Ulid, SqlError> {
        match self.get("id") {
            Some(expr) => Ok(parse_ulid_or_null(expr)?.unwrap_or_else(Ulid::new)),
            None => Ok(Ulid::new()),
        }
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

/// Strings, plus bare numbers so unquoted postal codes work.
fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

/// RFC 3339 text or integer Unix milliseconds.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return parse_rfc3339(s);
    }
    parse_i64_expr(expr)
}

pub fn parse_rfc3339(s: &str) -> Result<Ms, SqlError> {
    chrono::DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")))
}

/// Render Unix milliseconds as RFC 3339 UTC with millisecond precision.
pub fn format_rfc3339(ms: Ms) -> String {
    match chrono::DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    /// Columns named vs. values given.
    WrongArity(usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
