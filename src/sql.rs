use chrono::NaiveDate;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: Option<String>,
        total_units: u32,
        price_per_night: i64,
        first_night: NaiveDate,
        last_night: NaiveDate,
    },
    ExtendInventory {
        resource_id: Ulid,
        first_night: NaiveDate,
        last_night: NaiveDate,
    },
    Reserve(ReserveRequest),
    Confirm(ConfirmRequest),
    Cancel {
        id: Ulid,
    },
    SelectReservation {
        id: Ulid,
    },
    SelectReservations {
        resource_id: Ulid,
    },
    SelectLedger {
        resource_id: Ulid,
        from: NaiveDate,
        until: NaiveDate,
    },
    SelectResources,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.trim().trim_end_matches(';').trim().is_empty() {
        return Err(SqlError::Empty);
    }
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

    match table.as_str() {
        "resources" => {
            expect_arity("resources", 6, &values)?;
            Ok(Command::InsertResource {
                id: parse_ulid(&values[0])?,
                name: parse_string_or_null(&values[1])?,
                total_units: parse_u32(&values[2])?,
                price_per_night: parse_i64(&values[3])?,
                first_night: parse_date(&values[4])?,
                last_night: parse_date(&values[5])?,
            })
        }
        "inventory" => {
            expect_arity("inventory", 3, &values)?;
            Ok(Command::ExtendInventory {
                resource_id: parse_ulid(&values[0])?,
                first_night: parse_date(&values[1])?,
                last_night: parse_date(&values[2])?,
            })
        }
        "reservations" => {
            expect_arity("reservations", 5, &values)?;
            Ok(Command::Reserve(ReserveRequest {
                reservation_id: parse_ulid(&values[0])?,
                resource_id: parse_ulid(&values[1])?,
                requester_id: parse_ulid(&values[2])?,
                start_date: parse_date(&values[3])?,
                end_date: parse_date(&values[4])?,
            }))
        }
        "confirmations" => {
            expect_arity("confirmations", 1, &values)?;
            Ok(Command::Confirm(ConfirmRequest {
                reservation_id: parse_ulid(&values[0])?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "reservations" => Ok(Command::Cancel {
            id: extract_where_id(&delete.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
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
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "reservations" => match (filters.id, filters.resource_id) {
            (Some(id), _) => Ok(Command::SelectReservation { id }),
            (None, Some(resource_id)) => Ok(Command::SelectReservations { resource_id }),
            (None, None) => Err(SqlError::MissingFilter("id or resource_id")),
        },
        "ledger" => Ok(Command::SelectLedger {
            resource_id: filters.resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
            from: filters.from.ok_or(SqlError::MissingFilter("date >="))?,
            until: filters.until.ok_or(SqlError::MissingFilter("date <"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    resource_id: Option<Ulid>,
    /// Inclusive lower date bound.
    from: Option<NaiveDate>,
    /// Exclusive upper date bound.
    until: Option<NaiveDate>,
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => {
            if *op == BinaryOperator::And {
                collect_filters(left, filters)?;
                return collect_filters(right, filters);
            }
            let Some(col) = expr_column_name(left) else {
                return Ok(());
            };
            match (col.as_str(), op) {
                ("id", BinaryOperator::Eq) => filters.id = Some(parse_ulid(right)?),
                ("resource_id", BinaryOperator::Eq) => {
                    filters.resource_id = Some(parse_ulid(right)?)
                }
                ("date", BinaryOperator::GtEq) => filters.from = Some(parse_date(right)?),
                ("date", BinaryOperator::Gt) => filters.from = Some(next_day(parse_date(right)?)?),
                ("date", BinaryOperator::Lt) => filters.until = Some(parse_date(right)?),
                ("date", BinaryOperator::LtEq) => {
                    filters.until = Some(next_day(parse_date(right)?)?)
                }
                ("date", BinaryOperator::Eq) => {
                    let day = parse_date(right)?;
                    filters.from = Some(day);
                    filters.until = Some(next_day(day)?);
                }
                _ => {}
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn next_day(date: NaiveDate) -> Result<NaiveDate, SqlError> {
    date.succ_opt()
        .ok_or_else(|| SqlError::Parse(format!("date out of range: {date}")))
}

// ── Helpers ───────────────────────────────────────────────────

fn expect_arity(table: &'static str, expected: usize, values: &[Expr]) -> Result<(), SqlError> {
    if values.len() != expected {
        return Err(SqlError::WrongArity(table, expected, values.len()));
    }
    Ok(())
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

/// The single VALUES row of an INSERT. Multi-row inserts are rejected:
/// each reservation is its own transaction.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            rows => Err(SqlError::Unsupported(format!(
                "multi-row INSERT ({} rows)",
                rows.len()
            ))),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Filters::default();
    collect_filters(sel, &mut filters)?;
    filters.id.ok_or(SqlError::MissingFilter("id"))
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected 'YYYY-MM-DD', got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
