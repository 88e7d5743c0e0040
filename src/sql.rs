use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSpace {
        id: Ulid,
        name: String,
        kind: SpaceKind,
        capacity: u32,
        description: String,
        location: String,
        image_ref: Option<String>,
    },
    UpdateSpace {
        id: Ulid,
        patch: SpacePatch,
    },
    DeleteSpace {
        id: Ulid,
    },
    InsertUser {
        profile: UserProfile,
    },
    InsertReservation {
        space_id: Ulid,
        user_id: String,
        start: Ms,
    },
    ApproveReservation {
        id: Ulid,
    },
    RejectReservation {
        id: Ulid,
    },
    CancelReservation {
        id: Ulid,
    },
    RescheduleReservation {
        id: Ulid,
        start: Ms,
    },
    CheckIn {
        token: String,
    },
    InsertFeedback {
        program_id: Ulid,
        user_id: String,
        rating: u8,
        comment: Option<String>,
    },
    SelectSpaces,
    SelectReservations {
        user_id: Option<String>,
        space_id: Option<Ulid>,
        status: Option<ReservationStatus>,
    },
    SelectWaitlist {
        space_id: Ulid,
    },
    SelectFeedback {
        program_id: Ulid,
    },
    SelectStats {
        day: Option<String>,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("CHECKIN ") {
        let token = trimmed[8..]
            .trim()
            .trim_end_matches(';')
            .trim()
            .trim_matches('\'')
            .to_string();
        if token.is_empty() {
            return Err(SqlError::MissingFilter("token"));
        }
        return Ok(Command::CheckIn { token });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "spaces" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("spaces", 4, values.len()));
            }
            Ok(Command::InsertSpace {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                kind: parse_space_kind(&values[2])?,
                capacity: parse_u32(&values[3])?,
                description: if values.len() >= 5 {
                    parse_string(&values[4])?
                } else {
                    String::new()
                },
                location: if values.len() >= 6 {
                    parse_string(&values[5])?
                } else {
                    String::new()
                },
                image_ref: if values.len() >= 7 {
                    parse_string_or_null(&values[6])?
                } else {
                    None
                },
            })
        }
        "users" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("users", 1, 0));
            }
            Ok(Command::InsertUser {
                profile: UserProfile {
                    user_id: parse_string(&values[0])?,
                    device_token: if values.len() >= 2 {
                        parse_string_or_null(&values[1])?
                    } else {
                        None
                    },
                    email: if values.len() >= 3 {
                        parse_string_or_null(&values[2])?
                    } else {
                        None
                    },
                    display_name: if values.len() >= 4 {
                        parse_string_or_null(&values[3])?
                    } else {
                        None
                    },
                    admin: if values.len() >= 5 {
                        parse_bool(&values[4])?
                    } else {
                        false
                    },
                },
            })
        }
        "reservations" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("reservations", 3, values.len()));
            }
            Ok(Command::InsertReservation {
                space_id: parse_ulid(&values[0])?,
                user_id: parse_string(&values[1])?,
                start: parse_i64(&values[2])?,
            })
        }
        "feedback" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("feedback", 3, values.len()));
            }
            Ok(Command::InsertFeedback {
                program_id: parse_ulid(&values[0])?,
                user_id: parse_string(&values[1])?,
                rating: parse_u8(&values[2])?,
                comment: if values.len() >= 4 {
                    parse_string_or_null(&values[3])?
                } else {
                    None
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "reservations" => {
            if assignments.len() != 1 {
                return Err(SqlError::Unsupported(
                    "reservation updates set exactly one of status, start".into(),
                ));
            }
            let (col, value) = assignment_pair(&assignments[0])?;
            match col.as_str() {
                "status" => {
                    let status = parse_string(value)?;
                    match status.as_str() {
                        "approved" => Ok(Command::ApproveReservation { id }),
                        "rejected" => Ok(Command::RejectReservation { id }),
                        "cancelled" => Ok(Command::CancelReservation { id }),
                        // checked_in / no_show only move via CHECKIN and the sweeps
                        other => Err(SqlError::Unsupported(format!(
                            "cannot set reservation status to '{other}'"
                        ))),
                    }
                }
                "start" => Ok(Command::RescheduleReservation {
                    id,
                    start: parse_i64(value)?,
                }),
                other => Err(SqlError::Unsupported(format!(
                    "unknown reservation column: {other}"
                ))),
            }
        }
        "spaces" => {
            let mut patch = SpacePatch::default();
            for assignment in assignments {
                let (col, value) = assignment_pair(assignment)?;
                match col.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "kind" => patch.kind = Some(parse_space_kind(value)?),
                    "capacity" => patch.capacity = Some(parse_u32(value)?),
                    "description" => patch.description = Some(parse_string(value)?),
                    "location" => patch.location = Some(parse_string(value)?),
                    "image_ref" => patch.image_ref = parse_string_or_null(value)?,
                    other => {
                        return Err(SqlError::Unsupported(format!(
                            "unknown space column: {other}"
                        )));
                    }
                }
            }
            Ok(Command::UpdateSpace { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "spaces" => Ok(Command::DeleteSpace {
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

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "spaces" => Ok(Command::SelectSpaces),
        "reservations" => {
            let mut user_id = None;
            let mut space_id = None;
            let mut status = None;
            for (col, expr) in &filters {
                match col.as_str() {
                    "user_id" => user_id = Some(parse_string(expr)?),
                    "space_id" => space_id = Some(parse_ulid(expr)?),
                    "status" => {
                        let s = parse_string(expr)?;
                        status = Some(
                            ReservationStatus::parse(&s)
                                .ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                        );
                    }
                    other => {
                        return Err(SqlError::Unsupported(format!("unknown filter: {other}")));
                    }
                }
            }
            Ok(Command::SelectReservations {
                user_id,
                space_id,
                status,
            })
        }
        "waitlists" => {
            let space_id = filters
                .iter()
                .find(|(col, _)| col == "space_id")
                .map(|(_, expr)| parse_ulid(expr))
                .transpose()?
                .ok_or(SqlError::MissingFilter("space_id"))?;
            Ok(Command::SelectWaitlist { space_id })
        }
        "feedback" => {
            let program_id = filters
                .iter()
                .find(|(col, _)| col == "program_id")
                .map(|(_, expr)| parse_ulid(expr))
                .transpose()?
                .ok_or(SqlError::MissingFilter("program_id"))?;
            Ok(Command::SelectFeedback { program_id })
        }
        "stats" => {
            let day = filters
                .iter()
                .find(|(col, _)| col == "day")
                .map(|(_, expr)| parse_string(expr))
                .transpose()?;
            Ok(Command::SelectStats { day })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Walk an AND-tree of equality comparisons, collecting (column, value).
fn collect_eq_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)?;
                Ok(())
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse("expected column on left of =".into()))?;
                out.push((col, right));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter expression {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Vec::new();
    collect_eq_filters(sel, &mut filters)?;
    filters
        .iter()
        .find(|(col, _)| col == "id")
        .map(|(_, expr)| parse_ulid(expr))
        .transpose()?
        .ok_or(SqlError::MissingFilter("id"))
}

fn assignment_pair(assignment: &ast::Assignment) -> Result<(String, &Expr), SqlError> {
    let col = match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
        }
        _ => return Err(SqlError::Unsupported("tuple assignment".into())),
    };
    Ok((col, &assignment.value))
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
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_space_kind(expr: &Expr) -> Result<SpaceKind, SqlError> {
    let s = parse_string(expr)?;
    SpaceKind::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad space kind: {s}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
