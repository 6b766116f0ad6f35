use chrono::{DateTime, Weekday};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{CalendarChange, ChangeKind};
use crate::model::*;

/// Which bookings a `SELECT ... FROM bookings` asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    Id(Ulid),
    Reference(String),
    Consultant {
        consultant_id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
    },
}

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    UpsertConsultant {
        id: Ulid,
        timezone: String,
        buffer_minutes: Option<u32>,
        min_advance_hours: Option<u32>,
        max_advance_days: Option<u32>,
        calendar_id: Option<String>,
        name: Option<String>,
    },
    DeleteConsultant {
        id: Ulid,
    },
    SelectConsultants,
    /// One entry per `(consultant, weekday)` in the order first seen; each replaces that day.
    SetWorkingHours {
        days: Vec<(Ulid, Weekday, Vec<LocalRange>)>,
    },
    ClearWorkingHours {
        consultant_id: Ulid,
        weekday: Weekday,
    },
    InsertBlackout {
        id: Ulid,
        consultant_id: Ulid,
        start: Ms,
        end: Ms,
        kind: BlackoutKind,
        label: Option<String>,
    },
    DeleteBlackout {
        id: Ulid,
    },
    SetOffline {
        consultant_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SetOnline {
        consultant_id: Ulid,
    },
    SelectSlots {
        consultant_id: Ulid,
        start: Ms,
        end: Ms,
        duration: u32,
    },
    InsertBooking {
        id: Option<Ulid>,
        consultant_id: Ulid,
        start: Ms,
        duration: u32,
        client: ClientContact,
        origin: Actor,
        returning: bool,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    CancelBooking {
        id: Ulid,
        version: u64,
        actor: Actor,
        reason: Option<String>,
    },
    Reschedule {
        booking_id: Ulid,
        version: u64,
        start: Ms,
        duration: u32,
        actor: Actor,
        returning: bool,
    },
    NoShow {
        booking_id: Ulid,
        version: u64,
    },
    CalendarChange(CalendarChange),
    RecordSync {
        booking_id: Ulid,
        version: u64,
        state: SyncState,
        external_event_id: Option<String>,
        error: Option<String>,
    },
    SelectSyncBacklog {
        as_of: Ms,
    },
    SelectDueNotifications {
        as_of: Ms,
    },
    RunNotificationPass {
        as_of: Ms,
    },
    SelectReconciliation,
    ResolveReconciliation {
        booking_id: Ulid,
    },
    SelectBookingEvents {
        after: u64,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Static table name plus the column order assumed when an INSERT names no columns.
fn insert_table(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    let columns: &'static [&'static str] = match table {
        "consultants" => &[
            "id",
            "timezone",
            "buffer_minutes",
            "min_advance_hours",
            "max_advance_days",
            "calendar_id",
            "name",
        ],
        "working_hours" => &["consultant_id", "weekday", "start", "end"],
        "blackouts" => &["id", "consultant_id", "start", "end", "kind", "label"],
        "offline" => &["consultant_id", "start", "end"],
        "bookings" => &[
            "id",
            "consultant_id",
            "start",
            "duration",
            "client_name",
            "client_email",
            "client_timezone",
            "client_phone",
            "notes",
            "origin",
        ],
        "reschedules" => &["booking_id", "version", "start", "duration", "actor"],
        "no_shows" => &["booking_id", "version"],
        "calendar_changes" => &["external_event_id", "kind", "start", "end"],
        "sync_results" => &["booking_id", "version", "state", "external_event_id", "error"],
        _ => return None,
    };
    let name = match table {
        "consultants" => "consultants",
        "working_hours" => "working_hours",
        "blackouts" => "blackouts",
        "offline" => "offline",
        "bookings" => "bookings",
        "reschedules" => "reschedules",
        "no_shows" => "no_shows",
        "calendar_changes" => "calendar_changes",
        _ => "sync_results",
    };
    Some((name, columns))
}

/// One VALUES row addressed by column name.
struct Row<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl Row<'_> {
    fn get(&self, column: &str) -> Option<&Expr> {
        let i = self.columns.iter().position(|c| c == column)?;
        self.values.get(i)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    /// Value of an optional column; absent and NULL both read as `None`.
    fn optional<T>(
        &self,
        column: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.get(column) {
            None => Ok(None),
            Some(expr) if is_null(expr) => Ok(None),
            Some(expr) => parse(expr).map(Some),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let name = insert_table_name(insert)?;
    let (table, defaults) = insert_table(&name).ok_or(SqlError::UnknownTable(name))?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let all_rows = extract_all_insert_rows(insert)?;
    let mut rows = Vec::with_capacity(all_rows.len());
    for values in &all_rows {
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        rows.push(Row {
            table,
            columns: &columns,
            values,
        });
    }
    let returning = insert.returning.is_some();
    let single = || single_row(table, &rows);

    match table {
        "consultants" => {
            let row = single()?;
            Ok(Command::UpsertConsultant {
                id: parse_ulid(row.require("id")?)?,
                timezone: parse_string(row.require("timezone")?)?,
                buffer_minutes: row.optional("buffer_minutes", parse_u32)?,
                min_advance_hours: row.optional("min_advance_hours", parse_u32)?,
                max_advance_days: row.optional("max_advance_days", parse_u32)?,
                calendar_id: row.optional("calendar_id", parse_string)?,
                name: row.optional("name", parse_string)?,
            })
        }
        "working_hours" => {
            let mut days: Vec<(Ulid, Weekday, Vec<LocalRange>)> = Vec::new();
            for (i, row) in rows.iter().enumerate() {
                let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                let consultant_id = parse_ulid(row.require("consultant_id")?).map_err(at_row)?;
                let weekday = parse_weekday_expr(row.require("weekday")?).map_err(at_row)?;
                let start = parse_clock_expr(row.require("start")?).map_err(at_row)?;
                let end = parse_clock_expr(row.require("end")?).map_err(at_row)?;
                let range = LocalRange::new(start, end);
                match days
                    .iter_mut()
                    .find(|(c, d, _)| *c == consultant_id && *d == weekday)
                {
                    Some((_, _, ranges)) => ranges.push(range),
                    None => days.push((consultant_id, weekday, vec![range])),
                }
            }
            Ok(Command::SetWorkingHours { days })
        }
        "blackouts" => {
            let row = single()?;
            let kind = match row.optional("kind", parse_string)? {
                Some(k) => k.parse::<BlackoutKind>().map_err(SqlError::Parse)?,
                None => BlackoutKind::Block,
            };
            Ok(Command::InsertBlackout {
                id: parse_ulid(row.require("id")?)?,
                consultant_id: parse_ulid(row.require("consultant_id")?)?,
                start: parse_instant(row.require("start")?)?,
                end: parse_instant(row.require("end")?)?,
                kind,
                label: row.optional("label", parse_string)?,
            })
        }
        "offline" => {
            let row = single()?;
            Ok(Command::SetOffline {
                consultant_id: parse_ulid(row.require("consultant_id")?)?,
                start: parse_instant(row.require("start")?)?,
                end: parse_instant(row.require("end")?)?,
            })
        }
        "bookings" => {
            let row = single()?;
            let client = ClientContact {
                name: parse_string(row.require("client_name")?)?,
                email: parse_string(row.require("client_email")?)?,
                timezone: row
                    .optional("client_timezone", parse_string)?
                    .unwrap_or_else(|| "UTC".into()),
                phone: row.optional("client_phone", parse_string)?,
                notes: row.optional("notes", parse_string)?,
            };
            Ok(Command::InsertBooking {
                id: row.optional("id", parse_ulid)?,
                consultant_id: parse_ulid(row.require("consultant_id")?)?,
                start: parse_instant(row.require("start")?)?,
                duration: parse_u32(row.require("duration")?)?,
                client,
                origin: row.optional("origin", parse_actor)?.unwrap_or(Actor::Client),
                returning,
            })
        }
        "reschedules" => {
            let row = single()?;
            Ok(Command::Reschedule {
                booking_id: parse_ulid(row.require("booking_id")?)?,
                version: parse_u64(row.require("version")?)?,
                start: parse_instant(row.require("start")?)?,
                duration: parse_u32(row.require("duration")?)?,
                actor: row.optional("actor", parse_actor)?.unwrap_or(Actor::Client),
                returning,
            })
        }
        "no_shows" => {
            let row = single()?;
            Ok(Command::NoShow {
                booking_id: parse_ulid(row.require("booking_id")?)?,
                version: parse_u64(row.require("version")?)?,
            })
        }
        "calendar_changes" => {
            let row = single()?;
            let kind = match parse_string(row.require("kind")?)?.to_lowercase().as_str() {
                "moved" => ChangeKind::Moved {
                    start: parse_instant(row.require("start")?)?,
                    end: parse_instant(row.require("end")?)?,
                },
                "deleted" => ChangeKind::Deleted,
                "absent" => ChangeKind::Absent,
                other => {
                    return Err(SqlError::Parse(format!("unknown calendar change kind: {other}")));
                }
            };
            Ok(Command::CalendarChange(CalendarChange {
                external_event_id: parse_string(row.require("external_event_id")?)?,
                kind,
            }))
        }
        "sync_results" => {
            let row = single()?;
            Ok(Command::RecordSync {
                booking_id: parse_ulid(row.require("booking_id")?)?,
                version: parse_u64(row.require("version")?)?,
                state: parse_sync_state(row.require("state")?)?,
                external_event_id: row.optional("external_event_id", parse_string)?,
                error: row.optional("error", parse_string)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn single_row<'r, 'a>(table: &str, rows: &'r [Row<'a>]) -> Result<&'r Row<'a>, SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!("{table}: one row per INSERT"))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "consultants" => Ok(Command::DeleteConsultant {
            id: filters.require_ulid("id")?,
        }),
        "working_hours" => Ok(Command::ClearWorkingHours {
            consultant_id: filters.require_ulid("consultant_id")?,
            weekday: parse_weekday_expr(filters.require_eq("weekday")?)?,
        }),
        "blackouts" => Ok(Command::DeleteBlackout {
            id: filters.require_ulid("id")?,
        }),
        "offline" => Ok(Command::SetOnline {
            consultant_id: filters.require_ulid("consultant_id")?,
        }),
        "bookings" => Ok(Command::CancelBooking {
            id: filters.require_ulid("id")?,
            version: parse_u64(filters.require_eq("version")?)?,
            actor: match filters.eq("actor") {
                Some(e) => parse_actor(e)?,
                None => Actor::Client,
            },
            reason: filters.eq("reason").map(parse_string).transpose()?,
        }),
        "reconciliation" => Ok(Command::ResolveReconciliation {
            booking_id: filters.require_ulid("booking_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            consultant_id: filters.require_ulid("consultant_id")?,
            start: parse_instant(filters.ge("start").ok_or(SqlError::MissingFilter("start"))?)?,
            end: parse_instant(filters.le("end").ok_or(SqlError::MissingFilter("end"))?)?,
            duration: parse_u32(filters.require_eq("duration")?)?,
        }),
        "bookings" => {
            let filter = if let Some(id) = filters.eq("id") {
                BookingFilter::Id(parse_ulid(id)?)
            } else if let Some(reference) = filters.eq("reference") {
                BookingFilter::Reference(parse_string(reference)?)
            } else if let Some(cid) = filters.eq("consultant_id") {
                BookingFilter::Consultant {
                    consultant_id: parse_ulid(cid)?,
                    start: filters.ge("start").map(parse_instant).transpose()?,
                    end: filters.le("end").map(parse_instant).transpose()?,
                }
            } else {
                return Err(SqlError::MissingFilter("id, reference or consultant_id"));
            };
            Ok(Command::SelectBookings { filter })
        }
        "consultants" => Ok(Command::SelectConsultants),
        "due_notifications" => Ok(Command::SelectDueNotifications {
            as_of: parse_instant(filters.require_eq("as_of")?)?,
        }),
        "notification_pass" => Ok(Command::RunNotificationPass {
            as_of: parse_instant(filters.require_eq("as_of")?)?,
        }),
        "sync_backlog" => Ok(Command::SelectSyncBacklog {
            as_of: parse_instant(filters.require_eq("as_of")?)?,
        }),
        "reconciliation" => Ok(Command::SelectReconciliation),
        "booking_events" => Ok(Command::SelectBookingEvents {
            after: match filters.gt("seq") {
                Some(e) => parse_u64(e)?,
                None => 0,
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunction of simple `column op value` predicates.
#[derive(Default)]
struct Filters<'a> {
    eq: Vec<(String, &'a Expr)>,
    ge: Vec<(String, &'a Expr)>,
    le: Vec<(String, &'a Expr)>,
    gt: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                if *op == ast::BinaryOperator::And {
                    self.collect(left)?;
                    return self.collect(right);
                }
                let Some(col) = expr_column_name(left) else {
                    return Err(SqlError::Unsupported(format!("predicate {expr}")));
                };
                match op {
                    ast::BinaryOperator::Eq => self.eq.push((col, &**right)),
                    ast::BinaryOperator::GtEq => self.ge.push((col, &**right)),
                    ast::BinaryOperator::LtEq => self.le.push((col, &**right)),
                    ast::BinaryOperator::Gt => self.gt.push((col, &**right)),
                    _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
                }
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("predicate {expr}"))),
        }
    }

    fn find(list: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
        list.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        Self::find(&self.eq, column)
    }

    fn ge(&self, column: &str) -> Option<&'a Expr> {
        Self::find(&self.ge, column)
    }

    fn le(&self, column: &str) -> Option<&'a Expr> {
        Self::find(&self.le, column)
    }

    fn gt(&self, column: &str) -> Option<&'a Expr> {
        Self::find(&self.gt, column)
    }

    fn require_eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.eq(column).ok_or(SqlError::MissingFilter(column))
    }

    fn require_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.require_eq(column)?)
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > crate::limits::MAX_BATCH_SIZE {
                return Err(SqlError::Parse(format!(
                    "at most {} rows per INSERT",
                    crate::limits::MAX_BATCH_SIZE
                )));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
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

/// Unix milliseconds, or an RFC 3339 string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u64 range")))
}

fn parse_weekday_expr(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = parse_string(expr)?;
    parse_weekday(&s).ok_or_else(|| SqlError::Parse(format!("bad weekday: {s}")))
}

fn parse_clock_expr(expr: &Expr) -> Result<u16, SqlError> {
    let s = parse_string(expr)?;
    parse_clock(&s).ok_or_else(|| SqlError::Parse(format!("bad time of day: {s}")))
}

fn parse_actor(expr: &Expr) -> Result<Actor, SqlError> {
    match parse_string(expr)?.to_lowercase().as_str() {
        "client" => Ok(Actor::Client),
        "admin" => Ok(Actor::Admin),
        other => Err(SqlError::Parse(format!("actor must be client or admin, got {other}"))),
    }
}

fn parse_sync_state(expr: &Expr) -> Result<SyncState, SqlError> {
    match parse_string(expr)?.to_lowercase().as_str() {
        "unsynced" => Ok(SyncState::Unsynced),
        "synced" => Ok(SyncState::Synced),
        "sync_failed" => Ok(SyncState::SyncFailed),
        other => Err(SqlError::Parse(format!("bad sync state: {other}"))),
    }
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
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const CID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const BID: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_upsert_consultant_with_defaults() {
        let sql = format!("INSERT INTO consultants (id, timezone) VALUES ('{CID}', 'Europe/Berlin')");
        match parse_sql(&sql).unwrap() {
            Command::UpsertConsultant {
                id,
                timezone,
                buffer_minutes,
                calendar_id,
                ..
            } => {
                assert_eq!(id.to_string(), CID);
                assert_eq!(timezone, "Europe/Berlin");
                assert_eq!(buffer_minutes, None);
                assert_eq!(calendar_id, None);
            }
            cmd => panic!("expected UpsertConsultant, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_upsert_consultant_positional() {
        let sql = format!(
            "INSERT INTO consultants VALUES ('{CID}', 'UTC', 15, 24, 30, 'cal-1', 'Dr. Ines')"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpsertConsultant {
                buffer_minutes,
                min_advance_hours,
                max_advance_days,
                calendar_id,
                name,
                ..
            } => {
                assert_eq!(buffer_minutes, Some(15));
                assert_eq!(min_advance_hours, Some(24));
                assert_eq!(max_advance_days, Some(30));
                assert_eq!(calendar_id.as_deref(), Some("cal-1"));
                assert_eq!(name.as_deref(), Some("Dr. Ines"));
            }
            cmd => panic!("expected UpsertConsultant, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_working_hours_groups_rows_by_day() {
        let sql = format!(
            r#"INSERT INTO working_hours (consultant_id, weekday, start, "end") VALUES
               ('{CID}', 'mon', '09:00', '12:00'),
               ('{CID}', 'mon', '13:00', '17:00'),
               ('{CID}', 'tue', '10:00', '24:00')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SetWorkingHours { days } => {
                assert_eq!(days.len(), 2);
                assert_eq!(days[0].1, Weekday::Mon);
                assert_eq!(
                    days[0].2,
                    vec![LocalRange::new(540, 720), LocalRange::new(780, 1020)]
                );
                assert_eq!(days[1].2, vec![LocalRange::new(600, 1440)]);
            }
            cmd => panic!("expected SetWorkingHours, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_clear_working_hours() {
        let sql = format!("DELETE FROM working_hours WHERE consultant_id = '{CID}' AND weekday = 'fri'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::ClearWorkingHours {
                consultant_id: CID.parse().unwrap(),
                weekday: Weekday::Fri,
            }
        );
    }

    #[test]
    fn parse_blackout_accepts_rfc3339() {
        let sql = format!(
            r#"INSERT INTO blackouts (id, consultant_id, start, "end", kind, label) VALUES ('{BID}', '{CID}', '2026-12-24T00:00:00Z', '2026-12-27T00:00:00Z', 'holiday', 'Christmas')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBlackout {
                start, end, kind, label, ..
            } => {
                assert_eq!(start, 1_798_070_400_000);
                assert_eq!(end - start, 3 * DAY_MS);
                assert_eq!(kind, BlackoutKind::Holiday);
                assert_eq!(label.as_deref(), Some("Christmas"));
            }
            cmd => panic!("expected InsertBlackout, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_offline_and_online() {
        let sql = format!(r#"INSERT INTO offline (consultant_id, start, "end") VALUES ('{CID}', 1000, 2000)"#);
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SetOffline { start: 1000, end: 2000, .. }
        ));
        let sql = format!("DELETE FROM offline WHERE consultant_id = '{CID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SetOnline { .. }));
    }

    #[test]
    fn parse_select_slots() {
        let sql = format!(
            r#"SELECT * FROM slots WHERE consultant_id = '{CID}' AND start >= 1000 AND "end" <= 2000 AND duration = 60"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSlots {
                consultant_id: CID.parse().unwrap(),
                start: 1000,
                end: 2000,
                duration: 60,
            }
        );
    }

    #[test]
    fn select_slots_requires_duration() {
        let sql = format!(r#"SELECT * FROM slots WHERE consultant_id = '{CID}' AND start >= 1000 AND "end" <= 2000"#);
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingFilter("duration"))
        ));
    }

    #[test]
    fn parse_insert_booking_with_returning() {
        let sql = format!(
            "INSERT INTO bookings (consultant_id, start, duration, client_name, client_email, client_timezone) \
             VALUES ('{CID}', 1800000000000, 45, 'Yara', 'yara@example.com', 'Asia/Tokyo') RETURNING *"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking {
                id,
                duration,
                client,
                origin,
                returning,
                ..
            } => {
                assert_eq!(id, None);
                assert_eq!(duration, 45);
                assert_eq!(client.timezone, "Asia/Tokyo");
                assert_eq!(client.phone, None);
                assert_eq!(origin, Actor::Client);
                assert!(returning);
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn booking_insert_missing_email_is_an_error() {
        let sql = format!(
            "INSERT INTO bookings (consultant_id, start, duration, client_name) VALUES ('{CID}', 1, 30, 'Yara')"
        );
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("bookings", "client_email"))
        ));
    }

    #[test]
    fn parse_cancel_requires_version() {
        let sql = format!("DELETE FROM bookings WHERE id = '{BID}'");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingFilter("version"))
        ));
        let sql = format!("DELETE FROM bookings WHERE id = '{BID}' AND version = 3 AND actor = 'admin'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CancelBooking {
                id: BID.parse().unwrap(),
                version: 3,
                actor: Actor::Admin,
                reason: None,
            }
        );
    }

    #[test]
    fn parse_booking_filters() {
        let by_ref = parse_sql("SELECT * FROM bookings WHERE reference = 'BK-ABCDEFGH'").unwrap();
        assert_eq!(
            by_ref,
            Command::SelectBookings {
                filter: BookingFilter::Reference("BK-ABCDEFGH".into())
            }
        );
        let sql = format!(r#"SELECT * FROM bookings WHERE consultant_id = '{CID}' AND start >= 5"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::Consultant {
                    consultant_id: CID.parse().unwrap(),
                    start: Some(5),
                    end: None,
                }
            }
        );
        assert!(parse_sql("SELECT * FROM bookings").is_err());
    }

    #[test]
    fn parse_reschedule_and_no_show() {
        let sql = format!(
            "INSERT INTO reschedules (booking_id, version, start, duration) VALUES ('{BID}', 1, 1800000000000, 60)"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::Reschedule {
                version: 1,
                duration: 60,
                actor: Actor::Client,
                returning: false,
                ..
            }
        ));
        let sql = format!("INSERT INTO no_shows VALUES ('{BID}', 2)");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::NoShow { version: 2, .. }
        ));
    }

    #[test]
    fn parse_calendar_changes() {
        let moved = r#"INSERT INTO calendar_changes (external_event_id, kind, start, "end") VALUES ('evt-9', 'moved', 100, 200)"#;
        assert_eq!(
            parse_sql(moved).unwrap(),
            Command::CalendarChange(CalendarChange {
                external_event_id: "evt-9".into(),
                kind: ChangeKind::Moved { start: 100, end: 200 },
            })
        );
        let deleted = "INSERT INTO calendar_changes (external_event_id, kind) VALUES ('evt-9', 'deleted')";
        assert!(matches!(
            parse_sql(deleted).unwrap(),
            Command::CalendarChange(CalendarChange {
                kind: ChangeKind::Deleted,
                ..
            })
        ));
        let bogus = "INSERT INTO calendar_changes (external_event_id, kind) VALUES ('evt-9', 'exploded')";
        assert!(parse_sql(bogus).is_err());
    }

    #[test]
    fn parse_notification_tables() {
        assert_eq!(
            parse_sql("SELECT * FROM due_notifications WHERE as_of = 42").unwrap(),
            Command::SelectDueNotifications { as_of: 42 }
        );
        assert_eq!(
            parse_sql("SELECT * FROM notification_pass WHERE as_of = 42").unwrap(),
            Command::RunNotificationPass { as_of: 42 }
        );
        assert_eq!(
            parse_sql("SELECT * FROM booking_events WHERE seq > 17").unwrap(),
            Command::SelectBookingEvents { after: 17 }
        );
        assert_eq!(
            parse_sql("SELECT * FROM reconciliation").unwrap(),
            Command::SelectReconciliation
        );
    }

    #[test]
    fn wrong_arity_is_reported() {
        let sql = format!("INSERT INTO no_shows VALUES ('{BID}')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::WrongArity("no_shows", 2, 1))
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO resources (id) VALUES ('{CID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
