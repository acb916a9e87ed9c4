//! Database value parsing utilities
//!
//! Provides error-safe parsing of stored values.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Error as SqlError;
use uuid::Uuid;

use crate::models::{ConversationStatus, MessageKind, SenderRole};

/// Parse a UUID from a database string column
pub fn parse_uuid(s: &str) -> Result<Uuid, SqlError> {
    Uuid::parse_str(s)
        .map_err(|e| SqlError::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

/// Format a DateTime as fixed-width RFC3339 so stored values sort correctly
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a DateTime from an RFC3339 string
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, SqlError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SqlError::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn invalid_text(what: &str, value: &str) -> SqlError {
    SqlError::FromSqlConversionFailure(
        0,
        Type::Text,
        format!("invalid {}: {:?}", what, value).into(),
    )
}

pub fn parse_status(s: &str) -> Result<ConversationStatus, SqlError> {
    ConversationStatus::parse(s).ok_or_else(|| invalid_text("conversation status", s))
}

pub fn parse_role(s: &str) -> Result<SenderRole, SqlError> {
    SenderRole::parse(s).ok_or_else(|| invalid_text("sender role", s))
}

pub fn parse_kind(s: &str) -> Result<MessageKind, SqlError> {
    MessageKind::parse(s).ok_or_else(|| invalid_text("message type", s))
}

/// Parse an optional JSON column into `T`
pub fn parse_json_opt<T: serde::de::DeserializeOwned>(
    s: Option<String>,
) -> Result<Option<T>, SqlError> {
    s.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| SqlError::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Extension trait for converting rusqlite Results to Option
pub trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, SqlError>;
}

impl<T> OptionalExt<T> for Result<T, SqlError> {
    fn optional(self) -> Result<Option<T>, SqlError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(SqlError::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// True if the error is a UNIQUE / PRIMARY KEY constraint violation
pub fn is_unique_violation(err: &SqlError) -> bool {
    match err {
        SqlError::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && matches!(
                    e.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        }
        _ => false,
    }
}
