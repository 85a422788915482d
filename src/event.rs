//! Positions in the source log and the row-change events read from it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in the source log: a segment (binlog file) name and a byte offset
/// inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub segment: String,
    pub offset: u64,
}

impl Position {
    pub fn new(segment: impl Into<String>, offset: u64) -> Self {
        Self {
            segment: segment.into(),
            offset,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// A position reported by the log reader.
///
/// `force` marks a boundary (rotation, schema change) that must reach the
/// checkpoint record before the next queued message is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionUpdate {
    pub position: Position,
    pub force: bool,
}

impl PositionUpdate {
    pub fn new(position: Position, force: bool) -> Self {
        Self { position, force }
    }

    pub fn forced(position: Position) -> Self {
        Self::new(position, true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for RowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowAction::Insert => write!(f, "insert"),
            RowAction::Update => write!(f, "update"),
            RowAction::Delete => write!(f, "delete"),
        }
    }
}

/// A decoded row-level change. Column values are carried opaquely and are
/// never inspected by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChangeEvent {
    pub schema: String,
    pub table: String,
    pub action: RowAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Vec<serde_json::Value>>,
    /// Epoch seconds of the source event.
    pub timestamp: u32,
}

impl RowChangeEvent {
    pub fn insert(
        schema: impl Into<String>,
        table: impl Into<String>,
        row: Vec<serde_json::Value>,
        timestamp: u32,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            action: RowAction::Insert,
            before: None,
            after: Some(row),
            timestamp,
        }
    }

    pub fn update(
        schema: impl Into<String>,
        table: impl Into<String>,
        before: Vec<serde_json::Value>,
        after: Vec<serde_json::Value>,
        timestamp: u32,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            action: RowAction::Update,
            before: Some(before),
            after: Some(after),
            timestamp,
        }
    }

    pub fn delete(
        schema: impl Into<String>,
        table: impl Into<String>,
        row: Vec<serde_json::Value>,
        timestamp: u32,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            action: RowAction::Delete,
            before: Some(row),
            after: None,
            timestamp,
        }
    }

    /// `schema.table`, used in log lines.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}
