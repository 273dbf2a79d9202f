//! Statements: unprepared CQL text, prepared statements and their bound form.
//!
//! Both [Statement] and [BoundStatement] implement [RoutableStatement], which is
//! all a load balancing policy needs to know about a request.

mod prepared;
mod unprepared;

pub use prepared::{BindError, BoundStatement, PreparedStatement};
pub use unprepared::Statement;

pub use crate::frame::types::{Consistency, SerialConsistency};

/// What routing needs to know about a statement.
pub trait RoutableStatement {
    /// Serialized partition key of the statement, if known.
    /// Statements without one are not routed to replicas.
    fn routing_key(&self) -> Option<&[u8]>;

    /// Keyspace the statement operates on, if known. It overrides the
    /// keyspace of the connection or session for routing purposes.
    fn keyspace(&self) -> Option<&str>;
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    pub(crate) serial_consistency: Option<SerialConsistency>,
    pub(crate) tracing: bool,
    pub(crate) timestamp: Option<i64>,
    pub(crate) page_size: Option<i32>,
}

impl StatementConfig {
    /// Determines the consistency of a query
    #[must_use]
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }
}
