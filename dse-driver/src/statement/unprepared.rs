//! Defines the [`Statement`] type, which represents an unprepared CQL statement.

use std::borrow::Cow;

use bytes::Bytes;

use super::{RoutableStatement, StatementConfig};
use crate::frame::request::query::QueryParameters;
use crate::frame::types::{Consistency, SerialConsistency};
use crate::frame::value::{SerializeValue, SerializeValuesError, SerializedValues};
use crate::routing::{compose_routing_key, RoutingKeyError};

/// **Unprepared** CQL statement.
///
/// The text is sent as is in a QUERY request, together with the bound values.
/// The driver cannot tell which values form the partition key of an unprepared
/// statement, so a routing key must be supplied explicitly for token-aware routing.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) config: StatementConfig,

    /// The CQL statement text.
    pub contents: String,
    keyspace: Option<String>,
    routing_key: Option<Bytes>,
    values: SerializedValues,
}

impl Statement {
    /// Creates a new [`Statement`] from a CQL statement string.
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            contents: query_text.into(),
            config: Default::default(),
            keyspace: None,
            routing_key: None,
            values: SerializedValues::new(),
        }
    }

    /// Keyspace used for routing. It does not change the keyspace the
    /// statement is executed in, which is given by the text or by `USE`.
    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    /// Sets the serialized partition key used for routing.
    pub fn with_routing_key(mut self, routing_key: impl Into<Bytes>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Builds the routing key out of serialized partition key components,
    /// in partition key order.
    pub fn set_routing_key_components<'a>(
        &mut self,
        components: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<(), RoutingKeyError> {
        self.routing_key = Some(compose_routing_key(components)?);
        Ok(())
    }

    /// Binds the next `?` marker.
    pub fn bind_value<T: SerializeValue + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<(), SerializeValuesError> {
        self.values.add_value(value)
    }

    /// Replaces all bound values.
    pub fn with_values(mut self, values: SerializedValues) -> Self {
        self.values = values;
        self
    }

    /// Values sent along with the query.
    pub fn values(&self) -> &SerializedValues {
        &self.values
    }

    /// Sets the consistency to be used when executing this statement.
    pub fn set_consistency(&mut self, c: Consistency) {
        self.config.consistency = Some(c);
    }

    /// Gets the consistency overridden on this statement, if any.
    pub fn get_consistency(&self) -> Option<Consistency> {
        self.config.consistency
    }

    /// Sets the serial consistency to be used when executing this statement.
    /// (Ignored unless the statement is an LWT)
    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = sc;
    }

    /// Gets the serial consistency overridden on this statement, if any.
    pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
        self.config.serial_consistency
    }

    /// Enable or disable CQL Tracing for this statement.
    /// The tracing id is then returned in [QueryResponse::tracing_id](crate::QueryResponse::tracing_id).
    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    /// Whether CQL Tracing is enabled for this statement.
    pub fn get_tracing(&self) -> bool {
        self.config.tracing
    }

    /// Sets the default timestamp for this statement in microseconds.
    /// Requires protocol v3 or newer.
    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp;
    }

    /// Gets the default timestamp for this statement, if any.
    pub fn get_timestamp(&self) -> Option<i64> {
        self.config.timestamp
    }

    /// Sets the page size. Non-positive values disable paging.
    pub fn set_page_size(&mut self, page_size: i32) {
        self.config.page_size = (page_size > 0).then_some(page_size);
    }

    /// Gets the page size, if paging is enabled.
    pub fn get_page_size(&self) -> Option<i32> {
        self.config.page_size
    }

    pub(crate) fn parameters(&self) -> QueryParameters<'_> {
        QueryParameters {
            consistency: self.config.determine_consistency(Consistency::default()),
            serial_consistency: self.config.serial_consistency,
            timestamp: self.config.timestamp,
            page_size: self.config.page_size,
            paging_state: None,
            skip_metadata: false,
            values: Cow::Borrowed(&self.values),
        }
    }
}

impl RoutableStatement for Statement {
    fn routing_key(&self) -> Option<&[u8]> {
        self.routing_key.as_deref()
    }

    fn keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }
}

impl From<String> for Statement {
    fn from(s: String) -> Statement {
        Statement::new(s)
    }
}

impl<'a> From<&'a str> for Statement {
    fn from(s: &'a str) -> Statement {
        Statement::new(s.to_owned())
    }
}
