//! Statements prepared on the server and their bound instances.

use std::borrow::Cow;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use super::{RoutableStatement, StatementConfig};
use crate::frame::request::query::QueryParameters;
use crate::frame::response::result::{Prepared, PreparedMetadata, ResultMetadata};
use crate::frame::types::{Consistency, SerialConsistency};
use crate::frame::value::{RawValue, SerializedValues};
use crate::routing::{compose_routing_key, RoutingKeyError};

/// Represents a statement prepared on the server.
///
/// Cloning is cheap: metadata is shared between clones.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub(crate) config: StatementConfig,

    id: Bytes,
    statement: Arc<str>,
    prepared_metadata: Arc<PreparedMetadata>,
    result_metadata: Option<Arc<ResultMetadata>>,
    keyspace: Option<String>,
}

impl PreparedStatement {
    pub(crate) fn new(statement: &str, prepared: Prepared) -> Self {
        // Every bind marker of a statement belongs to the same keyspace.
        let keyspace = prepared
            .prepared_metadata
            .col_specs
            .first()
            .map(|spec| spec.table_spec.ks_name.clone());

        Self {
            config: StatementConfig::default(),
            id: prepared.id,
            statement: statement.into(),
            prepared_metadata: Arc::new(prepared.prepared_metadata),
            result_metadata: prepared.result_metadata.map(Arc::new),
            keyspace,
        }
    }

    /// Id of the statement assigned by the server.
    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    /// CQL text the statement was prepared from.
    pub fn get_statement(&self) -> &str {
        &self.statement
    }

    /// Metadata of the bind markers.
    pub fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.prepared_metadata
    }

    /// Metadata of the result set. Servers speaking v2 do not send it.
    pub fn get_result_metadata(&self) -> Option<&ResultMetadata> {
        self.result_metadata.as_deref()
    }

    /// Keyspace of the prepared statement, taken from its bind markers.
    pub fn get_keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
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
    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = sc;
    }

    /// Enable or disable CQL Tracing for this statement.
    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    /// Sets the default timestamp for this statement in microseconds.
    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp;
    }

    /// Sets the page size. Non-positive values disable paging.
    pub fn set_page_size(&mut self, page_size: i32) {
        self.config.page_size = (page_size > 0).then_some(page_size);
    }

    /// Binds values to the statement's markers.
    ///
    /// The routing key is computed from the values at the partition key
    /// indexes sent by the server (protocol v4). It is absent if the server
    /// sent none or if any partition key value is null or unset.
    pub fn bind(&self, values: SerializedValues) -> Result<BoundStatement, BindError> {
        let expected = self.prepared_metadata.col_count;
        let actual = values.len() as usize;
        if expected != actual {
            return Err(BindError::WrongValueCount { expected, actual });
        }

        let routing_key = self.compute_routing_key(&values)?;
        Ok(BoundStatement {
            prepared: self.clone(),
            values,
            routing_key,
        })
    }

    fn compute_routing_key(
        &self,
        values: &SerializedValues,
    ) -> Result<Option<Bytes>, BindError> {
        let pk_indexes = &self.prepared_metadata.pk_indexes;
        if pk_indexes.is_empty() {
            return Ok(None);
        }

        let raw: Vec<RawValue<'_>> = values.iter().collect();
        let mut components: Vec<(u16, &[u8])> = Vec::with_capacity(pk_indexes.len());
        for pk_index in pk_indexes {
            match raw.get(pk_index.index as usize).and_then(RawValue::as_value) {
                Some(value) => components.push((pk_index.sequence, value)),
                None => return Ok(None),
            }
        }
        components.sort_unstable_by_key(|(sequence, _)| *sequence);

        let key = compose_routing_key(components.into_iter().map(|(_, value)| value))?;
        Ok(Some(key))
    }
}

/// Values could not be bound to a prepared statement.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BindError {
    /// The statement has a different number of bind markers.
    #[error("Prepared statement expects {expected} values, got {actual}")]
    WrongValueCount { expected: usize, actual: usize },

    /// Partition key values could not form a routing key.
    #[error(transparent)]
    RoutingKey(#[from] RoutingKeyError),
}

/// A prepared statement together with its values, ready to be executed.
#[derive(Debug, Clone)]
pub struct BoundStatement {
    prepared: PreparedStatement,
    values: SerializedValues,
    routing_key: Option<Bytes>,
}

impl BoundStatement {
    /// Statement the values were bound to.
    pub fn prepared(&self) -> &PreparedStatement {
        &self.prepared
    }

    /// Bound values, in bind marker order.
    pub fn values(&self) -> &SerializedValues {
        &self.values
    }

    pub(crate) fn parameters(&self) -> QueryParameters<'_> {
        let config = &self.prepared.config;
        QueryParameters {
            consistency: config.determine_consistency(Consistency::default()),
            serial_consistency: config.serial_consistency,
            timestamp: config.timestamp,
            page_size: config.page_size,
            paging_state: None,
            skip_metadata: false,
            values: Cow::Borrowed(&self.values),
        }
    }
}

impl RoutableStatement for BoundStatement {
    fn routing_key(&self) -> Option<&[u8]> {
        self.routing_key.as_deref()
    }

    fn keyspace(&self) -> Option<&str> {
        self.prepared.get_keyspace()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::response::result::{ColumnSpec, ColumnType, PartitionKeyIndex, TableSpec};
    use assert_matches::assert_matches;

    fn col(name: &str) -> ColumnSpec {
        ColumnSpec {
            table_spec: TableSpec {
                ks_name: "ks".to_owned(),
                table_name: "t".to_owned(),
            },
            name: name.to_owned(),
            typ: ColumnType::Int,
        }
    }

    // `INSERT INTO ks.t (c, pk2, pk1) VALUES (?, ?, ?)` with PRIMARY KEY ((pk1, pk2), c)
    fn prepared(pk_indexes: Vec<PartitionKeyIndex>) -> PreparedStatement {
        PreparedStatement::new(
            "INSERT INTO ks.t (c, pk2, pk1) VALUES (?, ?, ?)",
            Prepared {
                id: Bytes::from_static(b"id"),
                prepared_metadata: PreparedMetadata {
                    col_count: 3,
                    pk_indexes,
                    col_specs: vec![col("c"), col("pk2"), col("pk1")],
                },
                result_metadata: None,
            },
        )
    }

    fn values(c: Option<i32>, pk2: Option<i32>, pk1: Option<i32>) -> SerializedValues {
        let mut values = SerializedValues::new();
        for v in [c, pk2, pk1] {
            values.add_value(&v).unwrap();
        }
        values
    }

    #[test]
    fn routing_key_follows_partition_key_order() {
        let statement = prepared(vec![
            PartitionKeyIndex {
                index: 2,
                sequence: 0,
            },
            PartitionKeyIndex {
                index: 1,
                sequence: 1,
            },
        ]);
        assert_eq!(statement.get_keyspace(), Some("ks"));

        let bound = statement.bind(values(Some(9), Some(2), Some(1))).unwrap();
        let expected = compose_routing_key([&1_i32.to_be_bytes()[..], &2_i32.to_be_bytes()[..]])
            .unwrap();
        assert_eq!(bound.routing_key(), Some(&expected[..]));
        assert_eq!(bound.keyspace(), Some("ks"));
    }

    #[test]
    fn missing_routing_key() {
        let single = prepared(vec![PartitionKeyIndex {
            index: 2,
            sequence: 0,
        }]);
        let bound = single.bind(values(None, None, Some(5))).unwrap();
        assert_eq!(bound.routing_key(), Some(&5_i32.to_be_bytes()[..]));

        // A null partition key value cannot be routed.
        let bound = single.bind(values(Some(1), Some(2), None)).unwrap();
        assert_eq!(bound.routing_key(), None);

        // v3 servers send no partition key indexes.
        let bound = prepared(vec![]).bind(values(Some(1), Some(2), Some(3))).unwrap();
        assert_eq!(bound.routing_key(), None);
    }

    #[test]
    fn wrong_number_of_values() {
        let statement = prepared(vec![]);
        let mut too_few = SerializedValues::new();
        too_few.add_value(&1_i32).unwrap();
        assert_matches!(
            statement.bind(too_few),
            Err(BindError::WrongValueCount {
                expected: 3,
                actual: 1
            })
        );
    }
}
