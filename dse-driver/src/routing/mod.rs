//! Routing of requests to the replicas owning their data.
//!
//! This includes:
//! - token representation,
//! - routing key composition out of partition key values,
//! - the Murmur3 partitioner, which computes a token from a routing key,
//! - the replica locator, which finds replicas for a token.

pub mod locator;
pub mod partitioner;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Token is a result of computing a hash of a partition key.
///
/// It is basically an i64 with one caveat: i64::MIN is not
/// a valid token. It is used to represent infinity.
/// For this reason tokens are normalized - i64::MIN
/// is replaced with i64::MAX.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Token {
    value: i64,
}

impl Token {
    /// Creates a new token with given value, normalizing the value if necessary
    #[inline]
    pub fn new(value: i64) -> Self {
        Self {
            value: if value == i64::MIN { i64::MAX } else { value },
        }
    }

    /// Raw token value.
    #[inline]
    pub fn value(&self) -> i64 {
        self.value
    }
}

/// A routing key could not be built from partition key values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RoutingKeyError {
    /// A component of a composite key must fit a u16 length.
    #[error("Partition key component is too long: {0} bytes, at most 65535 allowed")]
    ValueTooLong(usize),
    /// No components given.
    #[error("Routing key needs at least one component")]
    Empty,
}

/// Builds the routing key of a partition from its serialized partition key values,
/// given in partition key order.
///
/// A single-column key is used as is. A composite key is encoded as
/// `<u16 length><bytes><0x00>` per component, which is what the server hashes.
pub fn compose_routing_key<'a>(
    components: impl IntoIterator<Item = &'a [u8]>,
) -> Result<Bytes, RoutingKeyError> {
    let components: Vec<&[u8]> = components.into_iter().collect();
    match components.as_slice() {
        [] => Err(RoutingKeyError::Empty),
        [single] => Ok(Bytes::copy_from_slice(single)),
        many => {
            let mut key = BytesMut::with_capacity(many.iter().map(|c| c.len() + 3).sum());
            for component in many {
                let len: u16 = component
                    .len()
                    .try_into()
                    .map_err(|_| RoutingKeyError::ValueTooLong(component.len()))?;
                key.put_u16(len);
                key.put_slice(component);
                key.put_u8(0);
            }
            Ok(key.freeze())
        }
    }
}
