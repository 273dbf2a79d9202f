//! Async connection and routing core for DSE and Apache Cassandra®, speaking the CQL
//! native protocol (v2 to v4).
//!
//! # Overview
//! The crate has two halves that meet on the request path:
//!
//! * [Connection](network::Connection) multiplexes many concurrent requests over
//!   a single socket. Every request borrows a stream id from a per-connection
//!   [StreamTable](network::StreamTable); responses are matched back purely by
//!   stream id, so they may complete in any order. Server-pushed events are
//!   delivered to any number of subscribers.
//! * [TokenAwarePolicy](policies::load_balancing::TokenAwarePolicy) decorates
//!   another [LoadBalancingPolicy](policies::load_balancing::LoadBalancingPolicy)
//!   and puts the local replicas owning a statement's partition at the front of
//!   the query plan.
//!
//! ```rust,no_run
//! use dse_driver::network::{Connection, ConnectionConfig};
//! use dse_driver::statement::Statement;
//! use std::error::Error;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let connection = Connection::new("127.0.0.1:9042".parse()?, ConnectionConfig::default());
//!     let _error_receiver = connection.init().await?;
//!
//!     connection.set_keyspace("system", false).await?;
//!     let rows = connection
//!         .query(&Statement::new("SELECT keyspace_name FROM schema_keyspaces"))
//!         .await?
//!         .into_rows()?;
//!     println!("{} keyspaces", rows.rows_count);
//!
//!     connection.close();
//!     Ok(())
//! }
//! ```

pub mod frame {
    //! Protocol-level types re-exported from `dse-cql`.
    pub use dse_cql::frame::{
        frame_errors, request, server_event_type, value, Compression, FrameCodec,
        ProtocolVersion,
    };
    pub(crate) use dse_cql::frame::FrameParams;

    pub mod types {
        //! Consistency levels.
        pub use dse_cql::frame::types::{Consistency, SerialConsistency};
    }

    pub mod response {
        //! Typed response bodies.
        pub use dse_cql::frame::response::error::{DbError, WriteType};
        pub use dse_cql::frame::response::event;
        pub use dse_cql::frame::response::result;
        pub use dse_cql::frame::response::{Response, ResponseOpcode, Supported};
    }
}

pub mod authentication;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod policies;
pub mod response;
pub mod routing;
pub mod statement;

pub(crate) mod utils;

pub use cluster::{ClusterTopology, Host, HostDistance, ReplicaSet};
pub use network::{Connection, ConnectionConfig};
pub use policies::load_balancing::{LoadBalancingPolicy, TokenAwarePolicy};
pub use response::QueryResponse;
pub use statement::{BoundStatement, PreparedStatement, RoutableStatement, Statement};
