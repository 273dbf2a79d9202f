//! Decoded response of a single request, together with its frame envelope.

use std::collections::HashMap;

use bytes::Bytes;
use dse_cql::frame::request::RequestOpcode;
use dse_cql::frame::response::result::{self, Prepared, Rows};
use dse_cql::frame::response::Response;
use dse_cql::frame::ResponseExtensions;
use uuid::Uuid;

use crate::errors::RequestError;

/// A non-error response, with the tracing id, warnings and custom payload
/// the server attached to it.
///
/// ERROR responses never reach this type: they resolve the request as
/// [RequestError::DbError].
#[derive(Debug, Clone)]
pub struct QueryResponse {
    /// The decoded body.
    pub response: Response,
    /// Present if tracing was requested for this request.
    pub tracing_id: Option<Uuid>,
    /// Warnings generated by the server while handling the request.
    pub warnings: Vec<String>,
    /// Custom payload (v4).
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

impl QueryResponse {
    #[cfg(test)]
    pub(crate) fn new(response: Response) -> Self {
        Self::with_extensions(response, ResponseExtensions::default())
    }

    pub(crate) fn with_extensions(response: Response, extensions: ResponseExtensions) -> Self {
        Self {
            response,
            tracing_id: extensions.trace_id,
            warnings: extensions.warnings,
            custom_payload: extensions.custom_payload,
        }
    }

    /// Extracts the RESULT body, which is the answer to QUERY, EXECUTE and PREPARE.
    pub fn into_result(self, request: RequestOpcode) -> Result<result::Result, RequestError> {
        match self.response {
            Response::Result(result) => Ok(result),
            other => Err(RequestError::UnexpectedResponse {
                request,
                response: other.opcode(),
            }),
        }
    }

    /// Extracts a rows result of a QUERY.
    pub fn into_rows(self) -> Result<Rows, RequestError> {
        match self.into_result(RequestOpcode::Query)? {
            result::Result::Rows(rows) => Ok(rows),
            _ => Err(RequestError::UnexpectedResponse {
                request: RequestOpcode::Query,
                response: dse_cql::frame::response::ResponseOpcode::Result,
            }),
        }
    }

    pub(crate) fn into_prepared(self) -> Result<Prepared, RequestError> {
        match self.into_result(RequestOpcode::Prepare)? {
            result::Result::Prepared(prepared) => Ok(prepared),
            _ => Err(RequestError::UnexpectedResponse {
                request: RequestOpcode::Prepare,
                response: dse_cql::frame::response::ResponseOpcode::Result,
            }),
        }
    }
}
