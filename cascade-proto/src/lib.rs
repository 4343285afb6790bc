//! Wire protocol for cascade host↔compiler communication.
//!
//! Envelopes are serialized with [`postcard`] and framed with a base-128
//! varint length prefix, matching the embedded compiler's stdin/stdout
//! contract. The host sends [`InboundMessage`]s and receives
//! [`OutboundMessage`]s; each callback request/response pair is correlated
//! by a per-compilation request id.

mod codec;
mod message;
pub mod varint;

pub use codec::{recv, send};
pub use message::{
    Calculation, CalculationOperator, CalculationValue, CanonicalizeRequest, CanonicalizeResponse,
    CanonicalizeResult, CompileFailure, CompileInput, CompileRequest, CompileResponse,
    CompileResult, CompileSuccess, FileImportRequest, FileImportResponse, FileImportResult,
    FunctionCallRequest, FunctionCallResponse, FunctionCallResult, ImportRequest, ImportResponse,
    ImportResult, ImportSuccess, ImporterSpec, InboundMessage, ListSeparator, LogEvent, LogLevel,
    MapEntry, OutboundMessage, OutputStyle, PROTOCOL_ERROR_ID, ProtocolError, ProtocolErrorKind,
    SourceLocation, SourceSpan, StringInput, Syntax, Value, VersionRequest, VersionResponse,
};
