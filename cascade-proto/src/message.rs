//! Envelope types for the host↔compiler wire protocol.
//!
//! Traffic in each direction is a single tagged union: [`InboundMessage`]
//! (host → compiler) and [`OutboundMessage`] (compiler → host). Every
//! compile-scoped message carries the compilation id it belongs to, and
//! every callback request/response pair is correlated by a per-compilation
//! request id.

// Closed wire format: every message and value shape is fixed by the
// protocol revision, so the types stay exhaustive.
#![allow(clippy::exhaustive_enums, clippy::exhaustive_structs)]

use serde::{Deserialize, Serialize};

/// Compilation id reserved for protocol errors that are not associated
/// with any compilation.
pub const PROTOCOL_ERROR_ID: u32 = u32::MAX;

/// Host → compiler envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboundMessage {
    /// Start a new compilation.
    CompileRequest(CompileRequest),
    /// Reply to a [`CanonicalizeRequest`].
    CanonicalizeResponse(CanonicalizeResponse),
    /// Reply to an [`ImportRequest`].
    ImportResponse(ImportResponse),
    /// Reply to a [`FileImportRequest`].
    FileImportResponse(FileImportResponse),
    /// Reply to a [`FunctionCallRequest`].
    FunctionCallResponse(FunctionCallResponse),
    /// Ask the compiler for its version metadata.
    VersionRequest(VersionRequest),
}

/// Compiler → host envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutboundMessage {
    /// Terminal reply to a [`CompileRequest`].
    CompileResponse(CompileResponse),
    /// A warning or debug message emitted during compilation.
    LogEvent(LogEvent),
    /// Ask an importer to canonicalize a URL.
    CanonicalizeRequest(CanonicalizeRequest),
    /// Ask an importer to load a canonical URL.
    ImportRequest(ImportRequest),
    /// Ask a file importer to resolve a URL to a `file:` URL.
    FileImportRequest(FileImportRequest),
    /// Invoke a host-registered custom function.
    FunctionCallRequest(FunctionCallRequest),
    /// The compiler rejected a message from the host.
    ProtocolError(ProtocolError),
    /// Reply to a [`VersionRequest`].
    VersionResponse(VersionResponse),
}

impl OutboundMessage {
    /// The compilation this message belongs to, if it is compile-scoped.
    ///
    /// [`ProtocolError`] and [`VersionResponse`] are routed by other keys
    /// and return `None`.
    pub fn compilation_id(&self) -> Option<u32> {
        match self {
            Self::CompileResponse(m) => Some(m.id),
            Self::LogEvent(m) => Some(m.compilation_id),
            Self::CanonicalizeRequest(m) => Some(m.compilation_id),
            Self::ImportRequest(m) => Some(m.compilation_id),
            Self::FileImportRequest(m) => Some(m.compilation_id),
            Self::FunctionCallRequest(m) => Some(m.compilation_id),
            Self::ProtocolError(_) | Self::VersionResponse(_) => None,
        }
    }
}

/// Syntax of a stylesheet source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Syntax {
    /// SCSS (CSS-superset) syntax.
    #[default]
    Scss,
    /// Whitespace-sensitive indented syntax.
    Indented,
    /// Plain CSS.
    Css,
}

/// Output style of generated CSS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStyle {
    /// One declaration per line.
    #[default]
    Expanded,
    /// Whitespace removed.
    Compressed,
}

/// One entry in the compiler's import resolution chain, in precedence
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImporterSpec {
    /// Resolve against a filesystem load path.
    Path(String),
    /// Consult the host importer registered under this id.
    ImporterId(u32),
    /// Consult the host file importer registered under this id.
    FileImporterId(u32),
}

/// Entry point of a compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompileInput {
    /// Compile source text held by the host.
    String(StringInput),
    /// Compile a file on disk, resolved by the compiler.
    Path(String),
}

/// Source text and its interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringInput {
    /// The stylesheet text.
    pub source: String,
    /// Syntax the text is written in.
    pub syntax: Syntax,
    /// Canonical URL of the entry point, if it has one.
    pub url: Option<String>,
    /// Importer used to resolve relative loads from the entry point.
    pub importer: Option<ImporterSpec>,
}

/// Host → compiler request to start a compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileRequest {
    /// Compilation id; all related traffic carries it.
    pub id: u32,
    /// Entry point.
    pub input: CompileInput,
    /// Output style.
    pub style: OutputStyle,
    /// Generate a source map.
    pub source_map: bool,
    /// Embed full source text in the source map.
    pub source_map_include_sources: bool,
    /// Import resolution chain, in precedence order.
    pub importers: Vec<ImporterSpec>,
    /// Signatures of host-registered global functions.
    pub global_functions: Vec<String>,
    /// Permit terminal colors in messages.
    pub alert_color: bool,
    /// Restrict messages to ASCII.
    pub alert_ascii: bool,
    /// Emit all deprecation warnings, even repeated ones.
    pub verbose: bool,
    /// Suppress warnings from dependency stylesheets.
    pub quiet_deps: bool,
    /// Permit a leading `@charset`/BOM in the output.
    pub charset: bool,
}

/// Terminal compiler → host reply for one compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileResponse {
    /// Compilation this response terminates.
    pub id: u32,
    /// Success or failure.
    pub result: CompileResult,
}

/// Outcome of a compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompileResult {
    /// Compilation succeeded.
    Success(CompileSuccess),
    /// Compilation failed.
    Failure(CompileFailure),
}

/// Payload of a successful compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileSuccess {
    /// Generated CSS.
    pub css: String,
    /// Source map JSON, when requested.
    pub source_map: Option<String>,
    /// Canonical URLs of every loaded source, including the entry point.
    pub loaded_urls: Vec<String>,
}

/// Payload of a failed compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileFailure {
    /// Failure message, without source context.
    pub message: String,
    /// Location of the failure.
    pub span: Option<SourceSpan>,
    /// Stylesheet stack trace.
    pub stack_trace: Option<String>,
    /// Human-readable rendering with source context.
    pub formatted: Option<String>,
}

/// A contiguous region of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    /// Text covered by the span.
    pub text: String,
    /// Inclusive start.
    pub start: SourceLocation,
    /// Exclusive end; `None` for a point span.
    pub end: Option<SourceLocation>,
    /// Canonical URL of the file, if it has one.
    pub url: Option<String>,
    /// Additional source context around the span.
    pub context: Option<String>,
}

/// A position within a source file. Lines and columns are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Byte offset from the start of the file.
    pub offset: u32,
    /// 0-based line number.
    pub line: u32,
    /// 0-based column number.
    pub column: u32,
}

/// Severity of a [`LogEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// `@warn` or a compiler warning.
    Warning,
    /// Use of a deprecated feature.
    DeprecationWarning,
    /// `@debug`.
    Debug,
}

/// Warning or debug message emitted during a compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Compilation that produced the event.
    pub compilation_id: u32,
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// Location the event points at.
    pub span: Option<SourceSpan>,
    /// Stylesheet stack trace.
    pub stack_trace: Option<String>,
}

/// Compiler → host request to canonicalize an import URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalizeRequest {
    /// Compilation the request belongs to.
    pub compilation_id: u32,
    /// Request id, echoed in the response.
    pub id: u32,
    /// Importer to consult.
    pub importer_id: u32,
    /// URL as written in the stylesheet.
    pub url: String,
    /// `true` for `@import`, `false` for `@use`/`@forward`/`meta.load-css`.
    pub from_import: bool,
    /// Canonical URL of the stylesheet containing the load.
    pub containing_url: Option<String>,
}

/// Host → compiler reply to a [`CanonicalizeRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalizeResponse {
    /// Request id being answered.
    pub id: u32,
    /// Outcome.
    pub result: CanonicalizeResult,
}

/// Outcome of a canonicalize callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanonicalizeResult {
    /// The importer does not recognize the URL.
    Skip,
    /// The absolute canonical URL.
    Url(String),
    /// The callback failed.
    Error(String),
}

/// Compiler → host request to load a canonicalized URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    /// Compilation the request belongs to.
    pub compilation_id: u32,
    /// Request id, echoed in the response.
    pub id: u32,
    /// Importer to consult.
    pub importer_id: u32,
    /// Canonical URL produced by a prior canonicalize step.
    pub url: String,
}

/// Host → compiler reply to an [`ImportRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResponse {
    /// Request id being answered.
    pub id: u32,
    /// Outcome.
    pub result: ImportResult,
}

/// Outcome of a load callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ImportResult {
    /// The importer has no source for the URL.
    Skip,
    /// Loaded source.
    Success(ImportSuccess),
    /// The callback failed.
    Error(String),
}

/// Source loaded by an importer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSuccess {
    /// Stylesheet text.
    pub contents: String,
    /// Syntax of the text.
    pub syntax: Syntax,
    /// Absolute URL to report in source maps, if any.
    pub source_map_url: Option<String>,
}

/// Compiler → host request to resolve a URL via a file importer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileImportRequest {
    /// Compilation the request belongs to.
    pub compilation_id: u32,
    /// Request id, echoed in the response.
    pub id: u32,
    /// File importer to consult.
    pub importer_id: u32,
    /// URL as written in the stylesheet.
    pub url: String,
    /// `true` for `@import`, `false` for `@use`/`@forward`/`meta.load-css`.
    pub from_import: bool,
    /// Canonical URL of the stylesheet containing the load.
    pub containing_url: Option<String>,
}

/// Host → compiler reply to a [`FileImportRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileImportResponse {
    /// Request id being answered.
    pub id: u32,
    /// Outcome.
    pub result: FileImportResult,
}

/// Outcome of a find-file-url callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileImportResult {
    /// The importer does not recognize the URL.
    Skip,
    /// Absolute `file:` URL for the compiler to load itself.
    FileUrl(String),
    /// The callback failed.
    Error(String),
}

/// Compiler → host request to invoke a custom function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallRequest {
    /// Compilation the request belongs to.
    pub compilation_id: u32,
    /// Request id, echoed in the response.
    pub id: u32,
    /// Name the function was invoked as (normalization is the host's
    /// responsibility).
    pub name: String,
    /// Evaluated arguments.
    pub arguments: Vec<Value>,
}

/// Host → compiler reply to a [`FunctionCallRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    /// Request id being answered.
    pub id: u32,
    /// Outcome.
    pub result: FunctionCallResult,
    /// Ids of argument lists whose keywords the callback accessed;
    /// the compiler skips its unknown-keyword error for these.
    pub accessed_argument_lists: Vec<u32>,
}

/// Outcome of a custom-function callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FunctionCallResult {
    /// Returned value.
    Success(Value),
    /// The callback failed.
    Error(String),
}

/// Kind of protocol violation reported by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolErrorKind {
    /// A message could not be decoded.
    Parse,
    /// A message was decoded but its contents were invalid.
    Params,
    /// The compiler itself failed.
    Internal,
}

/// Compiler → host report that the protocol was violated.
///
/// `id` is the offending compilation, or [`PROTOCOL_ERROR_ID`] when the
/// error is not associated with any compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolError {
    /// Offending compilation id, or the sentinel.
    pub id: u32,
    /// Violation kind.
    pub kind: ProtocolErrorKind,
    /// Description of the violation.
    pub message: String,
}

/// Host → compiler request for version metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VersionRequest {
    /// Request id, echoed in the response.
    pub id: u32,
}

/// Compiler → host version metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    /// Request id being answered.
    pub id: u32,
    /// Version of the embedded protocol.
    pub protocol_version: String,
    /// Version of the compiler package.
    pub compiler_version: String,
    /// Version of the compiler implementation.
    pub implementation_version: String,
    /// Name of the compiler implementation.
    pub implementation_name: String,
}

/// Separator of a wire list value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListSeparator {
    /// `a, b`.
    Comma,
    /// `a b`.
    Space,
    /// `a / b`.
    Slash,
    /// Separator not yet observable (zero or one element).
    Undecided,
}

/// A stylesheet value crossing the wire in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// A string, quoted or unquoted.
    String {
        /// Text content, without quotes.
        text: String,
        /// Whether the string is quoted.
        quoted: bool,
    },
    /// A number with optional units.
    Number {
        /// Numeric value.
        value: f64,
        /// Numerator units, in order.
        numerators: Vec<String>,
        /// Denominator units, in order.
        denominators: Vec<String>,
    },
    /// A color in a named color space.
    Color {
        /// Color space name, e.g. `rgb`.
        space: String,
        /// First channel.
        channel1: f64,
        /// Second channel.
        channel2: f64,
        /// Third channel.
        channel3: f64,
        /// Alpha channel in `[0, 1]`.
        alpha: f64,
    },
    /// `true` or `false`.
    Boolean(bool),
    /// `null`.
    Null,
    /// An ordered list.
    List {
        /// Separator between elements.
        separator: ListSeparator,
        /// Whether the list is bracketed.
        brackets: bool,
        /// Elements.
        contents: Vec<Value>,
    },
    /// An ordered key → value mapping.
    Map(Vec<MapEntry>),
    /// Positional arguments plus keyword arguments; distinguishable at
    /// runtime from a plain list.
    ArgumentList {
        /// Id used to report keyword access back to the compiler; `0`
        /// for host-constructed lists.
        id: u32,
        /// Separator between positional arguments.
        separator: ListSeparator,
        /// Positional arguments.
        contents: Vec<Value>,
        /// Keyword arguments.
        keywords: Vec<(String, Value)>,
    },
    /// A first-class function defined during the compilation.
    Function {
        /// Compiler-assigned id.
        id: u32,
        /// Signature, present for host-created functions.
        signature: Option<String>,
    },
    /// An unsimplified `calc()`-family expression.
    Calculation(Calculation),
}

/// One key/value pair of a wire map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapEntry {
    /// Key.
    pub key: Value,
    /// Value.
    pub value: Value,
}

/// A `calc()`, `min()`, `max()`, or `clamp()` expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calculation {
    /// Function name, e.g. `calc`.
    pub name: String,
    /// Arguments, in order.
    pub arguments: Vec<CalculationValue>,
}

/// One operand inside a [`Calculation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CalculationValue {
    /// A number with units.
    Number {
        /// Numeric value.
        value: f64,
        /// Numerator units, in order.
        numerators: Vec<String>,
        /// Denominator units, in order.
        denominators: Vec<String>,
    },
    /// An unquoted string such as a variable or `env()` reference.
    String(String),
    /// An interpolated expression.
    Interpolation(String),
    /// A binary operation.
    Operation {
        /// Operator.
        operator: CalculationOperator,
        /// Left operand.
        left: Box<CalculationValue>,
        /// Right operand.
        right: Box<CalculationValue>,
    },
    /// A nested calculation.
    Calculation(Box<Calculation>),
}

/// Operator of a calculation operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalculationOperator {
    /// `+`.
    Plus,
    /// `-`.
    Minus,
    /// `*`.
    Times,
    /// `/`.
    Divide,
}
