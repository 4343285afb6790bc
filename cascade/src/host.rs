//! The `Compiler` façade: one subprocess, many concurrent compilations.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use cascade_proto::{
    CompileInput, CompileRequest, ImporterSpec, InboundMessage, PROTOCOL_ERROR_ID, StringInput,
    VersionRequest,
};
use tracing::debug;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::functions::FunctionStore;
use crate::importers::{ImporterEntry, ImporterStore};
use crate::launcher::Launcher;
use crate::logger::DefaultLogger;
use crate::options::{Options, StringOptions};
use crate::router::Router;
use crate::session::Session;

/// Result of a successful compilation.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct CompileOutput {
    /// Generated CSS.
    pub css: String,
    /// Source map JSON, when requested.
    pub source_map: Option<String>,
    /// Canonical URLs of every loaded source, including the entry point.
    pub loaded_urls: Vec<String>,
}

/// Version metadata reported by the compiler.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct CompilerVersion {
    /// Version of the embedded protocol.
    pub protocol_version: String,
    /// Version of the compiler package.
    pub compiler_version: String,
    /// Version of the compiler implementation.
    pub implementation_version: String,
    /// Name of the compiler implementation.
    pub implementation_name: String,
}

/// Handle to one compiler subprocess.
///
/// The subprocess is launched eagerly at construction and serves every
/// compilation of this instance; concurrent `compile_*` calls share the
/// wire and are multiplexed by compilation id. Compilation ids are
/// allocated monotonically from 1 and never reused.
#[derive(Debug)]
pub struct Compiler {
    /// Shared subprocess channel.
    channel: Arc<Channel>,
    /// Routing table shared with the channel's read loop.
    router: Arc<Router>,
    /// Next compilation id.
    next_compilation_id: AtomicU32,
    /// Next version request id.
    next_version_id: AtomicU32,
}

/// Removes the session's routing entry when the compile call returns.
struct Registration {
    router: Arc<Router>,
    compilation_id: u32,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.router.deregister(self.compilation_id);
    }
}

impl Compiler {
    /// Launches the compiler subprocess described by `launcher`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(launcher: &Launcher) -> Result<Self> {
        let router = Arc::new(Router::default());
        let channel = Channel::spawn(launcher, Arc::clone(&router))?;
        Ok(Self {
            channel,
            router,
            next_compilation_id: AtomicU32::new(1),
            next_version_id: AtomicU32::new(1),
        })
    }

    /// Builds a compiler over arbitrary stream halves, for driving the
    /// full compile path against a scripted peer.
    #[cfg(test)]
    pub(crate) fn from_streams(
        reader: impl tokio::io::AsyncRead + Send + Unpin + 'static,
        writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let router = Arc::new(Router::default());
        let channel = Channel::from_streams(reader, writer, Arc::clone(&router));
        Self {
            channel,
            router,
            next_compilation_id: AtomicU32::new(1),
            next_version_id: AtomicU32::new(1),
        }
    }

    /// Compiles stylesheet text held by the host.
    pub async fn compile_string(
        &self,
        source: impl Into<String>,
        options: &StringOptions,
    ) -> Result<CompileOutput> {
        let source = source.into();
        let syntax = options.syntax;
        let url = options.url.clone();
        self.run_compile(
            &options.options,
            options.input_importer.as_ref(),
            move |entry_spec| {
                CompileInput::String(StringInput {
                    source,
                    syntax,
                    url,
                    importer: entry_spec,
                })
            },
        )
        .await
    }

    /// Compiles a stylesheet file resolved by the compiler.
    pub async fn compile_path(
        &self,
        path: impl AsRef<Path>,
        options: &Options,
    ) -> Result<CompileOutput> {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.run_compile(options, None, move |_entry_spec| CompileInput::Path(path))
            .await
    }

    /// Requests version metadata from the compiler.
    pub async fn version(&self) -> Result<CompilerVersion> {
        if self.channel.is_closed() {
            return Err(Error::Closed);
        }
        let id = self.next_version_id.fetch_add(1, Ordering::SeqCst);
        let waiter = self.router.register_version(id);
        self.channel
            .send(&InboundMessage::VersionRequest(VersionRequest { id }))
            .await?;
        let response = waiter.await.map_err(|_| Error::Closed)?;
        Ok(CompilerVersion {
            protocol_version: response.protocol_version,
            compiler_version: response.compiler_version,
            implementation_version: response.implementation_version,
            implementation_name: response.implementation_name,
        })
    }

    /// Closes the channel, aborting every live compilation. Idempotent.
    pub async fn close(&self) {
        self.channel.close().await;
    }

    /// `true` once the channel has closed for any reason.
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Validates options, allocates the compilation id, and runs one
    /// session to its terminal outcome.
    async fn run_compile(
        &self,
        options: &Options,
        entry_importer: Option<&ImporterEntry>,
        make_input: impl FnOnce(Option<ImporterSpec>) -> CompileInput,
    ) -> Result<CompileOutput> {
        if self.channel.is_closed() {
            return Err(Error::Closed);
        }

        // Host errors surface here, before anything reaches the wire.
        let functions = FunctionStore::build(&options.functions)?;
        let (importers, importer_specs, entry_spec) =
            ImporterStore::build(entry_importer, &options.importers, &options.load_paths)?;
        let logger = options
            .logger
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultLogger));

        let id = self.allocate_compilation_id()?;
        let request = CompileRequest {
            id,
            input: make_input(entry_spec),
            style: options.style,
            source_map: options.source_map,
            source_map_include_sources: options.source_map_include_sources,
            importers: importer_specs,
            global_functions: functions.wire_signatures(),
            alert_color: options.alert_color,
            alert_ascii: options.alert_ascii,
            verbose: options.verbose,
            quiet_deps: options.quiet_deps,
            charset: options.charset,
        };

        let events = self.router.register(id);
        let _registration = Registration {
            router: Arc::clone(&self.router),
            compilation_id: id,
        };
        debug!(compilation_id = id, "starting compilation");
        let session = Session::new(id, Arc::clone(&self.channel), functions, importers, logger);
        session.run(request, events).await
    }

    fn allocate_compilation_id(&self) -> Result<u32> {
        let id = self.next_compilation_id.fetch_add(1, Ordering::SeqCst);
        if id == PROTOCOL_ERROR_ID {
            return Err(Error::Host("compilation id space exhausted".into()));
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::importers::{Importer, ImporterContext, ImporterSource};
    use crate::value::Value;
    use cascade_proto::{
        CanonicalizeRequest, CanonicalizeResult, CompileFailure, CompileResponse, CompileResult,
        CompileSuccess, FunctionCallRequest, FunctionCallResult, ImportRequest, ImportResult,
        LogEvent, LogLevel, OutboundMessage, ProtocolError, ProtocolErrorKind, SourceLocation,
        SourceSpan, Syntax, Value as WireValue, VersionResponse,
    };
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;

    /// Compiler wired to in-memory pipes: returns the host façade plus
    /// the peer's read and write halves.
    fn harness() -> (Compiler, DuplexStream, DuplexStream) {
        let (peer_reader, host_writer) = tokio::io::duplex(256 * 1024);
        let (host_reader, peer_writer) = tokio::io::duplex(256 * 1024);
        let compiler = Compiler::from_streams(host_reader, host_writer);
        (compiler, peer_reader, peer_writer)
    }

    async fn recv_inbound(reader: &mut DuplexStream) -> InboundMessage {
        cascade_proto::recv(reader).await.unwrap()
    }

    async fn send_outbound(writer: &mut DuplexStream, message: &OutboundMessage) {
        cascade_proto::send(writer, message).await.unwrap();
    }

    fn success_response(id: u32, css: &str) -> OutboundMessage {
        OutboundMessage::CompileResponse(CompileResponse {
            id,
            result: CompileResult::Success(CompileSuccess {
                css: css.to_owned(),
                source_map: None,
                loaded_urls: vec!["file:///entry.scss".into()],
            }),
        })
    }

    #[tokio::test]
    async fn custom_function_round_trip() {
        let (compiler, mut peer_reader, mut peer_writer) = harness();
        let options = StringOptions::new().options(
            Options::new().function("foo($arg)", |_args| Ok(Value::quoted("result"))),
        );

        let compile = compiler.compile_string("a {b: foo(bar)}", &options);
        let peer = async {
            let InboundMessage::CompileRequest(request) = recv_inbound(&mut peer_reader).await
            else {
                panic!("expected CompileRequest");
            };
            assert_eq!(request.id, 1);
            assert_eq!(request.global_functions, vec!["foo($arg)".to_owned()]);
            assert!(matches!(
                &request.input,
                CompileInput::String(input) if input.source == "a {b: foo(bar)}"
            ));

            send_outbound(
                &mut peer_writer,
                &OutboundMessage::FunctionCallRequest(FunctionCallRequest {
                    compilation_id: 1,
                    id: 0,
                    name: "foo".into(),
                    arguments: vec![WireValue::String {
                        text: "bar".into(),
                        quoted: false,
                    }],
                }),
            )
            .await;

            let InboundMessage::FunctionCallResponse(response) =
                recv_inbound(&mut peer_reader).await
            else {
                panic!("expected FunctionCallResponse");
            };
            assert_eq!(response.id, 0);
            assert!(matches!(
                response.result,
                FunctionCallResult::Success(WireValue::String { text, quoted: true })
                    if text == "result"
            ));

            send_outbound(&mut peer_writer, &success_response(1, "a {\n  b: \"result\";\n}"))
                .await;
        };

        let (output, ()) = tokio::join!(compile, peer);
        assert_eq!(output.unwrap().css, "a {\n  b: \"result\";\n}");
    }

    #[tokio::test]
    async fn dash_normalized_lookup_over_the_wire() {
        let (compiler, mut peer_reader, mut peer_writer) = harness();
        let options = StringOptions::new().options(
            Options::new().function("foo-bar()", |_args| Ok(Value::quoted("ok"))),
        );

        let compile = compiler.compile_string("a {b: foo_bar()}", &options);
        let peer = async {
            let _request = recv_inbound(&mut peer_reader).await;
            send_outbound(
                &mut peer_writer,
                &OutboundMessage::FunctionCallRequest(FunctionCallRequest {
                    compilation_id: 1,
                    id: 0,
                    name: "foo_bar".into(),
                    arguments: Vec::new(),
                }),
            )
            .await;
            let InboundMessage::FunctionCallResponse(response) =
                recv_inbound(&mut peer_reader).await
            else {
                panic!("expected FunctionCallResponse");
            };
            assert!(matches!(response.result, FunctionCallResult::Success(_)));
            send_outbound(&mut peer_writer, &success_response(1, "")).await;
        };
        let (output, ()) = tokio::join!(compile, peer);
        output.unwrap();
    }

    #[tokio::test]
    async fn throwing_callback_becomes_compile_error_with_span() {
        let (compiler, mut peer_reader, mut peer_writer) = harness();
        let options = StringOptions::new().options(
            Options::new().function("foo()", |_args| Err("heck".into())),
        );

        let compile = compiler.compile_string("a {b: foo()}", &options);
        let peer = async {
            let _request = recv_inbound(&mut peer_reader).await;
            send_outbound(
                &mut peer_writer,
                &OutboundMessage::FunctionCallRequest(FunctionCallRequest {
                    compilation_id: 1,
                    id: 0,
                    name: "foo".into(),
                    arguments: Vec::new(),
                }),
            )
            .await;

            let InboundMessage::FunctionCallResponse(response) =
                recv_inbound(&mut peer_reader).await
            else {
                panic!("expected FunctionCallResponse");
            };
            let FunctionCallResult::Error(message) = response.result else {
                panic!("expected error result");
            };
            assert_eq!(message, "heck");

            // The compiler turns the error response into a compile
            // failure at the call site.
            send_outbound(
                &mut peer_writer,
                &OutboundMessage::CompileResponse(CompileResponse {
                    id: 1,
                    result: CompileResult::Failure(CompileFailure {
                        message: "heck".into(),
                        span: Some(SourceSpan {
                            text: "foo()".into(),
                            start: SourceLocation {
                                offset: 6,
                                line: 0,
                                column: 6,
                            },
                            end: None,
                            url: None,
                            context: None,
                        }),
                        stack_trace: None,
                        formatted: None,
                    }),
                }),
            )
            .await;
        };

        let (result, ()) = tokio::join!(compile, peer);
        let Err(Error::Compile { message, span, .. }) = result else {
            panic!("expected compile error");
        };
        assert_eq!(message, "heck");
        assert_eq!(span.unwrap().start.line, 0);
    }

    /// Importer that counts canonicalize calls and records the
    /// from-import flag it saw.
    struct CountingImporter {
        canonicalize_calls: AtomicUsize,
        saw_from_import: StdMutex<Vec<bool>>,
    }

    impl Importer for CountingImporter {
        fn canonicalize(
            &self,
            _url: &str,
            context: &ImporterContext,
        ) -> std::result::Result<Option<String>, BoxError> {
            self.canonicalize_calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut seen) = self.saw_from_import.lock() {
                seen.push(context.from_import);
            }
            Ok(Some("u:orange".into()))
        }

        fn load(
            &self,
            _canonical_url: &str,
        ) -> std::result::Result<Option<ImporterSource>, BoxError> {
            Ok(Some(ImporterSource {
                contents: ".orange {color: orange}".into(),
                syntax: Syntax::Scss,
                source_map_url: None,
            }))
        }
    }

    #[tokio::test]
    async fn repeated_import_canonicalizes_once() {
        let importer = Arc::new(CountingImporter {
            canonicalize_calls: AtomicUsize::new(0),
            saw_from_import: StdMutex::new(Vec::new()),
        });
        let (compiler, mut peer_reader, mut peer_writer) = harness();
        let options = StringOptions::new()
            .options(Options::new().importer(Arc::clone(&importer) as Arc<dyn Importer>));

        let compile = compiler.compile_string("@import \"orange\"; @import \"orange\";", &options);
        let peer = async {
            let InboundMessage::CompileRequest(request) = recv_inbound(&mut peer_reader).await
            else {
                panic!("expected CompileRequest");
            };
            assert_eq!(request.importers, vec![cascade_proto::ImporterSpec::ImporterId(0)]);

            // The compiler canonicalizes each @import occurrence.
            for request_id in [0u32, 1] {
                send_outbound(
                    &mut peer_writer,
                    &OutboundMessage::CanonicalizeRequest(CanonicalizeRequest {
                        compilation_id: 1,
                        id: request_id,
                        importer_id: 0,
                        url: "orange".into(),
                        from_import: true,
                        containing_url: None,
                    }),
                )
                .await;
                let InboundMessage::CanonicalizeResponse(response) =
                    recv_inbound(&mut peer_reader).await
                else {
                    panic!("expected CanonicalizeResponse");
                };
                assert_eq!(response.id, request_id);
                assert_eq!(response.result, CanonicalizeResult::Url("u:orange".into()));
            }

            // One load for the canonical URL; the compiler caches it.
            send_outbound(
                &mut peer_writer,
                &OutboundMessage::ImportRequest(ImportRequest {
                    compilation_id: 1,
                    id: 2,
                    importer_id: 0,
                    url: "u:orange".into(),
                }),
            )
            .await;
            let InboundMessage::ImportResponse(response) = recv_inbound(&mut peer_reader).await
            else {
                panic!("expected ImportResponse");
            };
            assert!(matches!(
                response.result,
                ImportResult::Success(s) if s.contents.contains("orange")
            ));

            send_outbound(
                &mut peer_writer,
                &success_response(1, ".orange {\n  color: orange;\n}"),
            )
            .await;
        };

        let (output, ()) = tokio::join!(compile, peer);
        assert!(output.unwrap().css.contains("color: orange"));
        assert_eq!(importer.canonicalize_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            importer.saw_from_import.lock().unwrap().as_slice(),
            &[true]
        );
    }

    /// Importer whose canonicalize blocks until the test releases it,
    /// widening the window in which duplicate requests are in flight.
    struct BlockingImporter {
        canonicalize_calls: AtomicUsize,
        release: StdMutex<std::sync::mpsc::Receiver<()>>,
    }

    impl Importer for BlockingImporter {
        fn canonicalize(
            &self,
            _url: &str,
            _context: &ImporterContext,
        ) -> std::result::Result<Option<String>, BoxError> {
            self.canonicalize_calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(release) = self.release.lock() {
                let _ = release.recv();
            }
            Ok(Some("u:blue".into()))
        }

        fn load(
            &self,
            _canonical_url: &str,
        ) -> std::result::Result<Option<ImporterSource>, BoxError> {
            Ok(Some(ImporterSource {
                contents: ".blue {color: blue}".into(),
                syntax: Syntax::Scss,
                source_map_url: None,
            }))
        }
    }

    #[tokio::test]
    async fn concurrent_identical_canonicalize_requests_invoke_once() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let importer = Arc::new(BlockingImporter {
            canonicalize_calls: AtomicUsize::new(0),
            release: StdMutex::new(release_rx),
        });
        let (compiler, mut peer_reader, mut peer_writer) = harness();
        let options = StringOptions::new()
            .options(Options::new().importer(Arc::clone(&importer) as Arc<dyn Importer>));

        let compile = compiler.compile_string("@import \"blue\"; @import \"blue\";", &options);
        let peer = async {
            let _request = recv_inbound(&mut peer_reader).await;

            // Both requests go out back-to-back, before either response
            // exists, so both workers race for the same cache key.
            for request_id in [0u32, 1] {
                send_outbound(
                    &mut peer_writer,
                    &OutboundMessage::CanonicalizeRequest(CanonicalizeRequest {
                        compilation_id: 1,
                        id: request_id,
                        importer_id: 0,
                        url: "blue".into(),
                        from_import: true,
                        containing_url: None,
                    }),
                )
                .await;
            }
            // Two releases queued: a duplicate invocation would consume
            // the second and show up in the call count.
            release_tx.send(()).unwrap();
            release_tx.send(()).unwrap();

            let mut ids = Vec::new();
            for _ in 0..2 {
                let InboundMessage::CanonicalizeResponse(response) =
                    recv_inbound(&mut peer_reader).await
                else {
                    panic!("expected CanonicalizeResponse");
                };
                assert_eq!(response.result, CanonicalizeResult::Url("u:blue".into()));
                ids.push(response.id);
            }
            ids.sort_unstable();
            assert_eq!(ids, vec![0, 1]);
            send_outbound(&mut peer_writer, &success_response(1, "")).await;
        };

        let (output, ()) = tokio::join!(compile, peer);
        output.unwrap();
        assert_eq!(importer.canonicalize_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn file_importer_flow_rejects_non_file_urls() {
        use crate::importers::FileImporter;
        use cascade_proto::{FileImportRequest, FileImportResult};

        struct Redirect {
            target: &'static str,
        }
        impl FileImporter for Redirect {
            fn find_file_url(
                &self,
                _url: &str,
                _context: &ImporterContext,
            ) -> std::result::Result<Option<String>, BoxError> {
                Ok(Some(self.target.to_owned()))
            }
        }

        for (target, expect_url) in [("file:///styles/orange.scss", true), ("u:orange", false)] {
            let (compiler, mut peer_reader, mut peer_writer) = harness();
            let options = StringOptions::new().options(
                Options::new()
                    .file_importer(Arc::new(Redirect { target }) as Arc<dyn FileImporter>),
            );

            let compile = compiler.compile_string("@use \"orange\"", &options);
            let peer = async {
                let _request = recv_inbound(&mut peer_reader).await;
                send_outbound(
                    &mut peer_writer,
                    &OutboundMessage::FileImportRequest(FileImportRequest {
                        compilation_id: 1,
                        id: 0,
                        importer_id: 0,
                        url: "orange".into(),
                        from_import: false,
                        containing_url: None,
                    }),
                )
                .await;
                let InboundMessage::FileImportResponse(response) =
                    recv_inbound(&mut peer_reader).await
                else {
                    panic!("expected FileImportResponse");
                };
                match (&response.result, expect_url) {
                    (FileImportResult::FileUrl(url), true) => assert_eq!(url, target),
                    (FileImportResult::Error(message), false) => {
                        assert!(message.contains("file: URL"));
                    }
                    other => panic!("unexpected result {other:?}"),
                }
                send_outbound(&mut peer_writer, &success_response(1, "")).await;
            };
            let (output, ()) = tokio::join!(compile, peer);
            output.unwrap();
        }
    }

    #[tokio::test]
    async fn panicking_callback_becomes_an_error_response() {
        let (compiler, mut peer_reader, mut peer_writer) = harness();
        let options = StringOptions::new().options(
            Options::new().function("explode()", |_args: &[Value]| panic!("kaboom")),
        );

        let compile = compiler.compile_string("a {b: explode()}", &options);
        let peer = async {
            let _request = recv_inbound(&mut peer_reader).await;
            send_outbound(
                &mut peer_writer,
                &OutboundMessage::FunctionCallRequest(FunctionCallRequest {
                    compilation_id: 1,
                    id: 0,
                    name: "explode".into(),
                    arguments: Vec::new(),
                }),
            )
            .await;
            let InboundMessage::FunctionCallResponse(response) =
                recv_inbound(&mut peer_reader).await
            else {
                panic!("expected FunctionCallResponse");
            };
            let FunctionCallResult::Error(message) = response.result else {
                panic!("expected error result");
            };
            assert!(message.contains("kaboom"));
            send_outbound(&mut peer_writer, &success_response(1, "")).await;
        };
        let (output, ()) = tokio::join!(compile, peer);
        output.unwrap();
    }

    #[tokio::test]
    async fn log_events_reach_the_logger_without_failing_the_compile() {
        use crate::logger::{DebugContext, Logger, WarnContext};

        #[derive(Default)]
        struct Recording {
            warnings: StdMutex<Vec<String>>,
            debugs: StdMutex<Vec<String>>,
        }
        impl Logger for Recording {
            fn warn(&self, message: &str, _context: &WarnContext) {
                if let Ok(mut warnings) = self.warnings.lock() {
                    warnings.push(message.to_owned());
                }
            }
            fn debug(&self, message: &str, _context: &DebugContext) {
                if let Ok(mut debugs) = self.debugs.lock() {
                    debugs.push(message.to_owned());
                }
            }
        }

        let logger = Arc::new(Recording::default());
        let (compiler, mut peer_reader, mut peer_writer) = harness();
        let options = StringOptions::new()
            .options(Options::new().logger(Arc::clone(&logger) as Arc<dyn Logger>));

        let compile = compiler.compile_string("@debug x", &options);
        let peer = async {
            let _request = recv_inbound(&mut peer_reader).await;
            for (level, message) in [
                (LogLevel::Warning, "watch out"),
                (LogLevel::DeprecationWarning, "old"),
                (LogLevel::Debug, "x"),
            ] {
                send_outbound(
                    &mut peer_writer,
                    &OutboundMessage::LogEvent(LogEvent {
                        compilation_id: 1,
                        level,
                        message: message.into(),
                        span: None,
                        stack_trace: None,
                    }),
                )
                .await;
            }
            send_outbound(&mut peer_writer, &success_response(1, "")).await;
        };

        let (output, ()) = tokio::join!(compile, peer);
        output.unwrap();
        assert_eq!(
            logger.warnings.lock().unwrap().as_slice(),
            &["watch out".to_owned(), "old".to_owned()]
        );
        assert_eq!(logger.debugs.lock().unwrap().as_slice(), &["x".to_owned()]);
    }

    #[tokio::test]
    async fn compile_path_sends_the_path_and_load_paths() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("entry.scss");
        std::fs::write(&entry, "a {b: c}").unwrap();

        let (compiler, mut peer_reader, mut peer_writer) = harness();
        let options = Options::new().load_path(dir.path());

        let compile = compiler.compile_path(&entry, &options);
        let peer = async {
            let InboundMessage::CompileRequest(request) = recv_inbound(&mut peer_reader).await
            else {
                panic!("expected CompileRequest");
            };
            let CompileInput::Path(path) = &request.input else {
                panic!("expected path input");
            };
            assert_eq!(path, &entry.to_string_lossy());
            assert_eq!(
                request.importers,
                vec![ImporterSpec::Path(dir.path().to_string_lossy().into_owned())]
            );
            send_outbound(&mut peer_writer, &success_response(1, "a {\n  b: c;\n}")).await;
        };
        let (output, ()) = tokio::join!(compile, peer);
        assert_eq!(output.unwrap().css, "a {\n  b: c;\n}");
    }

    #[tokio::test]
    async fn compilation_ids_are_strictly_increasing() {
        let (compiler, mut peer_reader, mut peer_writer) = harness();
        let options = StringOptions::new();

        for expected_id in 1..=3u32 {
            let compile = compiler.compile_string("a {b: c}", &options);
            let peer = async {
                let InboundMessage::CompileRequest(request) = recv_inbound(&mut peer_reader).await
                else {
                    panic!("expected CompileRequest");
                };
                assert_eq!(request.id, expected_id);
                send_outbound(&mut peer_writer, &success_response(expected_id, "")).await;
            };
            let (output, ()) = tokio::join!(compile, peer);
            output.unwrap();
        }
    }

    #[tokio::test]
    async fn concurrent_compilations_do_not_cross_traffic() {
        let (compiler, mut peer_reader, mut peer_writer) = harness();
        let compiler = Arc::new(compiler);

        const COMPILES: u32 = 6;

        // Fake compiler: for each compile request, call that
        // compilation's function, then answer with css built from the
        // function's return value. Traffic is fully interleaved.
        let peer = async move {
            let mut started = 0u32;
            let mut finished = 0u32;
            while finished < COMPILES {
                match recv_inbound(&mut peer_reader).await {
                    InboundMessage::CompileRequest(request) => {
                        started += 1;
                        let name = request.global_functions[0]
                            .split('(')
                            .next()
                            .unwrap()
                            .to_owned();
                        send_outbound(
                            &mut peer_writer,
                            &OutboundMessage::FunctionCallRequest(FunctionCallRequest {
                                compilation_id: request.id,
                                // Request ids are per-compilation; reuse
                                // the compilation id for traceability.
                                id: request.id,
                                name,
                                arguments: Vec::new(),
                            }),
                        )
                        .await;
                    }
                    InboundMessage::FunctionCallResponse(response) => {
                        let FunctionCallResult::Success(WireValue::String { text, .. }) =
                            response.result
                        else {
                            panic!("expected string result");
                        };
                        send_outbound(
                            &mut peer_writer,
                            &success_response(response.id, &format!("a {{\n  url: \"{text}\";\n}}")),
                        )
                        .await;
                        finished += 1;
                    }
                    other => panic!("unexpected message {other:?}"),
                }
            }
            assert_eq!(started, COMPILES);
        };
        let peer = tokio::spawn(peer);

        let mut compiles = tokio::task::JoinSet::new();
        for i in 0..COMPILES {
            let compiler = Arc::clone(&compiler);
            compiles.spawn(async move {
                let value = format!("thread-{i}");
                let returned = value.clone();
                let options = StringOptions::new().options(Options::new().function(
                    format!("test_function_{i}()"),
                    move |_args: &[Value]| Ok(Value::quoted(returned.clone())),
                ));
                let output = compiler
                    .compile_string(format!("a {{b: test_function_{i}()}}"), &options)
                    .await
                    .unwrap();
                (value, output.css)
            });
        }

        let mut seen = 0;
        while let Some(result) = compiles.join_next().await {
            let (value, css) = result.unwrap();
            assert_eq!(css.matches(&format!("url: \"{value}\"")).count(), 1);
            seen += 1;
        }
        assert_eq!(seen, COMPILES as usize);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn protocol_error_aborts_all_and_poisons_the_channel() {
        let (compiler, mut peer_reader, mut peer_writer) = harness();
        let options = StringOptions::new();

        let compile = compiler.compile_string("a {b: c}", &options);
        let peer = async {
            let _request = recv_inbound(&mut peer_reader).await;
            send_outbound(
                &mut peer_writer,
                &OutboundMessage::ProtocolError(ProtocolError {
                    id: cascade_proto::PROTOCOL_ERROR_ID,
                    kind: ProtocolErrorKind::Parse,
                    message: "unparsable".into(),
                }),
            )
            .await;
        };
        let (result, ()) = tokio::join!(compile, peer);
        assert!(matches!(result, Err(Error::Protocol(_))));

        // The channel is closed; further compiles fail fast.
        assert!(compiler.is_closed());
        assert!(matches!(
            compiler.compile_string("a {b: c}", &options).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn duplicate_pending_request_id_is_a_protocol_failure() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = StdMutex::new(release_rx);

        let (compiler, mut peer_reader, mut peer_writer) = harness();
        let options = StringOptions::new().options(Options::new().function(
            "blocked()",
            move |_args: &[Value]| {
                if let Ok(rx) = release_rx.lock() {
                    let _ = rx.recv();
                }
                Ok(Value::Null)
            },
        ));

        let compile = compiler.compile_string("a {b: blocked()}", &options);
        let peer = async {
            let _request = recv_inbound(&mut peer_reader).await;
            for _ in 0..2 {
                send_outbound(
                    &mut peer_writer,
                    &OutboundMessage::FunctionCallRequest(FunctionCallRequest {
                        compilation_id: 1,
                        id: 5,
                        name: "blocked".into(),
                        arguments: Vec::new(),
                    }),
                )
                .await;
            }
        };

        let (result, ()) = tokio::join!(compile, peer);
        assert!(matches!(result, Err(Error::Protocol(message)) if message.contains("5")));
        drop(release_tx);
    }

    #[tokio::test]
    async fn version_handshake() {
        let (compiler, mut peer_reader, mut peer_writer) = harness();

        let version = compiler.version();
        let peer = async {
            let InboundMessage::VersionRequest(request) = recv_inbound(&mut peer_reader).await
            else {
                panic!("expected VersionRequest");
            };
            send_outbound(
                &mut peer_writer,
                &OutboundMessage::VersionResponse(VersionResponse {
                    id: request.id,
                    protocol_version: "3.2.0".into(),
                    compiler_version: "1.89.0".into(),
                    implementation_version: "1.89.0".into(),
                    implementation_name: "dart-sass".into(),
                }),
            )
            .await;
        };
        let (version, ()) = tokio::join!(version, peer);
        let version = version.unwrap();
        assert_eq!(version.protocol_version, "3.2.0");
        assert_eq!(version.implementation_name, "dart-sass");
    }

    #[tokio::test]
    async fn compile_after_close_fails_with_closed() {
        let (compiler, _peer_reader, _peer_writer) = harness();
        compiler.close().await;
        assert!(matches!(
            compiler.compile_string("a {b: c}", &StringOptions::new()).await,
            Err(Error::Closed)
        ));
        assert!(matches!(compiler.version().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn invalid_signature_fails_before_any_wire_traffic() {
        let (compiler, mut peer_reader, _peer_writer) = harness();
        let options =
            StringOptions::new().options(Options::new().function("$foo()", |_args| Ok(Value::Null)));

        let result = compiler.compile_string("a {b: c}", &options).await;
        assert!(matches!(result, Err(Error::Host(_))));

        // Nothing was sent: the peer sees the stream close, not a frame.
        drop(compiler);
        let mut rest = Vec::new();
        use tokio::io::AsyncReadExt;
        let _ = peer_reader.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }
}
