//! The per-compilation session state machine.
//!
//! A session owns exactly one compilation: it sends the compile request,
//! then drains router events until the terminal compile response (or a
//! channel failure) arrives. Callback requests issued by the compiler
//! along the way are dispatched on their own workers so a slow callback
//! never stalls message delivery; each worker writes its own response
//! frame, with atomicity guaranteed by the channel's write mutex.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cascade_proto::{
    CanonicalizeRequest, CanonicalizeResponse, CanonicalizeResult, CompileRequest, CompileResult,
    FileImportRequest, FileImportResponse, FileImportResult, FunctionCallRequest,
    FunctionCallResponse, FunctionCallResult, ImportRequest, ImportResponse, ImportResult,
    InboundMessage, LogEvent, LogLevel, OutboundMessage,
};
use tokio::sync::OnceCell;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinError;
use tracing::debug;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::functions::FunctionStore;
use crate::host::CompileOutput;
use crate::importers::{ImporterContext, ImporterStore};
use crate::logger::{DebugContext, Logger, WarnContext};
use crate::router::Event;

/// Key of the canonicalize result cache: importer id, URL, from-import.
type CanonicalizeKey = (u32, String, bool);

/// State machine for one compilation.
pub(crate) struct Session {
    /// Id allocated by the façade; immutable for the session's life.
    compilation_id: u32,
    /// Shared subprocess channel.
    channel: Arc<Channel>,
    /// Custom functions registered for this compilation.
    functions: Arc<FunctionStore>,
    /// Importers registered for this compilation.
    importers: Arc<ImporterStore>,
    /// Receiver for log events.
    logger: Arc<dyn Logger>,
    /// Request ids awaiting a response; an id is pending from request
    /// arrival until its response frame is written.
    pending: Arc<Mutex<HashSet<u32>>>,
    /// Canonicalize results, one cell per request identity. The cell is
    /// reserved under the map lock and initialized at most once, so a
    /// repeated import of the same URL invokes the callback only once
    /// even when duplicate requests are in flight concurrently.
    canonicalize_cache: Arc<Mutex<HashMap<CanonicalizeKey, Arc<OnceCell<CanonicalizeResult>>>>>,
}

impl Session {
    /// Builds a session around the per-compilation registries.
    pub(crate) fn new(
        compilation_id: u32,
        channel: Arc<Channel>,
        functions: FunctionStore,
        importers: ImporterStore,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            compilation_id,
            channel,
            functions: Arc::new(functions),
            importers: Arc::new(importers),
            logger,
            pending: Arc::new(Mutex::new(HashSet::new())),
            canonicalize_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sends the compile request and runs to the terminal outcome.
    ///
    /// Returns exactly once: with the compile result, the compile
    /// failure, or the channel failure that aborted the session.
    pub(crate) async fn run(
        self,
        compile_request: CompileRequest,
        mut events: UnboundedReceiver<Event>,
    ) -> Result<CompileOutput> {
        self.channel
            .send(&InboundMessage::CompileRequest(compile_request))
            .await?;

        while let Some(event) = events.recv().await {
            let message = match event {
                Event::Fatal(error) => return Err(error),
                Event::Message(message) => message,
            };
            match message {
                OutboundMessage::CompileResponse(response) => {
                    return match response.result {
                        CompileResult::Success(success) => Ok(CompileOutput {
                            css: success.css,
                            source_map: success.source_map,
                            loaded_urls: success.loaded_urls,
                        }),
                        CompileResult::Failure(failure) => Err(failure.into()),
                    };
                }
                OutboundMessage::LogEvent(log_event) => self.log(&log_event),
                OutboundMessage::FunctionCallRequest(request) => {
                    if let Err(error) = self.on_function_call(request) {
                        return self.escalate(error).await;
                    }
                }
                OutboundMessage::CanonicalizeRequest(request) => {
                    if let Err(error) = self.on_canonicalize(request) {
                        return self.escalate(error).await;
                    }
                }
                OutboundMessage::ImportRequest(request) => {
                    if let Err(error) = self.on_import(request) {
                        return self.escalate(error).await;
                    }
                }
                OutboundMessage::FileImportRequest(request) => {
                    if let Err(error) = self.on_file_import(request) {
                        return self.escalate(error).await;
                    }
                }
                OutboundMessage::ProtocolError(_) | OutboundMessage::VersionResponse(_) => {
                    let error = Error::Protocol(format!(
                        "misrouted message reached compilation {}",
                        self.compilation_id
                    ));
                    return self.escalate(error).await;
                }
            }
        }
        // The router dropped the sender without a fatal event; only
        // possible if the channel tore down mid-delivery.
        Err(Error::Closed)
    }

    /// Escalates a session-detected protocol violation channel-wide.
    async fn escalate(&self, error: Error) -> Result<CompileOutput> {
        self.channel.shutdown(error.clone()).await;
        Err(error)
    }

    /// Routes a log event to the logger. Never affects the compile.
    fn log(&self, event: &LogEvent) {
        match event.level {
            LogLevel::Warning | LogLevel::DeprecationWarning => self.logger.warn(
                &event.message,
                &WarnContext {
                    deprecation: event.level == LogLevel::DeprecationWarning,
                    span: event.span.clone(),
                    stack_trace: event.stack_trace.clone(),
                },
            ),
            LogLevel::Debug => self.logger.debug(
                &event.message,
                &DebugContext {
                    span: event.span.clone(),
                },
            ),
        }
    }

    /// Records a request id as pending; a duplicate is a protocol
    /// violation.
    fn mark_pending(&self, request_id: u32) -> Result<()> {
        if lock(&self.pending).insert(request_id) {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "request id {request_id} is already pending for compilation {}",
                self.compilation_id
            )))
        }
    }

    fn responder(&self, request_id: u32) -> Responder {
        Responder {
            channel: Arc::clone(&self.channel),
            pending: Arc::clone(&self.pending),
            request_id,
        }
    }

    fn on_function_call(&self, request: FunctionCallRequest) -> Result<()> {
        self.mark_pending(request.id)?;
        let functions = Arc::clone(&self.functions);
        let responder = self.responder(request.id);
        let request_id = request.id;
        tokio::spawn(async move {
            let joined =
                tokio::task::spawn_blocking(move || functions.invoke(&request.name, request.arguments))
                    .await;
            let (result, accessed) = joined
                .unwrap_or_else(|error| (FunctionCallResult::Error(panic_message(error)), Vec::new()));
            responder
                .respond(InboundMessage::FunctionCallResponse(FunctionCallResponse {
                    id: request_id,
                    result,
                    accessed_argument_lists: accessed,
                }))
                .await;
        });
        Ok(())
    }

    fn on_canonicalize(&self, request: CanonicalizeRequest) -> Result<()> {
        self.mark_pending(request.id)?;
        let importers = Arc::clone(&self.importers);
        let cache = Arc::clone(&self.canonicalize_cache);
        let responder = self.responder(request.id);
        let request_id = request.id;
        tokio::spawn(async move {
            let key = (request.importer_id, request.url.clone(), request.from_import);
            // Reserve the cell while the map lock is held; concurrent
            // duplicates share it and only the first initializes it.
            let cell = Arc::clone(lock(&cache).entry(key).or_default());
            let result = cell
                .get_or_init(|| async move {
                    let joined = tokio::task::spawn_blocking(move || {
                        let context = ImporterContext {
                            from_import: request.from_import,
                            containing_url: request.containing_url.clone(),
                        };
                        importers.canonicalize(request.importer_id, &request.url, &context)
                    })
                    .await;
                    joined.unwrap_or_else(|error| CanonicalizeResult::Error(panic_message(error)))
                })
                .await
                .clone();
            responder
                .respond(InboundMessage::CanonicalizeResponse(CanonicalizeResponse {
                    id: request_id,
                    result,
                }))
                .await;
        });
        Ok(())
    }

    fn on_import(&self, request: ImportRequest) -> Result<()> {
        self.mark_pending(request.id)?;
        let importers = Arc::clone(&self.importers);
        let responder = self.responder(request.id);
        let request_id = request.id;
        tokio::spawn(async move {
            let joined = tokio::task::spawn_blocking(move || {
                importers.load(request.importer_id, &request.url)
            })
            .await;
            let result = joined.unwrap_or_else(|error| ImportResult::Error(panic_message(error)));
            responder
                .respond(InboundMessage::ImportResponse(ImportResponse {
                    id: request_id,
                    result,
                }))
                .await;
        });
        Ok(())
    }

    fn on_file_import(&self, request: FileImportRequest) -> Result<()> {
        self.mark_pending(request.id)?;
        let importers = Arc::clone(&self.importers);
        let responder = self.responder(request.id);
        let request_id = request.id;
        tokio::spawn(async move {
            let joined = tokio::task::spawn_blocking(move || {
                let context = ImporterContext {
                    from_import: request.from_import,
                    containing_url: request.containing_url.clone(),
                };
                importers.find_file_url(request.importer_id, &request.url, &context)
            })
            .await;
            let result =
                joined.unwrap_or_else(|error| FileImportResult::Error(panic_message(error)));
            responder
                .respond(InboundMessage::FileImportResponse(FileImportResponse {
                    id: request_id,
                    result,
                }))
                .await;
        });
        Ok(())
    }
}

/// Sends one callback response and clears its pending entry.
///
/// The id stays pending until the response frame is written; a worker
/// racing with channel teardown drops its response silently.
struct Responder {
    channel: Arc<Channel>,
    pending: Arc<Mutex<HashSet<u32>>>,
    request_id: u32,
}

impl Responder {
    async fn respond(self, message: InboundMessage) {
        if self.channel.send(&message).await.is_err() {
            debug!(
                request_id = self.request_id,
                "dropping callback response; channel closed"
            );
        }
        lock(&self.pending).remove(&self.request_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Renders a worker join failure as a callback error message.
fn panic_message(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(panic) => {
            if let Some(message) = panic.downcast_ref::<&str>() {
                format!("host callback panicked: {message}")
            } else if let Some(message) = panic.downcast_ref::<String>() {
                format!("host callback panicked: {message}")
            } else {
                "host callback panicked".to_owned()
            }
        }
        Err(_) => "host callback was cancelled".to_owned(),
    }
}
