//! Routing of decoded compiler messages to their compilations.
//!
//! Compile-scoped traffic is routed by compilation id to the session that
//! owns it; version responses go to their oneshot waiters. The first
//! channel-wide failure is sticky: it is broadcast to every registered
//! session and handed to any session that registers afterwards, so a
//! compilation can never wait on a channel that already died.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use cascade_proto::{OutboundMessage, VersionResponse};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::Error;

/// Event delivered to a compilation session, in subprocess emission order.
#[derive(Debug)]
pub(crate) enum Event {
    /// A compile-scoped message from the compiler.
    Message(OutboundMessage),
    /// The channel failed; no further messages will arrive.
    Fatal(Error),
}

/// Mutable routing state, guarded by the router mutex.
#[derive(Debug, Default)]
struct Tables {
    /// Compilation id → live session.
    sessions: HashMap<u32, mpsc::UnboundedSender<Event>>,
    /// Version request id → waiter.
    version_waiters: HashMap<u32, oneshot::Sender<VersionResponse>>,
    /// First channel-wide failure, if any.
    failure: Option<Error>,
}

/// Routing table shared by the channel's read loop and the host façade.
#[derive(Debug, Default)]
pub(crate) struct Router {
    tables: Mutex<Tables>,
}

impl Router {
    /// Registers a session and returns its event receiver.
    ///
    /// If the channel already failed, the receiver yields that failure
    /// immediately instead of being registered.
    pub(crate) fn register(&self, compilation_id: u32) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tables = self.lock();
        if let Some(failure) = &tables.failure {
            let _ = tx.send(Event::Fatal(failure.clone()));
        } else {
            tables.sessions.insert(compilation_id, tx);
        }
        rx
    }

    /// Removes a session. Idempotent.
    pub(crate) fn deregister(&self, compilation_id: u32) {
        self.lock().sessions.remove(&compilation_id);
    }

    /// Registers a waiter for a version response.
    pub(crate) fn register_version(&self, request_id: u32) -> oneshot::Receiver<VersionResponse> {
        let (tx, rx) = oneshot::channel();
        let mut tables = self.lock();
        if tables.failure.is_none() {
            tables.version_waiters.insert(request_id, tx);
        }
        rx
    }

    /// Delivers one decoded message to its destination.
    ///
    /// Returns a description of the violation when the message cannot be
    /// routed; the read loop escalates that to a channel-wide failure.
    pub(crate) fn route(&self, message: OutboundMessage) -> Result<(), String> {
        match message {
            OutboundMessage::ProtocolError(error) => Err(format!(
                "compiler reported {:?} error for compilation {}: {}",
                error.kind, error.id, error.message
            )),
            OutboundMessage::VersionResponse(response) => {
                match self.lock().version_waiters.remove(&response.id) {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                        Ok(())
                    }
                    None => Err(format!(
                        "unsolicited version response with id {}",
                        response.id
                    )),
                }
            }
            compile_scoped => {
                // Every remaining variant is compile-scoped.
                let Some(id) = compile_scoped.compilation_id() else {
                    return Err("message without a compilation id".into());
                };
                match self.lock().sessions.get(&id) {
                    Some(session) => {
                        if session.send(Event::Message(compile_scoped)).is_err() {
                            // The session resolved concurrently; its
                            // remaining traffic is moot.
                            debug!(compilation_id = id, "dropping message for finished session");
                        }
                        Ok(())
                    }
                    None => Err(format!("message for unknown compilation id {id}")),
                }
            }
        }
    }

    /// Broadcasts a terminal failure to every live session and waiter.
    ///
    /// Only the first failure is recorded; later calls are no-ops for
    /// sessions that already drained.
    pub(crate) fn fail_all(&self, error: &Error) {
        let mut tables = self.lock();
        if tables.failure.is_none() {
            tables.failure = Some(error.clone());
        }
        for (_, session) in tables.sessions.drain() {
            let _ = session.send(Event::Fatal(error.clone()));
        }
        // Dropping the senders wakes version waiters with a recv error.
        tables.version_waiters.clear();
    }

    /// Number of currently registered sessions.
    pub(crate) fn live_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_proto::{LogEvent, LogLevel, PROTOCOL_ERROR_ID, ProtocolError, ProtocolErrorKind};

    fn log_event(compilation_id: u32) -> OutboundMessage {
        OutboundMessage::LogEvent(LogEvent {
            compilation_id,
            level: LogLevel::Debug,
            message: "hi".into(),
            span: None,
            stack_trace: None,
        })
    }

    #[tokio::test]
    async fn routes_by_compilation_id() {
        let router = Router::default();
        let mut one = router.register(1);
        let mut two = router.register(2);

        router.route(log_event(2)).unwrap();
        router.route(log_event(1)).unwrap();

        assert!(matches!(
            one.recv().await,
            Some(Event::Message(OutboundMessage::LogEvent(e))) if e.compilation_id == 1
        ));
        assert!(matches!(
            two.recv().await,
            Some(Event::Message(OutboundMessage::LogEvent(e))) if e.compilation_id == 2
        ));
    }

    #[tokio::test]
    async fn unknown_compilation_is_a_violation() {
        let router = Router::default();
        let _rx = router.register(1);
        assert!(router.route(log_event(9)).is_err());
    }

    #[tokio::test]
    async fn protocol_error_is_a_violation() {
        let router = Router::default();
        let err = router
            .route(OutboundMessage::ProtocolError(ProtocolError {
                id: PROTOCOL_ERROR_ID,
                kind: ProtocolErrorKind::Parse,
                message: "bad frame".into(),
            }))
            .unwrap_err();
        assert!(err.contains("bad frame"));
    }

    #[tokio::test]
    async fn fail_all_reaches_every_session() {
        let router = Router::default();
        let mut one = router.register(1);
        let mut two = router.register(2);

        router.fail_all(&Error::Closed);

        assert!(matches!(one.recv().await, Some(Event::Fatal(Error::Closed))));
        assert!(matches!(two.recv().await, Some(Event::Fatal(Error::Closed))));
        assert_eq!(router.live_sessions(), 0);
    }

    #[tokio::test]
    async fn failure_is_sticky_for_late_registrations() {
        let router = Router::default();
        router.fail_all(&Error::Closed);

        let mut late = router.register(3);
        assert!(matches!(
            late.recv().await,
            Some(Event::Fatal(Error::Closed))
        ));
        assert_eq!(router.live_sessions(), 0);
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let router = Router::default();
        let _rx = router.register(1);
        router.deregister(1);
        router.deregister(1);
        assert_eq!(router.live_sessions(), 0);
    }
}
