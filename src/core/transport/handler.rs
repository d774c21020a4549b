//! Transport independent connection handler

use super::{Channel, Connection, ConnectionId};
use crate::core::codec::{Message, WireError};
use crate::core::dispatcher::Dispatch;
use crate::core::errors::SecopError;
use crate::core::protocol::{help_lines, Action, HELP_LINE};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per interface handler settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Send `{exception, traceback}` details with error replies
    pub detailed_errors: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            detailed_errors: true,
        }
    }
}

impl HandlerOptions {
    fn error_detail(&self, err: &SecopError) -> Value {
        if !self.detailed_errors {
            return json!({});
        }
        let mut traceback = vec![err.to_string()];
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            traceback.push(cause.to_string());
            source = cause.source();
        }
        json!({ "exception": format!("{err:?}"), "traceback": traceback })
    }
}

struct Session {
    conn: Connection,
    dispatch: Arc<dyn Dispatch>,
    options: HandlerOptions,
}

impl Session {
    fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    fn send_help(&self) {
        for (idx, line) in help_lines().into_iter().enumerate() {
            self.conn
                .send(Message::new(HELP_LINE, Some(idx.to_string()), Some(json!(line))));
        }
        self.conn.send(Message::reply(Action::Help, None, None));
    }

    fn send_error(&self, action: &str, specifier: Option<String>, err: &SecopError) {
        let reply = Message::error(action, specifier, err, self.options.error_detail(err));
        self.conn.send(reply);
    }

    async fn handle(&self, incoming: Result<Message, WireError>) {
        let msg = match incoming {
            Ok(msg) => msg,
            Err(wire) => {
                debug!(conn = %self.id(), error = %wire, "undecodable request");
                let (action, specifier) = wire.origin();
                self.send_error(&action, specifier, &wire.to_secop());
                return;
            }
        };
        if msg.is_help() {
            self.send_help();
            return;
        }
        let (action, specifier) = (msg.action.clone(), msg.specifier.clone());
        match self.dispatch.handle_request(self.id(), msg).await {
            Ok(reply) => {
                self.conn.send(reply);
            }
            Err(err) => {
                debug!(conn = %self.id(), %action, error = %err, "request failed");
                self.send_error(&action, specifier, &err);
            }
        }
    }
}

/// Serve one client stream until it closes or `shutdown` is cancelled
///
/// The connection is registered with the dispatcher for its whole life
/// and unregistered on every exit path before the stream is closed.
/// Replies go through the same queue as events, so an `activate` baseline
/// always precedes its confirmation.
pub async fn serve_connection<C: Channel>(
    mut channel: C,
    dispatch: Arc<dyn Dispatch>,
    options: HandlerOptions,
    shutdown: CancellationToken,
) {
    let peer = channel.peer();
    let (conn, mut outgoing) = Connection::channel(peer.clone());
    let id = conn.id();
    let stalled = conn.stalled().clone();
    info!(conn = %id, %peer, "client connected");
    dispatch.add_connection(conn.clone());
    let session = Session {
        conn,
        dispatch: dispatch.clone(),
        options,
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = stalled.cancelled() => break,
            Some(msg) = outgoing.recv() => {
                if let Err(e) = channel.send(msg).await {
                    warn!(conn = %id, error = %e, "send failed");
                    break;
                }
            }
            incoming = channel.receive() => match incoming {
                Ok(Some(request)) => session.handle(request).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(conn = %id, error = %e, "receive failed");
                    break;
                }
            },
        }
    }

    dispatch.remove_connection(id);
    // flush what was queued before the peer went away
    while let Ok(msg) = outgoing.try_recv() {
        if stalled.is_cancelled() {
            break;
        }
        if channel.send(msg).await.is_err() {
            break;
        }
    }
    channel.close().await;
    info!(conn = %id, %peer, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::decode_line;
    use crate::core::datatype::DataType;
    use crate::core::dispatcher::{Dispatcher, NodeInfo};
    use crate::core::module::{Module, Parameter};
    use crate::core::transport::TransportError;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    // Scripted channel: yields the given lines, then waits for the test to
    // drop the trigger before reporting the peer as closed.
    struct Script {
        lines: VecDeque<String>,
        sent: mpsc::UnboundedSender<Message>,
        hold: Option<tokio::sync::oneshot::Receiver<()>>,
    }

    #[async_trait::async_trait]
    impl Channel for Script {
        async fn receive(&mut self) -> Result<Option<Result<Message, WireError>>, TransportError> {
            if let Some(line) = self.lines.pop_front() {
                return Ok(Some(decode_line(&line)));
            }
            if let Some(hold) = self.hold.as_mut() {
                let _ = hold.await;
                self.hold = None;
            }
            Ok(None)
        }

        async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
            self.sent.send(msg).map_err(|_| TransportError::Closed)
        }

        fn peer(&self) -> String {
            "script".into()
        }

        async fn close(&mut self) {}
    }

    fn dispatcher() -> Arc<Dispatcher> {
        let dispatcher = Dispatcher::new(NodeInfo::new("eq", "desc"));
        let module = Module::builder("mod")
            .parameter(Parameter::new("value", DataType::double(None)))
            .build()
            .unwrap();
        dispatcher.register_module(Arc::new(module)).unwrap();
        dispatcher
    }

    async fn run(lines: &[&str], options: HandlerOptions) -> Vec<Message> {
        let dispatcher = dispatcher();
        let (sent, mut received) = mpsc::unbounded_channel();
        let script = Script {
            lines: lines.iter().map(|s| s.to_string()).collect(),
            sent,
            hold: None,
        };
        serve_connection(script, dispatcher.clone(), options, CancellationToken::new()).await;
        assert_eq!(dispatcher.connection_count(), 0);
        let mut out = Vec::new();
        while let Ok(msg) = received.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_error_reply_keeps_connection() {
        let out = run(&["read T:value", "ping x"], HandlerOptions::default()).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].action, "error_read");
        assert_eq!(out[0].specifier.as_deref(), Some("T:value"));
        let data = out[0].data.as_ref().unwrap();
        assert_eq!(data[0], json!("NoSuchModuleError"));
        assert_eq!(data[1], json!("Module 'T' does not exist"));
        assert!(data[2]["exception"].is_string());
        assert_eq!(out[1].action, "pong");
    }

    #[tokio::test]
    async fn test_plain_errors_have_empty_detail() {
        let options = HandlerOptions {
            detailed_errors: false,
        };
        let out = run(&["change mod:value 1"], options).await;
        assert_eq!(out[0].action, "error_change");
        assert_eq!(out[0].data.as_ref().unwrap()[2], json!({}));
    }

    #[tokio::test]
    async fn test_bad_json_is_answered() {
        let out = run(&["change mod:value {nope"], HandlerOptions::default()).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].action, "error_change");
        assert_eq!(out[0].specifier.as_deref(), Some("mod:value"));
        assert_eq!(out[0].data.as_ref().unwrap()[0], json!("BadJSONError"));
    }

    #[tokio::test]
    async fn test_help_lines_then_helping() {
        let out = run(&[""], HandlerOptions::default()).await;
        let last = out.last().unwrap();
        assert_eq!(last.action, "helping");
        assert!(out.len() > 1);
        for (idx, line) in out[..out.len() - 1].iter().enumerate() {
            assert_eq!(line.action, "_");
            assert_eq!(line.specifier.as_deref(), Some(idx.to_string().as_str()));
        }
    }

    #[tokio::test]
    async fn test_events_are_delivered_while_open() {
        let dispatcher = dispatcher();
        let (sent, mut received) = mpsc::unbounded_channel();
        let (release, hold) = tokio::sync::oneshot::channel();
        let script = Script {
            lines: VecDeque::from(["activate".to_string()]),
            sent,
            hold: Some(hold),
        };
        let task = tokio::spawn(serve_connection(
            script,
            dispatcher.clone(),
            HandlerOptions::default(),
            CancellationToken::new(),
        ));

        let baseline = received.recv().await.unwrap();
        assert_eq!(baseline.action, "update");
        assert_eq!(received.recv().await.unwrap().action, "active");

        dispatcher
            .module("mod")
            .unwrap()
            .set_parameter("value", &json!(4.5))
            .unwrap();
        let event = received.recv().await.unwrap();
        assert_eq!(event.to_string().split(' ').take(2).collect::<Vec<_>>(), ["update", "mod:value"]);

        drop(release);
        task.await.unwrap();
        assert_eq!(dispatcher.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_handler() {
        let dispatcher = dispatcher();
        let (sent, _received) = mpsc::unbounded_channel();
        let (_release, hold) = tokio::sync::oneshot::channel();
        let script = Script {
            lines: VecDeque::new(),
            sent,
            hold: Some(hold),
        };
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve_connection(
            script,
            dispatcher.clone(),
            HandlerOptions::default(),
            shutdown.clone(),
        ));
        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(dispatcher.connection_count(), 0);
    }
}
