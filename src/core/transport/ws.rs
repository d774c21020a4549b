//! WebSocket interface: one message per text frame

use super::{serve_connection, Channel, HandlerOptions, TransportError};
use crate::core::codec::{decode_bytes, decode_line, encode_line, Message, WireError};
use crate::core::dispatcher::Dispatch;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A WebSocket client stream
pub struct WsChannel {
    ws: WebSocketStream<TcpStream>,
    peer: SocketAddr,
    session: Uuid,
}

impl WsChannel {
    /// Wrap an upgraded stream
    pub fn new(ws: WebSocketStream<TcpStream>, peer: SocketAddr) -> Self {
        Self {
            ws,
            peer,
            session: Uuid::new_v4(),
        }
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn receive(&mut self) -> Result<Option<Result<Message, WireError>>, TransportError> {
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(Some(decode_line(&text))),
                Some(Ok(WsMessage::Binary(raw))) => return Ok(Some(decode_bytes(&raw))),
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                // ping, pong and raw frames carry no request
                Some(Ok(_)) => continue,
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                )) => return Ok(None),
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            }
        }
    }

    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        self.ws
            .send(WsMessage::Text(encode_line(&msg).into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    fn peer(&self) -> String {
        format!("ws://{} [{}]", self.peer, self.session)
    }

    async fn close(&mut self) {
        self.ws.close(None).await.ok();
    }
}

/// Accept WebSocket clients until `shutdown` is cancelled
pub async fn serve_ws(
    listener: TcpListener,
    dispatch: Arc<dyn Dispatch>,
    options: HandlerOptions,
    shutdown: CancellationToken,
) {
    let local = listener.local_addr().ok();
    info!(interface = ?local, "WebSocket interface listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let dispatch = dispatch.clone();
                    let token = shutdown.child_token();
                    tokio::spawn(async move {
                        match accept_async(stream).await {
                            Ok(ws) => {
                                debug!(%peer, "accepted WebSocket client");
                                serve_connection(WsChannel::new(ws, peer), dispatch, options, token).await;
                            }
                            Err(e) => warn!(%peer, error = %e, "WebSocket handshake failed"),
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
    info!(interface = ?local, "WebSocket interface stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::{Dispatcher, NodeInfo};
    use crate::core::transport::bind_listener;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn test_one_message_per_frame() {
        let dispatcher = Dispatcher::new(NodeInfo::new("eq.ws", ""));
        let shutdown = CancellationToken::new();
        let listener = bind_listener(0, false, &shutdown).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_ws(
            listener,
            dispatcher,
            HandlerOptions::default(),
            shutdown.clone(),
        ));

        let (mut client, _) = connect_async(format!("ws://127.0.0.1:{port}")).await.unwrap();
        client.send(WsMessage::Text("*IDN?".into())).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.into_text().unwrap(), "ISSE&SINE2020,SECoP,V2019-08-20,v1.0 RC2");

        client.send(WsMessage::Text("describe".into())).await.unwrap();
        let reply = client.next().await.unwrap().unwrap().into_text().unwrap();
        assert!(reply.starts_with("describing . {"), "{reply}");
        assert!(reply.contains("\"equipment_id\":\"eq.ws\""));

        shutdown.cancel();
        server.await.unwrap();
    }
}
