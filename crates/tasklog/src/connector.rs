use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Sink, Stream};
use opman_common::{authorization_header, CredentialProvider};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::ChannelError;

/// Bidirectional WebSocket message stream.
pub trait FrameSocket:
    Stream<Item = Result<Message, tungstenite::Error>>
    + Sink<Message, Error = tungstenite::Error>
    + Unpin
    + Send
    + 'static
{
}

impl<T> FrameSocket for T where
    T: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin
        + Send
        + 'static
{
}

/// Opens sockets for a channel. Each reconnect attempt calls `connect` again.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Socket: FrameSocket;

    async fn connect(&self, url: &str) -> Result<Self::Socket, ChannelError>;
}

/// `tokio-tungstenite` client that sends the current bearer token with every handshake.
pub struct WsConnector {
    credentials: Arc<dyn CredentialProvider>,
}

impl WsConnector {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn connect(&self, url: &str) -> Result<Self::Socket, ChannelError> {
        let mut request = url
            .into_client_request()
            .map_err(|err| ChannelError::InvalidUrl {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        // Read on every attempt so a refreshed login is picked up after reconnect.
        if let Some(header) = authorization_header(self.credentials.as_ref()) {
            let value = HeaderValue::from_str(&header)
                .map_err(|err| ChannelError::InvalidCredentials(err.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, response) = connect_async(request)
            .await
            .map_err(ChannelError::connect)?;
        debug!(url, status = %response.status(), "websocket handshake complete");
        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opman_common::StaticToken;

    #[tokio::test]
    async fn rejects_unparseable_url() {
        let connector = WsConnector::new(Arc::new(StaticToken::anonymous()));
        let err = connector.connect("not a url").await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn rejects_token_that_is_not_a_header_value() {
        let connector = WsConnector::new(Arc::new(StaticToken::new("line\nbreak")));
        let err = connector
            .connect("ws://127.0.0.1:9/api/ws/tasks/1")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidCredentials(_)));
    }
}
