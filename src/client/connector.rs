//! Socket and HTTP I/O for the viewer
//!
//! Each connection runs in its own task and reports back to the session
//! through [`TransportEvent`]s, tagged with the connection number so events
//! from a superseded socket can be told apart.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::client::transport::BackfillData;
use crate::error::TransportError;
use crate::protocol::{ClientMessage, LogEntry, StreamEntry};

/// Everything the I/O tasks report to the session
#[derive(Debug)]
pub enum TransportEvent {
    Opened {
        connection: u64,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    },
    Frame {
        connection: u64,
        text: String,
    },
    Closed {
        connection: u64,
        code: Option<u16>,
        reason: String,
    },
    Backfill {
        room: String,
        result: Result<BackfillData, TransportError>,
    },
}

/// Open a WebSocket and pump frames until it closes
pub fn spawn_connection(
    connection: u64,
    url: Url,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (code, reason) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _response)) => pump(connection, socket, &events).await,
            Err(e) => (None, e.to_string()),
        };
        let _ = events.send(TransportEvent::Closed {
            connection,
            code,
            reason,
        });
    })
}

async fn pump<S>(
    connection: u64,
    socket: S,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> (Option<u16>, String)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();

    if events
        .send(TransportEvent::Opened {
            connection,
            outbound: outbound_tx,
        })
        .is_err()
    {
        return (None, "session closed".to_string());
    }

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => match outgoing {
                Some(message) => match message.to_json() {
                    Ok(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            return (None, e.to_string());
                        }
                    }
                    Err(e) => tracing::warn!("Failed to encode {:?}: {}", message, e),
                },
                None => {
                    let _ = sink.close().await;
                    return (None, "closed by viewer".to_string());
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Frame { connection, text });
                }
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return (None, e.to_string()),
                None => return (None, "connection reset".to_string()),
            },
        }
    }
}

/// REST client for history backfill
pub struct BackfillClient {
    client: Client<HttpConnector, Empty<Bytes>>,
    base: Url,
    token: Option<String>,
    entry_limit: usize,
    stream_limit: usize,
}

impl BackfillClient {
    /// Derive the HTTP base from the WebSocket URL (`ws://host:port/ws`)
    pub fn new(
        server_url: &str,
        token: Option<String>,
        entry_limit: usize,
        stream_limit: usize,
    ) -> Result<Self, TransportError> {
        let mut base = Url::parse(server_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", server_url, e)))?;
        let scheme = match base.scheme() {
            "ws" | "http" => "http",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme '{}' for backfill",
                    other
                )))
            }
        };
        base.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidUrl(server_url.to_string()))?;
        base.set_path("/");
        base.set_query(None);

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base,
            token,
            entry_limit,
            stream_limit,
        })
    }

    fn endpoint(&self, path: &str, params: &[(&str, String)]) -> Result<Url, TransportError> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }

    /// `/api/streams/{channel}` with the channel name percent-encoded
    fn stream_endpoint(&self, room: &str, channel: &str) -> Result<Url, TransportError> {
        let mut url = self.endpoint(
            "api/streams/",
            &[("room", room.to_string()), ("limit", self.stream_limit.to_string())],
        )?;
        let shown = url.to_string();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(shown))?
            .pop_if_empty()
            .push(channel);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, TransportError> {
        let uri = hyper::Uri::try_from(url.as_str())
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        let response = self
            .client
            .get(uri)
            .await
            .map_err(|e| TransportError::Backfill(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Backfill(e.to_string()))?
            .to_bytes();
        serde_json::from_slice(&body).map_err(|e| TransportError::Backfill(e.to_string()))
    }

    /// Fetch recent entries plus history for the wanted stream channels
    pub async fn fetch(&self, room: &str, channels: &[String]) -> Result<BackfillData, TransportError> {
        let url = self.endpoint(
            "api/entries",
            &[("room", room.to_string()), ("limit", self.entry_limit.to_string())],
        )?;
        let entries: Vec<LogEntry> = self.get_json(url).await?;

        let url = self.endpoint("api/streams", &[("room", room.to_string())])?;
        let available: Vec<String> = self.get_json(url).await?;

        let mut streams = Vec::new();
        for channel in available.into_iter().filter(|c| channels.contains(c)) {
            let url = self.stream_endpoint(room, &channel)?;
            let samples: Vec<StreamEntry> = self.get_json(url).await?;
            streams.push((channel, samples));
        }

        tracing::debug!(
            "Backfilled {} entries and {} channels for room '{}'",
            entries.len(),
            streams.len(),
            room
        );
        Ok(BackfillData { entries, streams })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backfill_base_from_ws_url() {
        let client = BackfillClient::new("ws://10.0.0.5:7070/ws?token=x", Some("t".into()), 10, 5).unwrap();
        let url = client
            .endpoint("api/entries", &[("room", "ops".into()), ("limit", "10".into())])
            .unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.5:7070/api/entries?room=ops&limit=10&token=t");
    }

    #[test]
    fn test_stream_endpoint_encodes_channel() {
        let client = BackfillClient::new("ws://10.0.0.5:7070/ws", None, 10, 5).unwrap();
        let url = client.stream_endpoint("ops", "gpu temp/0").unwrap();
        assert_eq!(
            url.as_str(),
            "http://10.0.0.5:7070/api/streams/gpu%20temp%2F0?room=ops&limit=5"
        );
    }

    #[test]
    fn test_backfill_rejects_tls_scheme() {
        assert!(matches!(
            BackfillClient::new("wss://example.com/ws", None, 10, 5),
            Err(TransportError::InvalidUrl(_))
        ));
    }
}
