//! WebSocket push channel: one trade JSON document per text frame.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use super::{PushChannel, PushStream};

/// Push channel over a plain WebSocket connection.
#[derive(Debug, Clone)]
pub struct WsPushChannel {
    url: String,
}

impl WsPushChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn connect(&self) -> Result<PushStream> {
        info!(url = %self.url, "Connecting push channel");
        let (socket, _response) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", self.url))?;

        // Control frames are answered by tungstenite; a close frame ends the stream.
        let stream = socket
            .take_while(|frame| futures::future::ready(!matches!(frame, Ok(Message::Close(_)))))
            .filter_map(|frame| async move {
                match frame {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => Some(
                        String::from_utf8(bytes).context("Push frame is not valid UTF-8"),
                    ),
                    Ok(other) => {
                        debug!(frame = ?other, "Ignoring control frame");
                        None
                    }
                    Err(e) => Some(Err(anyhow::Error::new(e).context("Push channel read failed"))),
                }
            });

        Ok(stream.boxed())
    }
}
