//! Switch Event Stream
//!
//! Reads the switch's asynchronous event feed from a websocket and forwards
//! decoded [`SwitchEvent`]s over an mpsc channel. Reconnects forever; every
//! successful (re)connection is announced with [`SwitchEvent::Connected`] so
//! the dispatcher can reconcile events missed while disconnected.

use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::Channel;
use crate::config::SwitchConfig;

/// Event vocabulary consumed by the transfer engine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum SwitchEvent {
    /// Channel entered the controlling application
    StasisStart {
        channel: Channel,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Channel left the controlling application
    StasisEnd { channel: Channel },
    ChannelDestroyed { channel: Channel },
    ChannelMohStart { channel: Channel },
    ChannelMohStop { channel: Channel },
    ChannelCallerId { channel: Channel },
    /// Emitted locally after each successful (re)connection
    #[serde(skip)]
    Connected,
    #[serde(other)]
    Other,
}

impl SwitchEvent {
    /// Decode one websocket text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Websocket reader task
pub struct SwitchEventStream {
    url: String,
    reconnect_delay: Duration,
}

impl SwitchEventStream {
    pub fn new(config: &SwitchConfig) -> Self {
        let url = format!(
            "{}?app={}&api_key={}:{}",
            config.ws_url, config.app_name, config.username, config.password
        );
        Self {
            url,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        }
    }

    /// Spawn the reader; events go to `tx` until the receiver is dropped
    pub fn spawn(self, tx: mpsc::Sender<SwitchEvent>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(tx).await })
    }

    async fn run(self, tx: mpsc::Sender<SwitchEvent>) {
        loop {
            match connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!("Connected to switch event stream");
                    if tx.send(SwitchEvent::Connected).await.is_err() {
                        return;
                    }

                    let (_, mut read) = ws_stream.split();
                    while let Some(msg) = read.next().await {
                        match msg {
                            Ok(Message::Text(text)) => match SwitchEvent::parse(&text) {
                                Ok(SwitchEvent::Other) => {}
                                Ok(event) => {
                                    if tx.send(event).await.is_err() {
                                        debug!("Event receiver dropped, stopping stream");
                                        return;
                                    }
                                }
                                Err(e) => warn!(error = %e, "Undecodable switch event"),
                            },
                            Ok(Message::Close(_)) => {
                                warn!("Switch closed the event stream");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(error = %e, "Switch event stream error");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to switch event stream");
                }
            }

            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::ChannelState;

    #[test]
    fn test_parse_stasis_start() {
        let text = r#"{
            "type": "StasisStart",
            "args": ["transfer", "transfer_recipient_called", "01HZX"],
            "channel": {"id": "rcpt-1", "state": "Up"}
        }"#;
        match SwitchEvent::parse(text).unwrap() {
            SwitchEvent::StasisStart { channel, args } => {
                assert_eq!(channel.id, "rcpt-1");
                assert_eq!(channel.state, ChannelState::Up);
                assert_eq!(args.len(), 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_event() {
        let text = r#"{"type": "PlaybackFinished", "playback": {}}"#;
        assert_eq!(SwitchEvent::parse(text).unwrap(), SwitchEvent::Other);
    }

    #[test]
    fn test_parse_destroyed() {
        let text = r#"{"type": "ChannelDestroyed", "channel": {"id": "c1", "state": "Down"}}"#;
        assert!(matches!(
            SwitchEvent::parse(text).unwrap(),
            SwitchEvent::ChannelDestroyed { .. }
        ));
    }
}
