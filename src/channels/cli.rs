//! CLI channel: stdin/stdout REPL for local testing.
//!
//! Every line typed here counts as authored by the bot's own account, so the
//! operator drives the courier as the Primary requester.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channels::{Attachment, Channel, EventStream, IncomingMessage, TransportEvent};
use crate::error::ChannelError;

const CLI_ACCOUNT: &str = "local-user";

/// A simple CLI channel that reads from stdin and writes to stdout.
pub struct CliChannel;

impl CliChannel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<EventStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let _ = tx.send(TransportEvent::Connected {
            account_id: CLI_ACCOUNT.to_string(),
        });

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            eprint!("> ");
                            continue;
                        }
                        let msg = IncomingMessage::new("cli", CLI_ACCOUNT, &line).from_self();
                        if tx.send(TransportEvent::Message(msg)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(&self, _chat_id: &str, text: &str) -> Result<(), ChannelError> {
        println!("\n{}\n", text);
        eprint!("> ");
        Ok(())
    }

    async fn download_attachment(
        &self,
        _attachment: &Attachment,
        _dest_dir: &Path,
    ) -> Result<PathBuf, ChannelError> {
        Err(ChannelError::Unsupported {
            name: "cli".into(),
            operation: "attachments".into(),
        })
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
