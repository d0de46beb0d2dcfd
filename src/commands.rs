//! Handlers for dot-commands. None of them enter the scheduler.

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::error::ChannelError;
use crate::lyrics::LyricsService;
use crate::notify::{Notice, Outbound, Outbox};
use crate::router::{Command, is_youtube_url};
use crate::scheduler::Requester;

pub struct CommandHandler {
    outbox: Outbox,
    catalog: Catalog,
    lyrics: Arc<LyricsService>,
}

impl CommandHandler {
    pub fn new(outbox: Outbox, catalog: Catalog, lyrics: Arc<LyricsService>) -> Self {
        Self {
            outbox,
            catalog,
            lyrics,
        }
    }

    pub async fn handle(
        &self,
        requester: Requester,
        conversation: &str,
        command: Command,
    ) -> Result<(), ChannelError> {
        let reply = |notice| Outbound::to_conversation(conversation, requester, notice);

        match command {
            Command::Broadcast { online } => {
                if requester != Requester::Primary {
                    tracing::debug!(%requester, "Ignoring broadcast from non-primary requester");
                    return Ok(());
                }
                self.outbox
                    .deliver(&reply(Notice::BroadcastConfirmed { online }))
                    .await?;
                self.outbox
                    .deliver(&Outbound::to_requester(
                        Requester::Secondary,
                        Notice::BroadcastAnnouncement { online },
                    ))
                    .await
            }
            Command::RandomPick(category) => {
                let notice = match self.catalog.pick(category).await {
                    Ok(Some(item)) => Notice::CatalogPick { category, item },
                    Ok(None) => Notice::CatalogEmpty { category },
                    Err(e) => {
                        tracing::error!(error = %e, "Catalog lookup failed");
                        Notice::CatalogUnavailable
                    }
                };
                self.outbox.deliver(&reply(notice)).await
            }
            Command::Lyrics(None) => self.outbox.deliver(&reply(Notice::LyricsUsage)).await,
            Command::Lyrics(Some(url)) if !is_youtube_url(&url) => {
                self.outbox.deliver(&reply(Notice::LyricsNotYoutube)).await
            }
            Command::Lyrics(Some(url)) => {
                let lyrics = Arc::clone(&self.lyrics);
                let conversation = conversation.to_string();
                tokio::spawn(async move {
                    lyrics.run(requester, &conversation, &url).await;
                });
                Ok(())
            }
        }
    }
}
