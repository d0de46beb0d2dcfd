//! Lyrics command: manual captions in, cleaned lyrics out.
//!
//! Runs outside the single-flight slot; it is a quick text job and never
//! touches the shared artifact directory.

use std::sync::Arc;

use crate::error::{Error, FetchError, LlmError};
use crate::executors::{CaptionFetcher, TextPipeline};
use crate::notify::{Notice, Outbound, Outbox};
use crate::scheduler::Requester;

pub struct LyricsService {
    captions: Arc<dyn CaptionFetcher>,
    pipeline: Arc<dyn TextPipeline>,
    outbox: Outbox,
}

impl LyricsService {
    pub fn new(
        captions: Arc<dyn CaptionFetcher>,
        pipeline: Arc<dyn TextPipeline>,
        outbox: Outbox,
    ) -> Self {
        Self {
            captions,
            pipeline,
            outbox,
        }
    }

    /// Fetch and clean the lyrics for `url`, reporting progress to
    /// `conversation`.
    pub async fn run(&self, requester: Requester, conversation: &str, url: &str) {
        let notice = match self.transcribe(requester, conversation, url).await {
            Ok(text) => Notice::Lyrics { text },
            Err(e) => {
                tracing::warn!(url, error = %e, "Lyrics request failed");
                failure_notice(&e)
            }
        };
        let outbound = Outbound::to_conversation(conversation, requester, notice);
        // Delivery failures are already logged by the outbox.
        let _ = self.outbox.deliver(&outbound).await;
    }

    async fn transcribe(
        &self,
        requester: Requester,
        conversation: &str,
        url: &str,
    ) -> Result<String, Error> {
        self.progress(requester, conversation, Notice::LyricsStarted)
            .await?;
        let raw = self.captions.fetch_captions(url).await?;
        tracing::info!(url, chars = raw.chars().count(), "Captions fetched");
        self.progress(requester, conversation, Notice::LyricsCaptionsFetched)
            .await?;
        Ok(self.pipeline.clean(&raw).await?)
    }

    async fn progress(
        &self,
        requester: Requester,
        conversation: &str,
        notice: Notice,
    ) -> Result<(), Error> {
        self.outbox
            .deliver(&Outbound::to_conversation(conversation, requester, notice))
            .await?;
        Ok(())
    }
}

fn failure_notice(error: &Error) -> Notice {
    match error {
        Error::Fetch(FetchError::NoManualSubtitles) => Notice::LyricsNoSubtitles,
        Error::Llm(LlmError::NotConfigured { .. }) => Notice::LyricsNotConfigured,
        other => Notice::LyricsFailed {
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;

    #[test]
    fn maps_errors_to_notices() {
        assert_eq!(
            failure_notice(&FetchError::NoManualSubtitles.into()),
            Notice::LyricsNoSubtitles
        );
        assert_eq!(
            failure_notice(
                &LlmError::NotConfigured {
                    provider: "gemini".into()
                }
                .into()
            ),
            Notice::LyricsNotConfigured
        );
        let other: Error = ChannelError::SendFailed {
            name: "t".into(),
            reason: "down".into(),
        }
        .into();
        assert!(matches!(failure_notice(&other), Notice::LyricsFailed { .. }));
    }
}
