//! Notification layer: turns scheduler and job events into chat messages
//! and addresses them to the right conversation.

use std::sync::Arc;

use crate::catalog::Category;
use crate::channels::Channel;
use crate::error::ChannelError;
use crate::router::Identities;
use crate::scheduler::{AccountSlot, Destination, Requester};

/// Who a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// A specific conversation (usually where the request came from).
    Conversation(String),
    /// A requester's own chat, looked up in the identity directory.
    Requester(Requester),
}

/// Something worth telling a requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    // Job lifecycle
    Starting,
    Fetched,
    Delivered {
        destination: Destination,
        link: Option<String>,
    },
    AuthInvalid {
        destination: Destination,
    },
    UploadFailed,
    FetchFailed,
    /// Cross-notification: the other requester's job delivered `title`.
    PartnerDelivered {
        title: String,
        destination: Destination,
    },

    // Scheduling
    BusySelf,
    BusyOther,
    QueuedBehindChoice,
    YourTurn,
    ChoicePrompt,
    ChoiceAccepted {
        account: AccountSlot,
    },
    QueuedAfterChoice,

    // Commands
    BroadcastConfirmed {
        online: bool,
    },
    BroadcastAnnouncement {
        online: bool,
    },
    CatalogPick {
        category: Category,
        item: String,
    },
    CatalogEmpty {
        category: Category,
    },
    CatalogUnavailable,
    LyricsUsage,
    LyricsNotYoutube,
    LyricsStarted,
    LyricsCaptionsFetched,
    Lyrics {
        text: String,
    },
    LyricsNoSubtitles,
    LyricsNotConfigured,
    LyricsFailed {
        reason: String,
    },
}

/// A rendered-on-send message produced by the scheduler or a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub recipient: Recipient,
    /// The requester who will read it; picks the form of address.
    pub audience: Requester,
    pub notice: Notice,
}

impl Outbound {
    pub fn to_conversation(target: impl Into<String>, audience: Requester, notice: Notice) -> Self {
        Self {
            recipient: Recipient::Conversation(target.into()),
            audience,
            notice,
        }
    }

    pub fn to_requester(audience: Requester, notice: Notice) -> Self {
        Self {
            recipient: Recipient::Requester(audience),
            audience,
            notice,
        }
    }
}

/// Renders notices into message text.
#[derive(Debug, Clone)]
pub struct Notifier {
    primary_name: String,
    secondary_name: String,
    account_labels: [String; 2],
}

impl Notifier {
    pub fn new(
        primary_name: impl Into<String>,
        secondary_name: impl Into<String>,
        account_labels: [String; 2],
    ) -> Self {
        Self {
            primary_name: primary_name.into(),
            secondary_name: secondary_name.into(),
            account_labels,
        }
    }

    fn name_of(&self, requester: Requester) -> &str {
        match requester {
            Requester::Primary => &self.primary_name,
            Requester::Secondary => &self.secondary_name,
        }
    }

    fn account_label(&self, account: AccountSlot) -> &str {
        match account {
            AccountSlot::First => &self.account_labels[0],
            AccountSlot::Second => &self.account_labels[1],
        }
    }

    fn describe(&self, destination: &Destination) -> String {
        match destination {
            Destination::PhotoLibrary { account } => format!(
                "account {} ({})",
                account.number(),
                self.account_label(*account)
            ),
            Destination::FileHost => "the file host".to_string(),
        }
    }

    /// Render a notice for `audience`.
    pub fn render(&self, notice: &Notice, audience: Requester) -> String {
        let name = self.name_of(audience);
        let other = self.name_of(audience.other());

        match notice {
            Notice::Starting => format!("On it, {name}! Fetching your link now."),
            Notice::Fetched => "Download finished, uploading it now.".to_string(),
            Notice::Delivered {
                destination,
                link: Some(link),
            } => format!(
                "Done, {name}! Uploaded to {}.\n\n🔗 {link}",
                self.describe(destination)
            ),
            Notice::Delivered {
                destination,
                link: None,
            } => format!("Done, {name}! Saved to {}.", self.describe(destination)),
            Notice::AuthInvalid { destination } => format!(
                "The authorization for {} stopped working and was cleared. \
                 Please re-authenticate it from the console.",
                self.describe(destination)
            ),
            Notice::UploadFailed => {
                "The upload failed. Please try again in a little while.".to_string()
            }
            Notice::FetchFailed => "The download failed. The link may be invalid or the \
                                    connection dropped."
                .to_string(),
            Notice::PartnerDelivered { title, destination } => format!(
                "Heads up, {name}: {other} just saved *{title}* to {}.",
                self.describe(destination)
            ),
            Notice::BusySelf => {
                "Still working on your previous request. One at a time, please!".to_string()
            }
            Notice::BusyOther => format!(
                "I'm busy with a request from {other}. You're in the queue and I'll \
                 start yours as soon as it's done."
            ),
            Notice::QueuedBehindChoice => format!(
                "Waiting on {other} to pick a destination. You're in the queue."
            ),
            Notice::YourTurn => format!("Your turn, {name}! Starting your request..."),
            Notice::ChoicePrompt => format!(
                "Which account, {name}?\n\n*1*: {}\n*2*: {}",
                self.account_labels[0], self.account_labels[1]
            ),
            Notice::ChoiceAccepted { account } => format!(
                "Got it, using account {} ({}).",
                account.number(),
                self.account_label(*account)
            ),
            Notice::QueuedAfterChoice => {
                "There's already someone in line; I'll start yours when it's your turn."
                    .to_string()
            }
            Notice::BroadcastConfirmed { online: true } => {
                format!("Told {other} that I'm back online.")
            }
            Notice::BroadcastConfirmed { online: false } => {
                format!("Told {other} that I'm going offline.")
            }
            Notice::BroadcastAnnouncement { online: true } => {
                format!("Hey {name}, I'm back online and taking requests again!")
            }
            Notice::BroadcastAnnouncement { online: false } => {
                format!("Hey {name}, I'm taking a break for now. Back later!")
            }
            Notice::CatalogPick { category, item } => {
                format!("{} *{item}*, here's a {category} pick for you, {name}!", category.emoji())
            }
            Notice::CatalogEmpty { category } => {
                format!("There are no {category} entries in the list yet.")
            }
            Notice::CatalogUnavailable => "I couldn't read the list file.".to_string(),
            Notice::LyricsUsage => {
                "Send the YouTube link along with the command.\nExample: `.letra https://youtube.com/watch?v=...`"
                    .to_string()
            }
            Notice::LyricsNotYoutube => "That command only works with YouTube links.".to_string(),
            Notice::LyricsStarted => format!("Got it, {name}! Fetching the captions..."),
            Notice::LyricsCaptionsFetched => {
                "Captions downloaded, cleaning up the lyrics now...".to_string()
            }
            Notice::Lyrics { text } => format!("✨ *Lyrics* ✨\n\n{text}"),
            Notice::LyricsNoSubtitles => "This video has no manual Portuguese subtitles, and \
                                          automatic ones aren't supported. Try another video?"
                .to_string(),
            Notice::LyricsNotConfigured => {
                "The text-cleanup API key is not configured.".to_string()
            }
            Notice::LyricsFailed { reason } => format!("Something went wrong: {reason}"),
        }
    }
}

/// Renders outbound notices and sends them through the transport.
#[derive(Clone)]
pub struct Outbox {
    channel: Arc<dyn Channel>,
    notifier: Notifier,
    identities: Identities,
}

impl Outbox {
    pub fn new(channel: Arc<dyn Channel>, notifier: Notifier, identities: Identities) -> Self {
        Self {
            channel,
            notifier,
            identities,
        }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Conversation an outbound message goes to.
    pub fn resolve<'a>(&'a self, recipient: &'a Recipient) -> &'a str {
        match recipient {
            Recipient::Conversation(chat) => chat,
            Recipient::Requester(requester) => self.identities.chat_for(*requester),
        }
    }

    pub async fn deliver(&self, outbound: &Outbound) -> Result<(), ChannelError> {
        let chat = self.resolve(&outbound.recipient);
        let text = self.notifier.render(&outbound.notice, outbound.audience);
        self.channel.send(chat, &text).await.inspect_err(|e| {
            tracing::warn!(chat, notice = ?outbound.notice, error = %e, "Failed to deliver notice");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> Notifier {
        Notifier::new(
            "Boss",
            "Queen",
            ["first@example.com".to_string(), "second@example.com".to_string()],
        )
    }

    #[test]
    fn choice_prompt_lists_both_accounts() {
        let text = notifier().render(&Notice::ChoicePrompt, Requester::Primary);
        assert!(text.contains("*1*: first@example.com"));
        assert!(text.contains("*2*: second@example.com"));
    }

    #[test]
    fn partner_notice_names_the_other_requester_and_title() {
        let text = notifier().render(
            &Notice::PartnerDelivered {
                title: "My_Video".into(),
                destination: Destination::DEFAULT_LIBRARY,
            },
            Requester::Primary,
        );
        assert!(text.contains("Queen"));
        assert!(text.contains("My_Video"));
        assert!(text.contains("account 1"));
    }

    #[test]
    fn delivered_with_link_includes_link() {
        let text = notifier().render(
            &Notice::Delivered {
                destination: Destination::FileHost,
                link: Some("https://files.example/abc".into()),
            },
            Requester::Secondary,
        );
        assert!(text.contains("https://files.example/abc"));
        assert!(text.contains("Queen"));
    }

    #[test]
    fn busy_other_mentions_holder() {
        let text = notifier().render(&Notice::BusyOther, Requester::Secondary);
        assert!(text.contains("Boss"));
    }

    #[test]
    fn outbound_constructors() {
        let o = Outbound::to_requester(Requester::Primary, Notice::YourTurn);
        assert_eq!(o.recipient, Recipient::Requester(Requester::Primary));
        let o = Outbound::to_conversation("c1", Requester::Secondary, Notice::BusySelf);
        assert_eq!(o.recipient, Recipient::Conversation("c1".into()));
    }

    use crate::channels::{Attachment, EventStream};
    use crate::router::Identity;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl Channel for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        async fn start(&self) -> Result<EventStream, ChannelError> {
            Ok(Box::pin(futures::stream::empty()))
        }
        async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
            self.0.lock().unwrap().push((chat_id.to_string(), text.to_string()));
            Ok(())
        }
        async fn download_attachment(
            &self,
            _attachment: &Attachment,
            _dest_dir: &Path,
        ) -> Result<PathBuf, ChannelError> {
            unreachable!()
        }
        async fn health_check(&self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn outbox_resolves_requester_chats() {
        let channel = Arc::new(Recorder::default());
        let outbox = Outbox::new(
            channel.clone(),
            notifier(),
            Identities::new(Identity::new("1").with_chat("primary-dm"), Identity::new("2")),
        );

        outbox
            .deliver(&Outbound::to_requester(Requester::Primary, Notice::YourTurn))
            .await
            .unwrap();
        outbox
            .deliver(&Outbound::to_conversation("group", Requester::Secondary, Notice::BusySelf))
            .await
            .unwrap();

        let sent = channel.0.lock().unwrap();
        assert_eq!(sent[0].0, "primary-dm");
        assert!(sent[0].1.contains("Boss"));
        assert_eq!(sent[1].0, "group");
    }
}
