//! Request routing: who sent a message and what it asks for.
//!
//! Classification is pure. The router never looks at scheduler state, so a
//! `1` or `2` is always a [`RequestKind::ChoiceAnswer`]; whether it means
//! anything is the scheduler's call.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

use crate::catalog::Category;
use crate::channels::{Attachment, IncomingMessage};
use crate::error::ConfigError;
use crate::scheduler::Requester;

/// Default mirror-domain substitutions, applied to every link.
pub const DEFAULT_REWRITES: &[(&str, &str)] = &[(r"xvideos\.red", "xvideos.com")];

static YOUTUBE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https?://(www\.|m\.|music\.)?(youtube\.com|youtu\.be)/")
        .expect("static pattern")
});

/// Strip transport decorations from an identity: everything after `@`
/// (server part) and after `:` (device suffix).
pub fn normalize_identity(raw: &str) -> &str {
    let user = raw.split('@').next().unwrap_or(raw);
    user.split(':').next().unwrap_or(user).trim()
}

/// Whether `url` points at YouTube.
pub fn is_youtube_url(url: &str) -> bool {
    YOUTUBE_URL.is_match(url.trim())
}

/// One allow-listed identity and the conversation used to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub chat_id: String,
}

impl Identity {
    pub fn new(user_id: &str) -> Self {
        let user_id = normalize_identity(user_id).to_string();
        Self {
            chat_id: user_id.clone(),
            user_id,
        }
    }

    pub fn with_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = chat_id.into();
        self
    }
}

/// The two-member allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identities {
    pub primary: Identity,
    pub secondary: Identity,
}

impl Identities {
    pub fn new(primary: Identity, secondary: Identity) -> Self {
        Self { primary, secondary }
    }

    /// Requester behind `sender_id`, if allow-listed.
    pub fn requester_of(&self, sender_id: &str) -> Option<Requester> {
        let sender = normalize_identity(sender_id);
        if sender.is_empty() {
            None
        } else if sender == self.primary.user_id {
            Some(Requester::Primary)
        } else if sender == self.secondary.user_id {
            Some(Requester::Secondary)
        } else {
            None
        }
    }

    /// Conversation used to reach `requester` directly.
    pub fn chat_for(&self, requester: Requester) -> &str {
        match requester {
            Requester::Primary => &self.primary.chat_id,
            Requester::Secondary => &self.secondary.chat_id,
        }
    }
}

/// Ordered mirror-domain substitutions. The first matching rule wins.
#[derive(Debug, Clone)]
pub struct UrlRewriter {
    rules: Vec<(Regex, String)>,
}

impl UrlRewriter {
    pub fn new<P, R>(rules: impl IntoIterator<Item = (P, R)>) -> Result<Self, ConfigError>
    where
        P: AsRef<str>,
        R: Into<String>,
    {
        let rules = rules
            .into_iter()
            .map(|(pattern, replacement)| {
                let pattern = pattern.as_ref();
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|re| (re, replacement.into()))
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "COURIER_URL_REWRITES".to_string(),
                        message: format!("bad pattern {pattern:?}: {e}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rewrite(&self, url: &str) -> String {
        for (pattern, replacement) in &self.rules {
            if pattern.is_match(url) {
                let rewritten = pattern.replace(url, replacement.as_str()).into_owned();
                tracing::debug!(from = url, to = %rewritten, "Rewrote link");
                return rewritten;
            }
        }
        url.to_string()
    }
}

impl Default for UrlRewriter {
    fn default() -> Self {
        Self {
            rules: DEFAULT_REWRITES
                .iter()
                .filter_map(|(p, r)| {
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .build()
                        .ok()
                        .map(|re| (re, r.to_string()))
                })
                .collect(),
        }
    }
}

/// Dot-prefixed commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `.on` / `.off`.
    Broadcast { online: bool },
    /// `.female` / `.male`.
    RandomPick(Category),
    /// `.letra` / `.lyrics`, with the link if one was given.
    Lyrics(Option<String>),
}

/// What an accepted message asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Command(Command),
    ChoiceAnswer(u8),
    MediaAttachment(Attachment),
    /// Normalized link.
    JobRequest(String),
}

/// An allow-listed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub requester: Requester,
    /// Conversation the request came from; replies go here.
    pub conversation: String,
    pub kind: RequestKind,
}

/// Classification result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Accepted(Request),
    Ignore,
}

/// Classifies inbound messages against the allow-list.
#[derive(Debug, Clone)]
pub struct Router {
    identities: Identities,
    rewriter: UrlRewriter,
}

impl Router {
    pub fn new(identities: Identities, rewriter: UrlRewriter) -> Self {
        Self {
            identities,
            rewriter,
        }
    }

    pub fn classify(&self, message: &IncomingMessage) -> Route {
        // The bot's own account speaks for the Primary.
        let requester = if message.from_me {
            Some(Requester::Primary)
        } else {
            self.identities.requester_of(&message.sender_id)
        };
        let Some(requester) = requester else {
            tracing::debug!(sender = %message.sender_id, "Ignoring message from unknown sender");
            return Route::Ignore;
        };

        let Some(kind) = self.kind_of(message) else {
            return Route::Ignore;
        };
        Route::Accepted(Request {
            requester,
            conversation: message.chat_id.clone(),
            kind,
        })
    }

    fn kind_of(&self, message: &IncomingMessage) -> Option<RequestKind> {
        let text = message.text.trim();

        if let Some(command) = parse_command(text) {
            return Some(RequestKind::Command(command));
        }
        match text {
            "1" => return Some(RequestKind::ChoiceAnswer(1)),
            "2" => return Some(RequestKind::ChoiceAnswer(2)),
            _ => {}
        }
        if let Some(attachment) = &message.attachment {
            return Some(RequestKind::MediaAttachment(attachment.clone()));
        }
        if is_link(text) {
            return Some(RequestKind::JobRequest(self.rewriter.rewrite(text)));
        }
        None
    }
}

fn is_link(text: &str) -> bool {
    let lower = text.get(..8).unwrap_or(text).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn parse_command(text: &str) -> Option<Command> {
    let (head, rest) = match text.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (text, ""),
    };
    let head = head.to_lowercase();
    match head.as_str() {
        ".on" | ".off" if rest.is_empty() => Some(Command::Broadcast {
            online: head == ".on",
        }),
        ".female" if rest.is_empty() => Some(Command::RandomPick(Category::Female)),
        ".male" if rest.is_empty() => Some(Command::RandomPick(Category::Male)),
        ".hentai" if rest.is_empty() => Some(Command::RandomPick(Category::Hentai)),
        ".letra" | ".lyrics" => Some(Command::Lyrics(
            rest.split_whitespace().next().map(str::to_string),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::AttachmentKind;

    fn router() -> Router {
        Router::new(
            Identities::new(
                Identity::new("5528981124442@s.whatsapp.net"),
                Identity::new("351916364782"),
            ),
            UrlRewriter::default(),
        )
    }

    fn from(sender: &str, text: &str) -> IncomingMessage {
        IncomingMessage::new("test", sender, text).with_chat("chat-1")
    }

    fn kind(route: Route) -> RequestKind {
        match route {
            Route::Accepted(r) => r.kind,
            Route::Ignore => panic!("expected accepted route"),
        }
    }

    #[test]
    fn normalizes_server_and_device_suffix() {
        assert_eq!(normalize_identity("5528981124442:30@s.whatsapp.net"), "5528981124442");
        assert_eq!(normalize_identity("12345"), "12345");
        assert_eq!(normalize_identity(""), "");
    }

    #[test]
    fn unknown_sender_is_ignored() {
        assert_eq!(router().classify(&from("999", "https://x.com/v")), Route::Ignore);
    }

    #[test]
    fn own_messages_count_as_primary() {
        let route = router().classify(&from("whoever", ".on").from_self());
        match route {
            Route::Accepted(r) => {
                assert_eq!(r.requester, Requester::Primary);
                assert_eq!(r.kind, RequestKind::Command(Command::Broadcast { online: true }));
            }
            Route::Ignore => panic!("own message ignored"),
        }
    }

    #[test]
    fn identifies_requesters_and_conversation() {
        match router().classify(&from("351916364782:2", "https://x.com/v")) {
            Route::Accepted(r) => {
                assert_eq!(r.requester, Requester::Secondary);
                assert_eq!(r.conversation, "chat-1");
            }
            Route::Ignore => panic!("secondary ignored"),
        }
    }

    #[test]
    fn commands_are_case_insensitive_exact_matches() {
        let r = router();
        let p = "5528981124442";
        assert_eq!(
            kind(r.classify(&from(p, " .OFF "))),
            RequestKind::Command(Command::Broadcast { online: false })
        );
        assert_eq!(
            kind(r.classify(&from(p, ".Female"))),
            RequestKind::Command(Command::RandomPick(Category::Female))
        );
        assert_eq!(
            kind(r.classify(&from(p, ".HENTAI"))),
            RequestKind::Command(Command::RandomPick(Category::Hentai))
        );
        assert_eq!(r.classify(&from(p, ".male please")), Route::Ignore);
        assert_eq!(r.classify(&from(p, ".online")), Route::Ignore);
    }

    #[test]
    fn lyrics_command_carries_link() {
        let r = router();
        let p = "5528981124442";
        assert_eq!(
            kind(r.classify(&from(p, ".letra https://youtu.be/abc"))),
            RequestKind::Command(Command::Lyrics(Some("https://youtu.be/abc".into())))
        );
        assert_eq!(
            kind(r.classify(&from(p, ".LYRICS"))),
            RequestKind::Command(Command::Lyrics(None))
        );
    }

    #[test]
    fn choice_answers() {
        let r = router();
        assert_eq!(
            kind(r.classify(&from("5528981124442", "2"))),
            RequestKind::ChoiceAnswer(2)
        );
        assert_eq!(r.classify(&from("5528981124442", "3")), Route::Ignore);
    }

    #[test]
    fn links_are_rewritten() {
        let r = router();
        assert_eq!(
            kind(r.classify(&from("351916364782", "HTTPS://www.xvideos.RED/video1"))),
            RequestKind::JobRequest("HTTPS://www.xvideos.com/video1".into())
        );
        assert_eq!(
            kind(r.classify(&from("351916364782", "https://youtu.be/x"))),
            RequestKind::JobRequest("https://youtu.be/x".into())
        );
        assert_eq!(r.classify(&from("351916364782", "check http://x")), Route::Ignore);
    }

    #[test]
    fn attachments_become_media_requests() {
        let attachment = Attachment::new(AttachmentKind::Image, "file-1");
        let msg = from("351916364782", "").with_attachment(attachment.clone());
        assert_eq!(
            kind(router().classify(&msg)),
            RequestKind::MediaAttachment(attachment)
        );
    }

    #[test]
    fn custom_rewrite_rules_first_match_wins() {
        let rewriter =
            UrlRewriter::new([("mirror\\.example", "main.example"), ("mirror", "other")]).unwrap();
        assert_eq!(
            rewriter.rewrite("https://mirror.example/a"),
            "https://main.example/a"
        );
        assert!(UrlRewriter::new([("(", "x")]).is_err());
    }

    #[test]
    fn youtube_detection() {
        assert!(is_youtube_url("https://www.youtube.com/watch?v=abc"));
        assert!(is_youtube_url("http://youtu.be/abc"));
        assert!(!is_youtube_url("https://vimeo.com/1"));
    }

    #[test]
    fn chat_lookup() {
        let ids = Identities::new(
            Identity::new("1").with_chat("100"),
            Identity::new("2"),
        );
        assert_eq!(ids.chat_for(Requester::Primary), "100");
        assert_eq!(ids.chat_for(Requester::Secondary), "2");
    }
}
