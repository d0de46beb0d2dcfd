//! Job, requester and destination types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channels::Attachment;

/// One of the two identities allowed to submit work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requester {
    Primary,
    Secondary,
}

impl Requester {
    /// The other allow-listed requester.
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        };
        write!(f, "{s}")
    }
}

/// Photo-library account a Primary job can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountSlot {
    First,
    Second,
}

impl AccountSlot {
    /// Map a numeric choice reply (`1` / `2`) to a slot.
    pub fn from_choice(choice: u8) -> Option<Self> {
        match choice {
            1 => Some(Self::First),
            2 => Some(Self::Second),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::First => 1,
            Self::Second => 2,
        }
    }
}

/// Where a job's artifact gets uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Destination {
    /// Photo library account.
    PhotoLibrary { account: AccountSlot },
    /// Generic file host; answers with a share link.
    FileHost,
}

impl Destination {
    pub const DEFAULT_LIBRARY: Destination = Destination::PhotoLibrary {
        account: AccountSlot::First,
    };
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PhotoLibrary { account } => write!(f, "photo library #{}", account.number()),
            Self::FileHost => write!(f, "file host"),
        }
    }
}

/// What a job fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Remote link, already normalized by the router.
    Url(String),
    /// Media blob held by the transport.
    Attachment(Attachment),
}

impl Resource {
    /// Destination used when nobody picked one.
    pub fn default_destination(&self) -> Destination {
        match self {
            Self::Url(_) => Destination::DEFAULT_LIBRARY,
            Self::Attachment(_) => Destination::FileHost,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => write!(f, "{url}"),
            Self::Attachment(a) => write!(f, "attachment {}", a.file_id),
        }
    }
}

/// A unit of work.
///
/// Jobs are never edited in place; resolving the destination consumes the
/// job and returns a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: Uuid,
    pub requester: Requester,
    pub resource: Resource,
    /// `None` until resolved; resolution happens when the job starts.
    pub destination: Option<Destination>,
    /// Conversation that receives this job's status messages.
    pub target: String,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(requester: Requester, resource: Resource, target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester,
            resource,
            destination: None,
            target: target.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_destination(self, destination: Destination) -> Self {
        Self {
            destination: Some(destination),
            ..self
        }
    }

    /// Fill in the resource's default destination if none was chosen.
    pub fn resolved(self) -> Self {
        match self.destination {
            Some(_) => self,
            None => {
                let destination = self.resource.default_destination();
                self.with_destination(destination)
            }
        }
    }

    /// Primary link submissions wait for an interactive account choice.
    pub fn needs_choice(&self) -> bool {
        self.requester == Requester::Primary
            && self.destination.is_none()
            && matches!(self.resource, Resource::Url(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::AttachmentKind;

    fn url_job(requester: Requester) -> Job {
        Job::new(requester, Resource::Url("https://example.com/v".into()), "chat")
    }

    #[test]
    fn requester_other_flips() {
        assert_eq!(Requester::Primary.other(), Requester::Secondary);
        assert_eq!(Requester::Secondary.other(), Requester::Primary);
    }

    #[test]
    fn account_slot_from_choice() {
        assert_eq!(AccountSlot::from_choice(1), Some(AccountSlot::First));
        assert_eq!(AccountSlot::from_choice(2), Some(AccountSlot::Second));
        assert_eq!(AccountSlot::from_choice(3), None);
        assert_eq!(AccountSlot::from_choice(0), None);
    }

    #[test]
    fn resolution_produces_new_job_with_same_identity() {
        let job = url_job(Requester::Secondary);
        let id = job.id;
        let resolved = job.resolved();
        assert_eq!(resolved.id, id);
        assert_eq!(resolved.destination, Some(Destination::DEFAULT_LIBRARY));
    }

    #[test]
    fn resolution_keeps_explicit_choice() {
        let chosen = Destination::PhotoLibrary {
            account: AccountSlot::Second,
        };
        let job = url_job(Requester::Primary).with_destination(chosen).resolved();
        assert_eq!(job.destination, Some(chosen));
    }

    #[test]
    fn attachments_default_to_file_host() {
        let job = Job::new(
            Requester::Primary,
            Resource::Attachment(Attachment::new(AttachmentKind::Image, "f")),
            "chat",
        );
        assert!(!job.needs_choice());
        assert_eq!(job.resolved().destination, Some(Destination::FileHost));
    }

    #[test]
    fn only_primary_links_need_choice() {
        assert!(url_job(Requester::Primary).needs_choice());
        assert!(!url_job(Requester::Secondary).needs_choice());
    }

    #[test]
    fn destination_display() {
        assert_eq!(Destination::DEFAULT_LIBRARY.to_string(), "photo library #1");
        assert_eq!(Destination::FileHost.to_string(), "file host");
    }
}
