//! Decides when a poll's tallies may be disclosed.
//!
//! | mode             | before expiry          | after expiry |
//! |------------------|------------------------|--------------|
//! | `always`         | shown                  | shown        |
//! | `after_vote`     | shown once voted       | shown        |
//! | `after_deadline` | withheld (if deadline) | shown        |

use chrono::{DateTime, Utc};

use crate::models::{Poll, ResultsVisibility};

/// Why results are withheld, phrased as when they become available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Withheld {
    UntilVoted,
    UntilExpired,
}

impl Withheld {
    pub fn reason(&self) -> &'static str {
        match self {
            Withheld::UntilVoted => "after voting",
            Withheld::UntilExpired => "when poll expires",
        }
    }
}

/// What the requester has to prove before results are shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Nothing,
    HasVoted,
    Blocked(Withheld),
}

pub fn requirement(poll: &Poll, now: DateTime<Utc>) -> Requirement {
    match poll.results_visibility {
        ResultsVisibility::Always => Requirement::Nothing,
        ResultsVisibility::AfterVote if poll.is_expired(now) => Requirement::Nothing,
        ResultsVisibility::AfterVote => Requirement::HasVoted,
        ResultsVisibility::AfterDeadline => match poll.expires_at {
            Some(deadline) if deadline > now => Requirement::Blocked(Withheld::UntilExpired),
            _ => Requirement::Nothing,
        },
    }
}

pub fn check(poll: &Poll, has_voted: bool, now: DateTime<Utc>) -> Result<(), Withheld> {
    match requirement(poll, now) {
        Requirement::Nothing => Ok(()),
        Requirement::HasVoted if has_voted => Ok(()),
        Requirement::HasVoted => Err(Withheld::UntilVoted),
        Requirement::Blocked(withheld) => Err(withheld),
    }
}

pub fn may_show_results(poll: &Poll, has_voted: bool, now: DateTime<Utc>) -> bool {
    check(poll, has_voted, now).is_ok()
}
