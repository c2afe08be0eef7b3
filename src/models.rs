// models.rs
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// When a poll's vote tallies may be disclosed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultsVisibility {
    #[default]
    Always,
    AfterVote,
    AfterDeadline,
}

impl ResultsVisibility {
    pub const SAFELIST: [&'static str; 3] = ["always", "after_vote", "after_deadline"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultsVisibility::Always => "always",
            ResultsVisibility::AfterVote => "after_vote",
            ResultsVisibility::AfterDeadline => "after_deadline",
        }
    }
}

impl fmt::Display for ResultsVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVisibility(pub String);

impl FromStr for ResultsVisibility {
    type Err = UnknownVisibility;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(ResultsVisibility::Always),
            "after_vote" => Ok(ResultsVisibility::AfterVote),
            "after_deadline" => Ok(ResultsVisibility::AfterDeadline),
            other => Err(UnknownVisibility(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOption {
    pub id: Uuid,
    pub value: String,
    /// Zero-based place of the option in the list.
    pub position: i32,
    pub vote_count: i64,
}

impl PollOption {
    /// An option that has not been persisted yet. The store assigns the id.
    pub fn new(value: impl Into<String>, position: i32) -> Self {
        PollOption {
            id: Uuid::nil(),
            value: value.into(),
            position,
            vote_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poll {
    pub id: Uuid,
    pub question: String,
    pub description: Option<String>,
    pub options: Vec<PollOption>,
    pub results_visibility: ResultsVisibility,
    pub is_private: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Poll {
    /// A poll that has not been persisted yet.
    pub fn draft(question: impl Into<String>, options: Vec<PollOption>) -> Self {
        let now = Utc::now();
        Poll {
            id: Uuid::nil(),
            question: question.into(),
            description: None,
            options,
            results_visibility: ResultsVisibility::Always,
            is_private: false,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A poll with a deadline is expired from that instant on.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }

    pub fn option(&self, option_id: Uuid) -> Option<&PollOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    pub fn sort_options(&mut self) {
        self.options.sort_by_key(|o| o.position);
    }
}

/// Public representation of an option. Vote counts are only disclosed
/// through [`OptionResult`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionView {
    pub id: Uuid,
    pub value: String,
    pub position: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollView {
    pub id: Uuid,
    pub question: String,
    pub description: Option<String>,
    pub options: Vec<OptionView>,
    pub results_visibility: ResultsVisibility,
    pub is_private: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Poll> for PollView {
    fn from(poll: &Poll) -> Self {
        let mut options: Vec<OptionView> = poll
            .options
            .iter()
            .map(|o| OptionView {
                id: o.id,
                value: o.value.clone(),
                position: o.position,
            })
            .collect();
        options.sort_by_key(|o| o.position);

        PollView {
            id: poll.id,
            question: poll.question.clone(),
            description: poll.description.clone(),
            options,
            results_visibility: poll.results_visibility,
            is_private: poll.is_private,
            expires_at: poll.expires_at,
            created_at: poll.created_at,
            updated_at: poll.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionResult {
    pub id: Uuid,
    pub value: String,
    pub position: i32,
    pub vote_count: i64,
}

impl From<PollOption> for OptionResult {
    fn from(option: PollOption) -> Self {
        OptionResult {
            id: option.id,
            value: option.value,
            position: option.position,
            vote_count: option.vote_count,
        }
    }
}

/// Returned exactly once, when a poll is created.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedPoll {
    pub poll: PollView,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionInput {
    pub value: String,
    pub position: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePollInput {
    #[serde(default)]
    pub question: String,
    pub description: Option<String>,
    #[serde(default)]
    pub options: Vec<OptionInput>,
    pub expires_at: Option<DateTime<Utc>>,
    pub results_visibility: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePollInput {
    pub question: Option<String>,
    pub description: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UpdatePollInput {
    pub fn is_empty(&self) -> bool {
        self.question.is_none() && self.description.is_none() && self.expires_at.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionValueInput {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionPosition {
    pub id: Uuid,
    pub position: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositionInput {
    #[serde(default)]
    pub options: Vec<OptionPosition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    CreatedAt,
    Question,
}

impl SortKey {
    pub fn column(&self) -> &'static str {
        match self {
            SortKey::CreatedAt => "created_at",
            SortKey::Question => "question",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn keyword(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

/// Validated paging and sorting for poll listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filters {
    pub page: i64,
    pub page_size: i64,
    pub sort: SortKey,
    pub direction: SortDirection,
}

impl Default for Filters {
    fn default() -> Self {
        Filters {
            page: 1,
            page_size: 20,
            sort: SortKey::CreatedAt,
            direction: SortDirection::Descending,
        }
    }
}

impl Filters {
    pub fn limit(&self) -> i64 {
        self.page_size
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.page_size
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub current_page: i64,
    pub page_size: i64,
    pub first_page: i64,
    pub last_page: i64,
    pub total_records: i64,
}

impl Metadata {
    pub fn calculate(total_records: i64, page: i64, page_size: i64) -> Self {
        if total_records == 0 {
            return Metadata::default();
        }

        Metadata {
            current_page: page,
            page_size,
            first_page: 1,
            last_page: (total_records + page_size - 1) / page_size,
            total_records,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PollPage {
    pub polls: Vec<PollView>,
    pub metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn visibility_parses_safelist_only() {
        for value in ResultsVisibility::SAFELIST {
            let parsed: ResultsVisibility = value.parse().unwrap();
            assert_eq!(parsed.as_str(), value);
        }
        assert!("sometimes".parse::<ResultsVisibility>().is_err());
        assert!("".parse::<ResultsVisibility>().is_err());
    }

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let now = Utc::now();
        let mut poll = Poll::draft("q", vec![]);
        assert!(!poll.is_expired(now));

        poll.expires_at = Some(now);
        assert!(poll.is_expired(now));

        poll.expires_at = Some(now + Duration::seconds(1));
        assert!(!poll.is_expired(now));
    }

    #[test]
    fn view_orders_options_and_hides_counts() {
        let mut poll = Poll::draft(
            "Best colour?",
            vec![PollOption::new("blue", 1), PollOption::new("red", 0)],
        );
        poll.options[0].vote_count = 7;

        let view = PollView::from(&poll);
        let values: Vec<_> = view.options.iter().map(|o| o.value.as_str()).collect();
        assert_eq!(values, ["red", "blue"]);

        let json = serde_json::to_value(&view).unwrap();
        assert!(json["options"][0].get("vote_count").is_none());
    }

    #[test]
    fn metadata_rounds_last_page_up() {
        let meta = Metadata::calculate(10, 2, 3);
        assert_eq!(meta.last_page, 4);
        assert_eq!(meta.first_page, 1);
        assert_eq!(Metadata::calculate(0, 3, 20), Metadata::default());
    }

    #[test]
    fn filters_offset_from_page() {
        let filters = Filters {
            page: 3,
            page_size: 5,
            ..Filters::default()
        };
        assert_eq!(filters.offset(), 10);
        assert_eq!(filters.limit(), 5);
    }
}
