use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::{Filters, Poll, PollOption, ResultsVisibility, SortDirection, SortKey};

pub const MAX_QUESTION_BYTES: usize = 500;
pub const MAX_DESCRIPTION_BYTES: usize = 1000;
pub const MAX_OPTION_BYTES: usize = 500;
pub const MIN_OPTIONS: usize = 2;
pub const MAX_PAGE: i64 = 10_000_000;
pub const MAX_PAGE_SIZE: i64 = 50;

pub const SORT_SAFELIST: [&str; 4] = ["created_at", "question", "-created_at", "-question"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// Every violation found, in the order the checks ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// First-detected message for each field.
    pub fn by_field(&self) -> BTreeMap<&'static str, &str> {
        let mut fields = BTreeMap::new();
        for error in &self.0 {
            fields.entry(error.field).or_insert(error.message.as_str());
        }
        fields
    }

    pub fn first(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|e| e.field == field)
            .map(|e| e.message.as_str())
    }
}

impl Serialize for ValidationErrors {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.by_field().serialize(serializer)
    }
}

#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<FieldError>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, ok: bool, field: &'static str, message: &str) {
        if !ok {
            self.add(field, message);
        }
    }

    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field,
            message: message.into(),
        });
    }

    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn finish(self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(self.errors))
        }
    }

    pub fn into_errors(self) -> ValidationErrors {
        ValidationErrors(self.errors)
    }
}

fn unique<T: Eq + Hash>(values: impl IntoIterator<Item = T>) -> bool {
    let mut seen = HashSet::new();
    values.into_iter().all(|v| seen.insert(v))
}

/// Runs every poll check against `now`. Checks are independent; nothing
/// short-circuits.
pub fn check_poll(v: &mut Validator, poll: &Poll, now: DateTime<Utc>) {
    v.check(!poll.question.trim().is_empty(), "question", "must not be empty");
    v.check(
        poll.question.trim().len() <= MAX_QUESTION_BYTES,
        "question",
        "must not be more than 500 bytes long",
    );

    if let Some(description) = &poll.description {
        v.check(
            description.trim().len() <= MAX_DESCRIPTION_BYTES,
            "description",
            "must not be more than 1000 bytes long",
        );
        v.check(!description.trim().is_empty(), "description", "must not be blank");
    }

    check_options(v, &poll.options);

    if let Some(expires_at) = poll.expires_at {
        v.check(
            expires_at > now + Duration::minutes(1),
            "expires_at",
            "must be more than a minute in the future",
        );
    }
}

fn check_options(v: &mut Validator, options: &[PollOption]) {
    v.check(
        options.len() >= MIN_OPTIONS,
        "options",
        "must contain at least two options",
    );
    v.check(
        unique(options.iter().map(|o| o.value.trim())),
        "options",
        "must not contain duplicate values",
    );
    check_layout(v, options);

    for option in options {
        v.check(
            !option.value.trim().is_empty(),
            "options",
            "option values must not be empty",
        );
        v.check(
            option.value.trim().len() <= MAX_OPTION_BYTES,
            "options",
            "option value must not be more than 500 bytes long",
        );
    }

    for option in options {
        v.check(
            option.position >= 0,
            "options",
            "position must be greater or equal to 0",
        );
        v.check(
            (option.position as i64) < options.len() as i64,
            "options",
            "position must not exceed the number of options",
        );
    }
}

fn check_layout(v: &mut Validator, options: &[PollOption]) {
    v.check(
        unique(options.iter().map(|o| o.position)),
        "options",
        "positions must be unique",
    );
}

/// Full structural validation of a poll aggregate.
pub fn validate_poll(poll: &Poll, now: DateTime<Utc>) -> Result<(), ValidationErrors> {
    let mut v = Validator::new();
    check_poll(&mut v, poll, now);
    v.finish()
}

/// True when positions are exactly the permutation `0..n`.
pub fn is_dense_layout(options: &[PollOption]) -> bool {
    let mut positions: Vec<i32> = options.iter().map(|o| o.position).collect();
    positions.sort_unstable();
    positions.iter().enumerate().all(|(i, p)| *p as usize == i)
}

pub fn check_visibility(v: &mut Validator, value: &str) {
    v.check(
        ResultsVisibility::SAFELIST.contains(&value),
        "results_visibility",
        "invalid results_visibility value",
    );
}

/// Raw listing parameters as they arrive from the query string.
#[derive(Debug, Clone, Default)]
pub struct RawFilters<'a> {
    pub page: Option<&'a str>,
    pub page_size: Option<&'a str>,
    pub sort: Option<&'a str>,
}

fn read_int(v: &mut Validator, field: &'static str, raw: Option<&str>, default: i64) -> i64 {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => default,
        Some(s) => s.parse().unwrap_or_else(|_| {
            v.add(field, "must be an integer value");
            default
        }),
    }
}

pub fn parse_filters(raw: RawFilters<'_>) -> Result<Filters, ValidationErrors> {
    let mut v = Validator::new();
    let defaults = Filters::default();

    let page = read_int(&mut v, "page", raw.page, defaults.page);
    let page_size = read_int(&mut v, "page_size", raw.page_size, defaults.page_size);
    let sort = raw.sort.filter(|s| !s.is_empty()).unwrap_or("-created_at");

    v.check(page > 0, "page", "must be greater than zero");
    v.check(page <= MAX_PAGE, "page", "must be a maximum of 10 million");
    v.check(page_size > 0, "page_size", "must be greater than zero");
    v.check(page_size <= MAX_PAGE_SIZE, "page_size", "must be a maximum of 50");
    v.check(SORT_SAFELIST.contains(&sort), "sort", "invalid sort value");

    v.finish()?;

    let (direction, column) = match sort.strip_prefix('-') {
        Some(column) => (SortDirection::Descending, column),
        None => (SortDirection::Ascending, sort),
    };
    let sort = if column == "question" {
        SortKey::Question
    } else {
        SortKey::CreatedAt
    };

    Ok(Filters {
        page,
        page_size,
        sort,
        direction,
    })
}
