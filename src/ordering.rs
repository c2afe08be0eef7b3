//! Option-set mutations that keep positions a dense zero-based permutation.
//!
//! These functions never touch persistence. They compute the resulting option
//! set and the subset of options whose stored position has to change; the
//! caller validates the result and writes the change set in one unit.

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::models::PollOption;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderingError {
    #[error("option not found")]
    UnknownOption,

    #[error("invalid option id, or no id provided")]
    InvalidMapping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub removed: PollOption,
    /// Full option set after the removal, ordered by position.
    pub options: Vec<PollOption>,
    /// Options whose position was decremented.
    pub renumbered: Vec<PollOption>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reordering {
    pub options: Vec<PollOption>,
    /// Options named in the mapping, carrying their new positions.
    pub moved: Vec<PollOption>,
}

/// Appends a new option at the position the caller asked for. Existing
/// options keep their positions, so a clashing or out-of-range position is
/// left for validation to reject.
pub fn insert(options: &[PollOption], value: impl Into<String>, position: i32) -> Vec<PollOption> {
    let mut next = options.to_vec();
    next.push(PollOption::new(value, position));
    next
}

/// Removes an option and closes the gap it leaves behind.
pub fn remove(options: &[PollOption], option_id: Uuid) -> Result<Removal, OrderingError> {
    let removed = options
        .iter()
        .find(|o| o.id == option_id)
        .cloned()
        .ok_or(OrderingError::UnknownOption)?;

    let mut remaining = Vec::with_capacity(options.len().saturating_sub(1));
    let mut renumbered = Vec::new();

    for option in options.iter().filter(|o| o.id != option_id) {
        let mut option = option.clone();
        if option.position > removed.position {
            option.position -= 1;
            renumbered.push(option.clone());
        }
        remaining.push(option);
    }
    remaining.sort_by_key(|o| o.position);

    Ok(Removal {
        removed,
        options: remaining,
        renumbered,
    })
}

/// Applies an id → position mapping. Every id must belong to the option set
/// and appear once; an empty mapping is rejected. Whether the result is a
/// valid layout is decided by validation, not corrected here.
pub fn reposition(
    options: &[PollOption],
    moves: &[(Uuid, i32)],
) -> Result<Reordering, OrderingError> {
    let targets: HashMap<Uuid, i32> = moves.iter().copied().collect();
    if targets.is_empty() || targets.len() != moves.len() {
        return Err(OrderingError::InvalidMapping);
    }

    let mut next = options.to_vec();
    let mut moved = Vec::with_capacity(targets.len());
    for option in next.iter_mut() {
        if let Some(position) = targets.get(&option.id) {
            option.position = *position;
            moved.push(option.clone());
        }
    }

    if moved.len() != targets.len() {
        return Err(OrderingError::InvalidMapping);
    }
    next.sort_by_key(|o| o.position);

    Ok(Reordering {
        options: next,
        moved,
    })
}
