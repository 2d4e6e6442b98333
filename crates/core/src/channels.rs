//! Task channel naming.
//!
//! Every task has exactly one upstream channel, named
//! `"<prefix>_<task_id>"`. The prefix is fixed per deployment and task ids
//! are validated to a restricted alphabet, so the mapping is deterministic
//! and injective.

use std::fmt;

use serde::Serialize;

use crate::error::CoreError;

/// Channel prefix used when none is configured.
pub const DEFAULT_CHANNEL_PREFIX: &str = "product_analysis";

/// Maximum length of a task identifier.
const MAX_TASK_ID_LEN: usize = 128;

/// Maximum length of a channel prefix.
const MAX_PREFIX_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a caller-supplied task identifier.
///
/// Rules:
/// - Must not be empty (after trimming).
/// - Must not exceed `MAX_TASK_ID_LEN` characters.
/// - Must contain only alphanumeric, hyphen, underscore, dot, or colon characters.
pub fn validate_task_id(task_id: &str) -> Result<(), CoreError> {
    if task_id.trim().is_empty() {
        return Err(CoreError::Validation(
            "Task id must not be empty".to_string(),
        ));
    }
    if task_id.len() > MAX_TASK_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Task id must not exceed {MAX_TASK_ID_LEN} characters"
        )));
    }
    if !task_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(CoreError::Validation(
            "Task id may only contain alphanumeric, hyphen, underscore, dot, or colon characters"
                .to_string(),
        ));
    }
    Ok(())
}

/// Validate a channel prefix.
pub fn validate_prefix(prefix: &str) -> Result<(), CoreError> {
    if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
        return Err(CoreError::Validation(format!(
            "Channel prefix must be 1..={MAX_PREFIX_LEN} characters"
        )));
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CoreError::Validation(
            "Channel prefix may only contain alphanumeric, hyphen, or underscore characters"
                .to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ChannelName
// ---------------------------------------------------------------------------

/// Name of one task's upstream event channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    /// Derive the channel name for `task_id` under `prefix`.
    pub fn for_task(prefix: &str, task_id: &str) -> Result<Self, CoreError> {
        validate_task_id(task_id)?;
        Ok(Self(format!("{prefix}_{task_id}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the task id, given the prefix the name was built with.
    pub fn task_id(&self, prefix: &str) -> Option<&str> {
        self.0
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('_'))
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
