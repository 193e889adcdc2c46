//! Topic wildcard matching and prefix handling
//!
//! Topics are `/`-delimited. Filters may use `+` for exactly one segment and a
//! terminal `#` for the remainder of the topic, including nothing at all, so
//! `a/#` matches `a`, `a/b` and `a/b/c`.

use thiserror::Error;

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Check whether a concrete `topic` matches a subscription `pattern`.
pub fn topic_matches(topic: &str, pattern: &str) -> bool {
    let mut topic_parts = topic.split('/');

    for pattern_part in pattern.split('/') {
        if pattern_part == MULTI_LEVEL {
            return true;
        }
        match topic_parts.next() {
            Some(_) if pattern_part == SINGLE_LEVEL => {}
            Some(topic_part) if topic_part == pattern_part => {}
            _ => return false,
        }
    }

    topic_parts.next().is_none()
}

/// Reject filters the matcher would treat inconsistently.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }

    let segments: Vec<&str> = filter.split('/').collect();
    for (index, segment) in segments.iter().enumerate() {
        if segment.contains(MULTI_LEVEL) {
            if *segment != MULTI_LEVEL {
                return Err(TopicError::PartialWildcard(MULTI_LEVEL));
            }
            if index + 1 != segments.len() {
                return Err(TopicError::MultiLevelNotLast);
            }
        }
        if segment.contains(SINGLE_LEVEL) && *segment != SINGLE_LEVEL {
            return Err(TopicError::PartialWildcard(SINGLE_LEVEL));
        }
    }

    Ok(())
}

/// Apply a topic prefix exactly once: `prefix.trim_end('/') + "/" + topic.trim_start('/')`.
///
/// An empty prefix leaves the topic untouched.
pub fn full_topic(prefix: &str, topic: &str) -> String {
    if prefix.is_empty() {
        return topic.to_string();
    }
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        topic.trim_start_matches('/')
    )
}

/// Inverse of [`full_topic`] for inbound topics; topics outside the prefix pass through.
pub fn strip_topic_prefix<'a>(prefix: &str, topic: &'a str) -> &'a str {
    if prefix.is_empty() {
        return topic;
    }
    let base = prefix.trim_end_matches('/');
    topic
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(topic)
}

/// Topic filter validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic filter cannot be empty")]
    Empty,
    #[error("'#' is only valid as the last segment")]
    MultiLevelNotLast,
    #[error("'{0}' must occupy an entire segment")]
    PartialWildcard(&'static str),
}
