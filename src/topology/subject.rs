//! Subject token matching
//!
//! Subjects are dot-separated tokens (`Lesson.Created`). Patterns may use
//! `*` to match exactly one token and a trailing `>` to match one or more
//! remaining tokens.

use crate::error::{EventError, Result};

const SINGLE: &str = "*";
const TAIL: &str = ">";

/// Validate a subject or subject pattern
///
/// Rejects empty subjects, empty tokens, whitespace and a `>` that is not
/// the final token.
pub fn validate(subject: &str) -> Result<()> {
    if subject.is_empty() {
        return Err(EventError::Config("Subject cannot be empty".to_string()));
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(EventError::Config(format!(
                "Subject '{}' contains an empty token",
                subject
            )));
        }
        if token.chars().any(char::is_whitespace) {
            return Err(EventError::Config(format!(
                "Subject '{}' contains whitespace",
                subject
            )));
        }
        if *token == TAIL && i != tokens.len() - 1 {
            return Err(EventError::Config(format!(
                "Subject '{}' uses '>' before the last token",
                subject
            )));
        }
    }

    Ok(())
}

/// Whether a concrete subject matches a pattern
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(TAIL), Some(_)) => return true,
            (Some(SINGLE), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether every subject a filter can match is also matched by `pattern`
///
/// Used to check that a stream's subject set can carry everything a
/// consumer filter asks for.
pub fn covers(pattern: &str, filter: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut filter_tokens = filter.split('.');

    loop {
        match (pattern_tokens.next(), filter_tokens.next()) {
            (Some(TAIL), Some(_)) => return true,
            (Some(_), Some(TAIL)) => return false,
            (Some(SINGLE), Some(_)) => continue,
            (Some(p), Some(f)) if p == f => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether at least one concrete subject is matched by both patterns
pub fn overlaps(a: &str, b: &str) -> bool {
    let mut a_tokens = a.split('.');
    let mut b_tokens = b.split('.');

    loop {
        match (a_tokens.next(), b_tokens.next()) {
            (Some(TAIL), Some(_)) | (Some(_), Some(TAIL)) => return true,
            (Some(SINGLE), Some(_)) | (Some(_), Some(SINGLE)) => continue,
            (Some(x), Some(y)) if x == y => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(validate("Lesson.Created").is_ok());
        assert!(validate("chat.chat.>").is_ok());
        assert!(validate("Lesson.*").is_ok());
        assert!(validate("").is_err());
        assert!(validate("Lesson..Created").is_err());
        assert!(validate("Lesson.>.Created").is_err());
        assert!(validate("Lesson Created").is_err());
    }

    #[test]
    fn test_matches_literal() {
        assert!(matches("Lesson.Created", "Lesson.Created"));
        assert!(!matches("Lesson.Created", "Lesson.Updated"));
        assert!(!matches("Lesson.Created", "Lesson.Created.v2"));
        assert!(!matches("Lesson.Created.v2", "Lesson.Created"));
    }

    #[test]
    fn test_matches_wildcards() {
        assert!(matches("Lesson.*", "Lesson.Created"));
        assert!(!matches("Lesson.*", "Lesson.Created.v2"));
        assert!(!matches("Lesson.*", "Lesson"));

        assert!(matches("chat.chat.>", "chat.chat.created"));
        assert!(matches("chat.chat.>", "chat.chat.message.created"));
        assert!(!matches("chat.chat.>", "chat.chat"));
        assert!(matches(">", "anything.at.all"));
    }

    #[test]
    fn test_covers() {
        assert!(covers("Lesson.*", "Lesson.Created"));
        assert!(covers("Lesson.*", "Lesson.*"));
        assert!(!covers("Lesson.Created", "Lesson.*"));
        assert!(covers("chat.chat.>", "chat.chat.message.*"));
        assert!(covers("chat.chat.>", "chat.chat.>"));
        assert!(covers("chat.>", "chat.chat.>"));
        assert!(!covers("chat.chat.*", "chat.chat.>"));
        assert!(!covers("Lesson.*", "Chat.Created"));
    }

    #[test]
    fn test_overlaps() {
        assert!(overlaps("Lesson.*", "Lesson.Created"));
        assert!(overlaps("Lesson.*", "*.Created"));
        assert!(overlaps("chat.>", "chat.chat.created"));
        assert!(!overlaps("Lesson.*", "Chat.*"));
        assert!(!overlaps("Lesson.Created", "Lesson.Created.v2"));
    }
}
