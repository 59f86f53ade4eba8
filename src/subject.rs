//! Subject tokens: dot-separated routing keys, `*` and `>` wildcards.

use crate::error::MatcherError;

pub const TOKEN_SEP: u8 = b'.';
pub const WILD_ONE: &str = "*";
pub const WILD_FULL: &str = ">";

/// A validated, tokenized subject or subscription pattern.
///
/// Tokens are kept as owned `String`s rather than slices into the original
/// buffer: subjects are short-lived per publish but subscription patterns
/// live in the matcher for the life of the subscription, so there is no
/// single buffer to borrow from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    tokens: Vec<String>,
}

impl Subject {
    /// Parses and validates a pattern that may contain `*`/`>` (subscribe-side).
    pub fn parse_pattern(raw: &str) -> Result<Subject, MatcherError> {
        let tokens = split_tokens(raw)?;
        for (i, tok) in tokens.iter().enumerate() {
            if tok == WILD_FULL && i != tokens.len() - 1 {
                return Err(MatcherError::FullWildcardNotTerminal);
            }
        }
        Ok(Subject { tokens })
    }

    /// Parses and validates a concrete subject (publish-side). Rejects wildcards.
    pub fn parse_literal(raw: &str) -> Result<Subject, MatcherError> {
        let tokens = split_tokens(raw)?;
        if tokens.iter().any(|t| t == WILD_ONE || t == WILD_FULL) {
            return Err(MatcherError::WildcardInPublish);
        }
        Ok(Subject { tokens })
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn as_string(&self) -> String {
        self.tokens.join(".")
    }

    pub fn has_wildcards(&self) -> bool {
        self.tokens.iter().any(|t| t == WILD_ONE || t == WILD_FULL)
    }
}

fn split_tokens(raw: &str) -> Result<Vec<String>, MatcherError> {
    if raw.is_empty() {
        return Err(MatcherError::EmptySubject);
    }
    let mut tokens = Vec::new();
    for part in raw.split(TOKEN_SEP as char) {
        if part.is_empty() {
            return Err(MatcherError::EmptyToken);
        }
        tokens.push(part.to_owned());
    }
    Ok(tokens)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_empty_subject() {
        assert_eq!(Subject::parse_literal(""), Err(MatcherError::EmptySubject));
    }

    #[test]
    fn rejects_consecutive_dots() {
        assert_eq!(Subject::parse_pattern("a..b"), Err(MatcherError::EmptyToken));
        assert_eq!(Subject::parse_pattern(".a.b"), Err(MatcherError::EmptyToken));
        assert_eq!(Subject::parse_pattern("a.b."), Err(MatcherError::EmptyToken));
    }

    #[test]
    fn full_wildcard_must_be_terminal() {
        assert_eq!(Subject::parse_pattern("a.>.b"), Err(MatcherError::FullWildcardNotTerminal));
        assert!(Subject::parse_pattern("a.b.>").is_ok());
    }

    #[test]
    fn publish_rejects_wildcards() {
        assert_eq!(Subject::parse_literal("a.*.c"), Err(MatcherError::WildcardInPublish));
        assert_eq!(Subject::parse_literal("a.>"), Err(MatcherError::WildcardInPublish));
    }

    #[test]
    fn tokenizes_plain_subject() {
        let s = Subject::parse_literal("foo.bar.baz").unwrap();
        assert_eq!(s.tokens(), &["foo", "bar", "baz"]);
    }
}
