//! Sentinel markers woven into instrumented code.
//!
//! Instrumented programs announce control information on their own output
//! streams: the line about to execute, normal completion, or an uncaught
//! error. Each session generates one unguessable token so genuine program
//! output cannot be mistaken for control traffic, and the assembler strips
//! every sentinel before text reaches the caller.

use uuid::Uuid;

/// A control sentinel recognized in program output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// The 1-based source line about to execute.
    ActiveLine(u32),
    /// The execution completed without an uncaught error.
    Done,
    /// The execution ended with an uncaught error.
    Error,
}

/// Per-session delimiter for sentinel lines.
///
/// Sentinels have the shape `##<token>:line:<n>##`, `##<token>:done##`, and
/// `##<token>:error##`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerToken(String);

impl MarkerToken {
    /// Generate a fresh unguessable token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[cfg(test)]
    pub(crate) fn fixed(token: &str) -> Self {
        Self(token.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The sentinel announcing that `line` is about to execute.
    pub fn active_line(&self, line: u32) -> String {
        format!("##{}:line:{}##", self.0, line)
    }

    /// The sentinel printed after successful completion.
    pub fn done(&self) -> String {
        format!("##{}:done##", self.0)
    }

    /// The sentinel printed after an uncaught error.
    pub fn error(&self) -> String {
        format!("##{}:error##", self.0)
    }

    /// Whether `text` contains a terminal (done/error) sentinel.
    pub fn contains_terminal(&self, text: &str) -> bool {
        text.contains(&self.done()) || text.contains(&self.error())
    }

    /// Longest sentinel length this token can produce; used by scanners that
    /// carry a tail across fragment boundaries.
    pub fn max_len(&self) -> usize {
        // "##<token>:line:4294967295##"
        self.0.len() + 21
    }

    /// Extract every sentinel from one line of output.
    ///
    /// Returns the line with all sentinel text removed, plus the sentinels in
    /// the order they appeared. Text that merely resembles a sentinel but
    /// does not parse is left untouched.
    pub fn extract(&self, line: &str) -> (String, Vec<Sentinel>) {
        let prefix = format!("##{}:", self.0);
        let mut cleaned = String::new();
        let mut found = Vec::new();
        let mut rest = line;

        while let Some(start) = rest.find(&prefix) {
            let after = &rest[start + prefix.len()..];
            let Some(close) = after.find("##") else {
                break;
            };
            let body = &after[..close];
            let sentinel = if body == "done" {
                Some(Sentinel::Done)
            } else if body == "error" {
                Some(Sentinel::Error)
            } else {
                body.strip_prefix("line:")
                    .and_then(|n| n.parse().ok())
                    .map(Sentinel::ActiveLine)
            };

            match sentinel {
                Some(sentinel) => {
                    cleaned.push_str(&rest[..start]);
                    found.push(sentinel);
                    rest = &after[close + 2..];
                }
                None => {
                    cleaned.push_str(&rest[..start + prefix.len()]);
                    rest = after;
                }
            }
        }

        cleaned.push_str(rest);
        (cleaned, found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_active_line() {
        let token = MarkerToken::fixed("abc");
        let (cleaned, found) = token.extract("##abc:line:3##");
        assert_eq!(cleaned, "");
        assert_eq!(found, vec![Sentinel::ActiveLine(3)]);
    }

    #[test]
    fn test_extract_preserves_surrounding_text() {
        let token = MarkerToken::fixed("abc");
        let (cleaned, found) = token.extract("partial##abc:done##tail");
        assert_eq!(cleaned, "partialtail");
        assert_eq!(found, vec![Sentinel::Done]);
    }

    #[test]
    fn test_extract_multiple_sentinels() {
        let token = MarkerToken::fixed("abc");
        let (cleaned, found) = token.extract("##abc:line:1####abc:line:2##x");
        assert_eq!(cleaned, "x");
        assert_eq!(found, vec![Sentinel::ActiveLine(1), Sentinel::ActiveLine(2)]);
    }

    #[test]
    fn test_lookalike_text_is_kept() {
        let token = MarkerToken::fixed("abc");
        let (cleaned, found) = token.extract("##abc:nonsense## and ##other:done##");
        assert_eq!(cleaned, "##abc:nonsense## and ##other:done##");
        assert!(found.is_empty());
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(MarkerToken::generate(), MarkerToken::generate());
    }

    #[test]
    fn test_contains_terminal() {
        let token = MarkerToken::fixed("abc");
        assert!(token.contains_terminal("x##abc:done##"));
        assert!(token.contains_terminal("##abc:error##"));
        assert!(!token.contains_terminal("##abc:line:9##"));
    }
}
