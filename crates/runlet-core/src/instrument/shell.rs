//! Active-line instrumentation for shell source.

use std::sync::OnceLock;

use regex::Regex;

use crate::markers::MarkerToken;

use super::Instrumentor;

/// Inserts an `echo` of the active-line marker before each top-level shell
/// command.
///
/// Compound statements (`if`/`for`/`while`/`until`/`case`), function
/// bodies, here-doc bodies, and continuation lines are left alone: an
/// `echo` between `if` and `then` is a syntax error, and a marker inside a
/// here-doc would become program input. A compound statement reports the
/// line of its opening keyword.
pub struct ShellInstrumentor;

fn heredoc_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"<<-?\s*(?:'([A-Za-z_][A-Za-z0-9_]*)'|"([A-Za-z_][A-Za-z0-9_]*)"|([A-Za-z_][A-Za-z0-9_]*))"#)
            .expect("heredoc pattern is valid")
    })
}

const COMPOUND_OPENERS: &[&str] = &["if", "for", "while", "until", "case"];
const COMPOUND_CLOSERS: &[&str] = &["fi", "done", "esac"];
const CLAUSE_KEYWORDS: &[&str] = &["then", "else", "elif", "do", "in", "esac", "fi", "done"];

impl Instrumentor for ShellInstrumentor {
    fn instrument(&self, code: &str, token: &MarkerToken) -> String {
        let mut out = String::new();
        let mut heredoc: Option<String> = None;
        let mut compound_depth: u32 = 0;
        let mut brace_depth: u32 = 0;
        let mut continued = false;

        for (idx, line) in code.lines().enumerate() {
            let number = (idx + 1) as u32;

            if let Some(terminator) = &heredoc {
                if line.trim() == terminator || line.trim_start_matches('\t') == terminator {
                    heredoc = None;
                }
                out.push_str(line);
                out.push('\n');
                continue;
            }

            let trimmed = line.trim_start();
            let instrumentable = !continued
                && compound_depth == 0
                && brace_depth == 0
                && !trimmed.is_empty()
                && !trimmed.starts_with('#')
                && !is_clause_line(trimmed);

            if instrumentable {
                // The subshell exit restores $? so the marker is invisible
                // to code that inspects the previous command's status.
                out.push_str(&format!(
                    "__rl_last=$?; echo '{}'; (exit $__rl_last)\n",
                    token.active_line(number)
                ));
            }

            for word in words_of(trimmed) {
                if COMPOUND_OPENERS.contains(&word) {
                    compound_depth += 1;
                } else if COMPOUND_CLOSERS.contains(&word) {
                    compound_depth = compound_depth.saturating_sub(1);
                } else if word == "{" {
                    brace_depth += 1;
                } else if word == "}" || word == "};" {
                    brace_depth = brace_depth.saturating_sub(1);
                }
            }

            if let Some(captures) = heredoc_pattern().captures(trimmed) {
                let terminator = captures
                    .get(1)
                    .or_else(|| captures.get(2))
                    .or_else(|| captures.get(3))
                    .map(|m| m.as_str().to_string());
                heredoc = terminator;
            }

            let bare = strip_trailing_comment(line);
            continued = bare.ends_with('\\')
                || bare.ends_with("&&")
                || bare.ends_with("||")
                || bare.ends_with('|');

            out.push_str(line);
            out.push('\n');
        }

        out
    }
}

/// Whether the line begins with a keyword that continues an enclosing
/// compound statement.
fn is_clause_line(trimmed: &str) -> bool {
    let first = words_of(trimmed).next().unwrap_or("");
    CLAUSE_KEYWORDS.contains(&first) || first == "}" || first == "{"
}

fn words_of(line: &str) -> impl Iterator<Item = &str> {
    line.split([' ', '\t', ';']).filter(|w| !w.is_empty())
}

fn strip_trailing_comment(line: &str) -> &str {
    // Good enough for continuation detection; quotes containing '#' are
    // rare at line ends and err toward not instrumenting.
    match line.find(" #") {
        Some(idx) => line[..idx].trim_end(),
        None => line.trim_end(),
    }
}
