//! Active-line instrumentation for Python source.

use crate::markers::MarkerToken;

use super::Instrumentor;

/// Inserts a `print` of the active-line marker before each top-level
/// Python statement.
///
/// The scanner tracks enough lexical state to stay out of string literals,
/// comments, bracketed continuations, and backslash continuations; lines
/// inside those contexts, indented block bodies, and secondary clause
/// headers (`else:`, `except:`, ...) are never instrumented. Malformed
/// code degrades to fewer markers, not to corrupted source.
pub struct PythonInstrumentor;

impl Instrumentor for PythonInstrumentor {
    fn instrument(&self, code: &str, token: &MarkerToken) -> String {
        let mut out = String::new();
        let mut scan = Scan::default();
        let mut after_decorator = false;

        for (idx, line) in code.lines().enumerate() {
            let number = (idx + 1) as u32;
            let at_top_level = scan.at_statement_start();

            if at_top_level && !after_decorator && is_executable_opener(line) {
                out.push_str(&format!(
                    "print(\"{}\", flush=True)\n",
                    token.active_line(number)
                ));
            }

            if at_top_level && !line.starts_with([' ', '\t']) {
                after_decorator = line.trim_start().starts_with('@');
            }

            scan.advance(line);
            out.push_str(line);
            out.push('\n');
        }

        out
    }
}

/// Whether this line opens a new top-level executable statement.
fn is_executable_opener(line: &str) -> bool {
    if line.starts_with([' ', '\t']) {
        return false;
    }
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return false;
    }
    !is_secondary_clause(trimmed)
}

/// `else`, `elif`, `except`, and `finally` continue the preceding compound
/// statement; a marker in front of them is a syntax error.
fn is_secondary_clause(trimmed: &str) -> bool {
    for keyword in ["else", "elif", "except", "finally"] {
        if let Some(rest) = trimmed.strip_prefix(keyword) {
            if rest
                .chars()
                .next()
                .map_or(true, |c| !c.is_alphanumeric() && c != '_')
            {
                return true;
            }
        }
    }
    false
}

/// Lexical scanner state carried across lines.
#[derive(Default)]
struct Scan {
    /// Open string literal: quote char and whether it is triple-quoted.
    string: Option<(char, bool)>,
    /// Unclosed `(`/`[`/`{` depth.
    depth: u32,
    /// Previous line ended with a backslash continuation.
    backslash: bool,
}

impl Scan {
    fn at_statement_start(&self) -> bool {
        self.string.is_none() && self.depth == 0 && !self.backslash
    }

    fn advance(&mut self, line: &str) {
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        let mut trailing_backslash = false;

        while i < chars.len() {
            let c = chars[i];

            if let Some((quote, triple)) = self.string {
                if c == '\\' {
                    i += 2;
                    continue;
                }
                if c == quote {
                    if triple {
                        if i + 2 < chars.len() && chars[i + 1] == quote && chars[i + 2] == quote {
                            self.string = None;
                            i += 3;
                            continue;
                        }
                    } else {
                        self.string = None;
                    }
                }
                i += 1;
                continue;
            }

            match c {
                '#' => break,
                '\'' | '"' => {
                    if i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c {
                        self.string = Some((c, true));
                        i += 3;
                        continue;
                    }
                    self.string = Some((c, false));
                }
                '(' | '[' | '{' => self.depth += 1,
                ')' | ']' | '}' => self.depth = self.depth.saturating_sub(1),
                '\\' if i == chars.len() - 1 => trailing_backslash = true,
                _ => {}
            }
            i += 1;
        }

        // Single-quoted strings cannot span lines; an unterminated one is a
        // syntax error in the program, so close it rather than swallowing
        // the rest of the source.
        if matches!(self.string, Some((_, false))) {
            self.string = None;
        }
        self.backslash = trailing_backslash;
    }
}
