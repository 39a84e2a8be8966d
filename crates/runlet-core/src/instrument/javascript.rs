//! Active-line instrumentation for JavaScript source.

use crate::markers::MarkerToken;

use super::Instrumentor;

/// Inserts a `console.log` of the active-line marker before each top-level
/// JavaScript statement.
///
/// The scanner tracks strings, template literals, comments, and bracket
/// depth so markers land only between complete top-level statements.
/// Clause headers (`else`, `catch`, ...), continuation lines, and block
/// bodies are never instrumented; a multi-line statement reports its
/// opening line.
pub struct JavascriptInstrumentor;

impl Instrumentor for JavascriptInstrumentor {
    fn instrument(&self, code: &str, token: &MarkerToken) -> String {
        let mut out = String::new();
        let mut scan = Scan::default();

        for (idx, line) in code.lines().enumerate() {
            let number = (idx + 1) as u32;
            let trimmed = line.trim_start();

            let instrumentable = scan.at_statement_start()
                && !trimmed.is_empty()
                && !trimmed.starts_with("//")
                && !trimmed.starts_with("/*")
                && !is_continuation_opener(trimmed);

            if instrumentable {
                out.push_str(&format!(
                    "console.log(\"{}\");\n",
                    token.active_line(number)
                ));
            }

            scan.advance(line);
            out.push_str(line);
            out.push('\n');
        }

        out
    }
}

/// Lines that syntactically extend the previous statement.
fn is_continuation_opener(trimmed: &str) -> bool {
    if trimmed.starts_with(['.', ')', ']', '}', ':', '?', ',']) {
        return true;
    }
    for keyword in ["else", "catch", "finally", "case", "default"] {
        if let Some(rest) = trimmed.strip_prefix(keyword) {
            if rest
                .chars()
                .next()
                .map_or(true, |c| !c.is_alphanumeric() && c != '_' && c != '$')
            {
                return true;
            }
        }
    }
    false
}

#[derive(Default)]
struct Scan {
    string: Option<char>,
    template: bool,
    block_comment: bool,
    depth: u32,
    /// Previous line ended mid-expression (trailing operator or opener).
    dangling: bool,
}

impl Scan {
    fn at_statement_start(&self) -> bool {
        self.string.is_none() && !self.template && !self.block_comment && self.depth == 0
            && !self.dangling
    }

    fn advance(&mut self, line: &str) {
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        let mut last_significant: Option<char> = None;

        while i < chars.len() {
            let c = chars[i];

            if self.block_comment {
                if c == '*' && chars.get(i + 1) == Some(&'/') {
                    self.block_comment = false;
                    i += 2;
                    continue;
                }
                i += 1;
                continue;
            }

            if let Some(quote) = self.string {
                if c == '\\' {
                    i += 2;
                    continue;
                }
                if c == quote {
                    self.string = None;
                }
                i += 1;
                continue;
            }

            if self.template {
                if c == '\\' {
                    i += 2;
                    continue;
                }
                if c == '`' {
                    self.template = false;
                }
                i += 1;
                continue;
            }

            match c {
                '/' if chars.get(i + 1) == Some(&'/') => break,
                '/' if chars.get(i + 1) == Some(&'*') => {
                    self.block_comment = true;
                    i += 2;
                    continue;
                }
                '\'' | '"' => self.string = Some(c),
                '`' => self.template = true,
                '(' | '[' | '{' => {
                    self.depth += 1;
                    last_significant = Some(c);
                    i += 1;
                    continue;
                }
                ')' | ']' | '}' => {
                    self.depth = self.depth.saturating_sub(1);
                    last_significant = Some(c);
                    i += 1;
                    continue;
                }
                _ => {}
            }

            if !c.is_whitespace() {
                last_significant = Some(c);
            }
            i += 1;
        }

        // Plain strings cannot span lines without a continuation escape;
        // close an unterminated one so the rest of the source still scans.
        if self.string.is_some() {
            self.string = None;
        }

        self.dangling = matches!(
            last_significant,
            Some('=' | '+' | '-' | '*' | '/' | '%' | '<' | '>' | '&' | '|' | '^' | '!' | '?'
                | ':' | ',' | '.')
        );
    }
}
