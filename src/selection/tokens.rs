//! Token normalization of Python programs.
//!
//! Produces the "essential" token stream of a program: comments, blank
//! lines, line continuations and intra-line whitespace are dropped, while
//! logical line breaks and indentation changes become `NEWLINE`, `INDENT`
//! and `DEDENT` markers. Two programs that differ only in formatting
//! normalize to the same stream.

use std::sync::LazyLock;

use regex::Regex;

pub const NEWLINE: &str = "NEWLINE";
pub const INDENT: &str = "INDENT";
pub const DEDENT: &str = "DEDENT";

/// Tab stops used when measuring indentation.
const TAB_WIDTH: usize = 8;

static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r#"(?P<string>(?i:[rbuf]{0,2})(?:"""(?s:.*?)"""|'''(?s:.*?)'''|"(?:\\.|[^"\\\n])*"|'(?:\\.|[^'\\\n])*'))"#,
        r"|(?P<comment>#[^\n]*)",
        r"|(?P<continuation>\\\r?\n)",
        r"|(?P<newline>\r?\n)",
        r"|(?P<space>[ \t\f]+)",
        r"|(?P<number>(?:\d[\d_]*\.?[\d_]*|\.\d[\d_]*)(?:[eE][+-]?\d+)?[jJ]?)",
        r"|(?P<name>[^\W\d]\w*)",
        r"|(?P<op>\*\*=|//=|>>=|<<=|\.\.\.|->|:=|[+\-*/%&|^@<>=!]=|\*\*|//|<<|>>|[()\[\]{}:;,.+\-*/%&|^~<>=@])",
        r"|(?P<other>\S)",
    ))
    .expect("token pattern is valid")
});

fn indent_width(space: &str) -> usize {
    space.chars().fold(0, |width, c| match c {
        '\t' => (width / TAB_WIDTH + 1) * TAB_WIDTH,
        _ => width + 1,
    })
}

/// Splits a program into its essential tokens.
pub fn essential_tokens(source: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut indents = vec![0usize];
    let mut at_line_start = true;
    let mut line_indent = 0usize;
    let mut bracket_depth = 0usize;

    for caps in TOKEN_PATTERN.captures_iter(source) {
        if let Some(space) = caps.name("space") {
            if at_line_start {
                line_indent = indent_width(space.as_str());
            }
            continue;
        }
        if caps.name("comment").is_some() || caps.name("continuation").is_some() {
            continue;
        }
        if caps.name("newline").is_some() {
            if bracket_depth == 0 && !at_line_start {
                tokens.push(NEWLINE.to_string());
                at_line_start = true;
            }
            if at_line_start {
                line_indent = 0;
            }
            continue;
        }

        let Some(token) = caps.get(0) else {
            continue;
        };
        let text = token.as_str();

        if at_line_start {
            let current = indents.last().copied().unwrap_or(0);
            if line_indent > current {
                indents.push(line_indent);
                tokens.push(INDENT.to_string());
            } else {
                while indents.len() > 1 && indents.last().is_some_and(|&i| i > line_indent) {
                    indents.pop();
                    tokens.push(DEDENT.to_string());
                }
            }
            at_line_start = false;
        }

        match text {
            "(" | "[" | "{" => bracket_depth += 1,
            ")" | "]" | "}" => bracket_depth = bracket_depth.saturating_sub(1),
            _ => {}
        }
        tokens.push(text.to_string());
    }

    if !at_line_start {
        tokens.push(NEWLINE.to_string());
    }
    for _ in 1..indents.len() {
        tokens.push(DEDENT.to_string());
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<String> {
        essential_tokens(source)
    }

    #[test]
    fn test_single_line() {
        assert_eq!(
            tokens("def f(x): return x"),
            vec!["def", "f", "(", "x", ")", ":", "return", "x", NEWLINE]
        );
    }

    #[test]
    fn test_indentation_markers() {
        let toks = tokens("def f(x):\n    y = x\n    return y\n");
        assert_eq!(
            toks,
            vec![
                "def", "f", "(", "x", ")", ":", NEWLINE, INDENT, "y", "=", "x", NEWLINE, "return",
                "y", NEWLINE, DEDENT,
            ]
        );
    }

    #[test]
    fn test_formatting_is_ignored() {
        let compact = "def f(x):\n    return x+1\n";
        let spaced = "# add one\ndef f( x ):\n\n    return x + 1   # result\n\n";
        assert_eq!(tokens(compact), tokens(spaced));
    }

    #[test]
    fn test_brackets_join_lines() {
        let toks = tokens("xs = [1,\n      2]\n");
        assert_eq!(toks, vec!["xs", "=", "[", "1", ",", "2", "]", NEWLINE]);
    }

    #[test]
    fn test_strings_and_operators() {
        let toks = tokens("s = f\"a{b}\" if n >= 10 else '#'\n");
        assert_eq!(
            toks,
            vec!["s", "=", "f\"a{b}\"", "if", "n", ">=", "10", "else", "'#'", NEWLINE]
        );
    }

    #[test]
    fn test_nested_dedent() {
        let toks = tokens("if a:\n  if b:\n    c\nd\n");
        let dedents = toks.iter().filter(|t| *t == DEDENT).count();
        assert_eq!(dedents, 2);
        assert_eq!(toks.last().map(String::as_str), Some(NEWLINE));
    }

    #[test]
    fn test_empty_program() {
        assert!(tokens("").is_empty());
        assert!(tokens("\n# only a comment\n\n").is_empty());
    }
}
