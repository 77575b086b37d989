//! Pluggable linting of rule expressions.

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum LintError {
    #[error("unexpected {found:?} at offset {offset}")]
    Unexpected { found: char, offset: usize },
    #[error("unclosed {open:?} opened at offset {offset}")]
    Unclosed { open: char, offset: usize },
    #[error("unterminated string literal starting at offset {offset}")]
    UnterminatedString { offset: usize },
}

/// Checks a single rule expression, called for every rule before anything is
/// sent to the ruler. Implementations must be pure.
pub(crate) trait ExpressionLinter: Send + Sync {
    fn lint(&self, expr: &str) -> Result<(), LintError>;
}

/// Rejects expressions with unbalanced brackets or unterminated string literals.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DelimiterLinter;

impl ExpressionLinter for DelimiterLinter {
    fn lint(&self, expr: &str) -> Result<(), LintError> {
        let mut open: Vec<(char, usize)> = Vec::new();
        let mut chars = expr.char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' | '\'' | '`' => {
                    let mut terminated = false;
                    while let Some((_, s)) = chars.next() {
                        if s == '\\' && c != '`' {
                            chars.next();
                        } else if s == c {
                            terminated = true;
                            break;
                        }
                    }
                    if !terminated {
                        return Err(LintError::UnterminatedString { offset });
                    }
                }
                '#' => {
                    // comment until end of line
                    for (_, s) in chars.by_ref() {
                        if s == '\n' {
                            break;
                        }
                    }
                }
                '(' | '[' | '{' => open.push((c, offset)),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match open.pop() {
                        Some((o, _)) if o == expected => (),
                        _ => return Err(LintError::Unexpected { found: c, offset }),
                    }
                }
                _ => (),
            }
        }
        match open.pop() {
            Some((open, offset)) => Err(LintError::Unclosed { open, offset }),
            None => Ok(()),
        }
    }
}
