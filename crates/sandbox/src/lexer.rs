//! Indentation-aware lexer for the code-step fragment language.

use errors::{AelError, ErrorCode};

/// A token with the source line it came from (1-based, for diagnostics).
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    // Keywords
    Import,
    From,
    Return,
    If,
    Elif,
    Else,
    For,
    In,
    Not,
    And,
    Or,
    True,
    False,
    None,
    As,
    // Punctuation and operators
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Assign,
    PlusAssign,
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Layout
    Newline,
    Indent,
    Dedent,
    Eof,
}

fn syntax_error(line: usize, detail: impl Into<String>) -> AelError {
    AelError::new(ErrorCode::CodeSyntax)
        .with_message(format!("Syntax error at line {line}"))
        .with_detail(detail)
}

/// Tokenize a code fragment.
///
/// Indentation must be consistent within a block; tabs count as a single
/// level step like eight spaces would.  Blank and comment-only lines carry
/// no layout significance.
pub fn tokenize(source: &str) -> Result<Vec<Token>, AelError> {
    let mut tokens = Vec::new();
    let mut indents: Vec<usize> = vec![0];

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;

        let indent = indent_width(raw_line);
        let body = raw_line.trim_start();
        if body.is_empty() || body.starts_with('#') {
            continue;
        }

        // Emit Indent/Dedent against the indent stack.
        let current = *indents.last().expect("indent stack never empty");
        if indent > current {
            indents.push(indent);
            tokens.push(Token { tok: Tok::Indent, line: line_no });
        } else if indent < current {
            while indent < *indents.last().expect("indent stack never empty") {
                indents.pop();
                tokens.push(Token { tok: Tok::Dedent, line: line_no });
            }
            if indent != *indents.last().expect("indent stack never empty") {
                return Err(syntax_error(line_no, "inconsistent indentation"));
            }
        }

        lex_line(body, line_no, &mut tokens)?;
        tokens.push(Token { tok: Tok::Newline, line: line_no });
    }

    while indents.len() > 1 {
        indents.pop();
        tokens.push(Token { tok: Tok::Dedent, line: source.lines().count() });
    }
    tokens.push(Token { tok: Tok::Eof, line: source.lines().count() + 1 });
    Ok(tokens)
}

fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for ch in line.chars() {
        match ch {
            ' ' => width += 1,
            '\t' => width += 8,
            _ => break,
        }
    }
    width
}

fn keyword(name: &str) -> Option<Tok> {
    Some(match name {
        "import" => Tok::Import,
        "from" => Tok::From,
        "return" => Tok::Return,
        "if" => Tok::If,
        "elif" => Tok::Elif,
        "else" => Tok::Else,
        "for" => Tok::For,
        "in" => Tok::In,
        "not" => Tok::Not,
        "and" => Tok::And,
        "or" => Tok::Or,
        "True" => Tok::True,
        "False" => Tok::False,
        "None" => Tok::None,
        "as" => Tok::As,
        _ => return Option::None,
    })
}

fn lex_line(body: &str, line: usize, out: &mut Vec<Token>) -> Result<(), AelError> {
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;

    let push = |out: &mut Vec<Token>, tok: Tok| out.push(Token { tok, line });

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '#' => break,
            '\'' | '"' => {
                let (s, next) = lex_string(&chars, i, line)?;
                push(out, Tok::Str(s));
                i = next;
            }
            '0'..='9' => {
                let (tok, next) = lex_number(&chars, i, line)?;
                push(out, tok);
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                match keyword(&name) {
                    Some(kw) => push(out, kw),
                    Option::None => push(out, Tok::Name(name)),
                }
            }
            '(' => {
                push(out, Tok::LParen);
                i += 1;
            }
            ')' => {
                push(out, Tok::RParen);
                i += 1;
            }
            '[' => {
                push(out, Tok::LBracket);
                i += 1;
            }
            ']' => {
                push(out, Tok::RBracket);
                i += 1;
            }
            '{' => {
                push(out, Tok::LBrace);
                i += 1;
            }
            '}' => {
                push(out, Tok::RBrace);
                i += 1;
            }
            ',' => {
                push(out, Tok::Comma);
                i += 1;
            }
            ':' => {
                push(out, Tok::Colon);
                i += 1;
            }
            '.' => {
                push(out, Tok::Dot);
                i += 1;
            }
            '+' => {
                if chars.get(i + 1) == Some(&'=') {
                    push(out, Tok::PlusAssign);
                    i += 2;
                } else {
                    push(out, Tok::Plus);
                    i += 1;
                }
            }
            '-' => {
                push(out, Tok::Minus);
                i += 1;
            }
            '*' => {
                push(out, Tok::Star);
                i += 1;
            }
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    push(out, Tok::DoubleSlash);
                    i += 2;
                } else {
                    push(out, Tok::Slash);
                    i += 1;
                }
            }
            '%' => {
                push(out, Tok::Percent);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    push(out, Tok::Eq);
                    i += 2;
                } else {
                    push(out, Tok::Assign);
                    i += 1;
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    push(out, Tok::Ne);
                    i += 2;
                } else {
                    return Err(syntax_error(line, "unexpected '!'"));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    push(out, Tok::Le);
                    i += 2;
                } else {
                    push(out, Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    push(out, Tok::Ge);
                    i += 2;
                } else {
                    push(out, Tok::Gt);
                    i += 1;
                }
            }
            other => {
                return Err(syntax_error(line, format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(())
}

fn lex_string(chars: &[char], start: usize, line: usize) -> Result<(String, usize), AelError> {
    let quote = chars[start];
    let mut s = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let esc = chars
                    .get(i + 1)
                    .ok_or_else(|| syntax_error(line, "dangling escape"))?;
                s.push(match esc {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '\\' => '\\',
                    '\'' => '\'',
                    '"' => '"',
                    other => {
                        return Err(syntax_error(line, format!("unknown escape '\\{other}'")))
                    }
                });
                i += 2;
            }
            c if c == quote => return Ok((s, i + 1)),
            c => {
                s.push(c);
                i += 1;
            }
        }
    }
    Err(syntax_error(line, "unterminated string literal"))
}

fn lex_number(chars: &[char], start: usize, line: usize) -> Result<(Tok, usize), AelError> {
    let mut i = start;
    let mut has_dot = false;
    while i < chars.len() {
        match chars[i] {
            '0'..='9' => i += 1,
            // A dot starts a fraction only when a digit follows; otherwise
            // it is attribute access on an integer (not supported anyway).
            '.' if !has_dot && matches!(chars.get(i + 1), Some('0'..='9')) => {
                has_dot = true;
                i += 1;
            }
            _ => break,
        }
    }
    let text: String = chars[start..i].iter().collect();
    if has_dot {
        let v: f64 = text
            .parse()
            .map_err(|_| syntax_error(line, format!("invalid number '{text}'")))?;
        Ok((Tok::Float(v), i))
    } else {
        let v: i64 = text
            .parse()
            .map_err(|_| syntax_error(line, format!("invalid number '{text}'")))?;
        Ok((Tok::Int(v), i))
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn simple_return_statement() {
        assert_eq!(
            toks("return 2 + 3"),
            vec![
                Tok::Return,
                Tok::Int(2),
                Tok::Plus,
                Tok::Int(3),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(
            toks(r#"x = 'a\nb'"#),
            vec![
                Tok::Name("x".into()),
                Tok::Assign,
                Tok::Str("a\nb".into()),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn indent_dedent_pairing() {
        let src = "if x:\n    y = 1\nz = 2";
        let t = toks(src);
        let indents = t.iter().filter(|t| **t == Tok::Indent).count();
        let dedents = t.iter().filter(|t| **t == Tok::Dedent).count();
        assert_eq!(indents, 1);
        assert_eq!(dedents, 1);
    }

    #[test]
    fn trailing_block_is_closed_at_eof() {
        let t = toks("for i in xs:\n    total += i");
        assert_eq!(t.last(), Some(&Tok::Eof));
        assert!(t.contains(&Tok::Dedent));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let t = toks("# header\n\nx = 1  # trailing\n");
        assert_eq!(
            t,
            vec![Tok::Name("x".into()), Tok::Assign, Tok::Int(1), Tok::Newline, Tok::Eof]
        );
    }

    #[test]
    fn inconsistent_dedent_is_a_syntax_error() {
        let err = tokenize("if x:\n        y = 1\n    z = 2\n").unwrap_err();
        assert_eq!(err.code, errors::ErrorCode::CodeSyntax);
    }

    #[test]
    fn float_vs_attribute_dot() {
        assert_eq!(toks("x = 1.5"), vec![
            Tok::Name("x".into()), Tok::Assign, Tok::Float(1.5), Tok::Newline, Tok::Eof
        ]);
    }
}
