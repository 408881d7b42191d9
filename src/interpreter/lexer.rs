//! Tokenizer for the guest cell language.
//!
//! Statements are newline-separated; `#` starts a comment that runs to the
//! end of the line.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Import,
    True,
    False,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    EqEq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Newline,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "{}", name),
            Token::Number(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Import => write!(f, "import"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Assign => write!(f, "="),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::LtEq => write!(f, "<="),
            Token::GtEq => write!(f, ">="),
            Token::Newline => write!(f, "newline"),
        }
    }
}

/// Tokenize source, reporting the 1-based line on error.
pub fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                chars.next();
                line += 1;
                // Collapse runs of blank lines into one statement separator
                if !matches!(tokens.last(), None | Some(Token::Newline)) {
                    tokens.push(Token::Newline);
                }
            }
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            Some(other) => {
                                return Err(format!(
                                    "line {}: unknown escape '\\{}'",
                                    line, other
                                ))
                            }
                            None => break,
                        },
                        '\n' => return Err(format!("line {}: unterminated string", line)),
                        other => s.push(other),
                    }
                }
                if !closed {
                    return Err(format!("line {}: unterminated string", line));
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut num = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = num
                    .parse::<f64>()
                    .map_err(|_| format!("line {}: invalid number '{}'", line, num))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.as_str() {
                    "import" => Token::Import,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(ident),
                });
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::EqEq);
                } else {
                    tokens.push(Token::Assign);
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    return Err(format!("line {}: unexpected character '!'", line));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::LtEq);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::GtEq);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            other => return Err(format!("line {}: unexpected character '{}'", line, other)),
        }
    }

    // Trailing separator keeps the parser's statement loop uniform
    if !matches!(tokens.last(), None | Some(Token::Newline)) {
        tokens.push(Token::Newline);
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_assignment() {
        let tokens = tokenize("x = 1 + 1").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("x".to_string()),
                Token::Assign,
                Token::Number(1.0),
                Token::Plus,
                Token::Number(1.0),
                Token::Newline,
            ]
        );
    }

    #[test]
    fn test_tokenize_string_escapes() {
        let tokens = tokenize(r#"print("a\nb\"c")"#).unwrap();
        assert!(tokens.contains(&Token::Str("a\nb\"c".to_string())));
    }

    #[test]
    fn test_tokenize_collapses_blank_lines() {
        let tokens = tokenize("a = 1\n\n\nb = 2").unwrap();
        let newlines = tokens.iter().filter(|t| **t == Token::Newline).count();
        assert_eq!(newlines, 2);
    }

    #[test]
    fn test_tokenize_comments_ignored() {
        let tokens = tokenize("x = 1 # the answer\nx").unwrap();
        assert!(!tokens.iter().any(|t| matches!(t, Token::Str(_))));
        assert_eq!(tokens.iter().filter(|t| **t == Token::Newline).count(), 2);
    }

    #[test]
    fn test_tokenize_comparison_operators() {
        let tokens = tokenize("a == b != c <= d >= e").unwrap();
        assert!(tokens.contains(&Token::EqEq));
        assert!(tokens.contains(&Token::NotEq));
        assert!(tokens.contains(&Token::LtEq));
        assert!(tokens.contains(&Token::GtEq));
    }

    #[test]
    fn test_tokenize_unterminated_string_is_error() {
        assert!(tokenize("x = \"oops").is_err());
        assert!(tokenize("x = \"oops\nmore").is_err());
    }

    #[test]
    fn test_tokenize_import_keyword() {
        let tokens = tokenize("import plotting").unwrap();
        assert_eq!(tokens[0], Token::Import);
        assert_eq!(tokens[1], Token::Ident("plotting".to_string()));
    }
}
