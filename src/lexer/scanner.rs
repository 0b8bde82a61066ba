use super::token::{SrcPos, Token, TokenKind};
use crate::error::{Error, Result};

/// Scanner for Flap source text
pub struct Scanner {
    /// Source file name, used in diagnostics
    file: String,
    /// Source code as character vector
    source: Vec<char>,
    /// Accumulated tokens
    tokens: Vec<Token>,
    /// Start position of the current token
    start: usize,
    /// Current position in source
    current: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// Current column number (1-indexed)
    column: usize,
    /// Position where the current token started
    token_pos: SrcPos,
}

impl Scanner {
    /// Create a new scanner over source code
    pub fn new(file: &str, source: &str) -> Self {
        Scanner {
            file: file.to_string(),
            source: source.chars().collect(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            token_pos: SrcPos::default(),
        }
    }

    /// Scan all tokens and return them as a vector
    pub fn scan_tokens(&mut self) -> Result<Vec<Token>> {
        while !self.is_at_end() {
            self.start = self.current;
            self.token_pos = SrcPos {
                line: self.line,
                col: self.column,
                byte: self.current,
            };
            self.scan_token()?;
        }

        self.tokens.push(Token::new(
            TokenKind::Eof,
            String::new(),
            SrcPos {
                line: self.line,
                col: self.column,
                byte: self.current,
            },
        ));

        Ok(std::mem::take(&mut self.tokens))
    }

    fn scan_token(&mut self) -> Result<()> {
        let c = self.advance();

        match c {
            ' ' | '\r' | '\t' => {}

            '\n' => {
                self.add_token(TokenKind::Newline);
                self.line += 1;
                self.column = 1;
            }
            ';' => self.add_token(TokenKind::Newline),

            '(' => self.add_token(TokenKind::LeftParen),
            ')' => self.add_token(TokenKind::RightParen),
            '{' => self.add_token(TokenKind::LeftBrace),
            '}' => self.add_token(TokenKind::RightBrace),
            '[' => self.add_token(TokenKind::LeftBracket),
            ']' => self.add_token(TokenKind::RightBracket),
            ',' => self.add_token(TokenKind::Comma),
            ':' => self.add_token(TokenKind::Colon),
            '|' => self.add_token(TokenKind::Pipe),

            '@' => {
                if self.match_char('@') {
                    self.add_token(TokenKind::AtAt);
                } else {
                    self.add_token(TokenKind::At);
                }
            }

            '+' => self.add_token(TokenKind::Plus),
            '-' => {
                if self.match_char('>') {
                    self.add_token(TokenKind::Arrow);
                } else {
                    self.add_token(TokenKind::Minus);
                }
            }
            '*' => self.add_token(TokenKind::Star),
            '/' => {
                if self.peek() == '/' {
                    self.skip_line_comment();
                } else {
                    self.add_token(TokenKind::Slash);
                }
            }
            '%' => self.add_token(TokenKind::Percent),

            '~' => {
                if self.match_char('>') {
                    self.add_token(TokenKind::DefaultArrow);
                } else {
                    return Err(self.error("expected `>` after `~`"));
                }
            }

            '.' => {
                if self.match_char('.') {
                    if self.match_char('<') {
                        self.add_token(TokenKind::RangeExclusive);
                    } else {
                        self.add_token(TokenKind::RangeInclusive);
                    }
                } else {
                    self.add_token(TokenKind::Dot);
                }
            }

            '=' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::EqualEqual);
                } else if self.match_char('>') {
                    self.add_token(TokenKind::FatArrow);
                } else {
                    self.add_token(TokenKind::Assign);
                }
            }
            '!' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::BangEqual);
                } else {
                    return Err(self.error("expected `=` after `!`"));
                }
            }
            '<' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::LessEqual);
                } else if self.match_char('-') {
                    self.add_token(TokenKind::StoreArrow);
                } else {
                    self.add_token(TokenKind::Less);
                }
            }
            '>' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::GreaterEqual);
                } else {
                    self.add_token(TokenKind::Greater);
                }
            }

            '"' => self.scan_string()?,

            c if c.is_ascii_digit() => self.scan_number()?,

            c if c.is_alphabetic() || c == '_' => self.scan_identifier(),

            c => return Err(self.error(format!("unexpected character `{c}`"))),
        }

        Ok(())
    }

    fn scan_string(&mut self) -> Result<()> {
        let mut value = String::new();
        while !self.is_at_end() && self.peek() != '"' {
            let c = self.advance();
            if c == '\n' {
                return Err(self.error("unterminated string literal"));
            }
            if c == '\\' {
                let esc = self.advance();
                match esc {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '\\' => value.push('\\'),
                    '"' => value.push('"'),
                    '0' => value.push('\0'),
                    other => return Err(self.error(format!("unknown escape `\\{other}`"))),
                }
            } else {
                value.push(c);
            }
        }
        if self.is_at_end() {
            return Err(self.error("unterminated string literal"));
        }
        self.advance(); // closing quote
        self.add_token(TokenKind::Str(value));
        Ok(())
    }

    fn scan_number(&mut self) -> Result<()> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        // Fraction, but not a range operator
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        if self.peek() == 'e' || self.peek() == 'E' {
            let save = self.current;
            self.advance();
            if self.peek() == '+' || self.peek() == '-' {
                self.advance();
            }
            if self.peek().is_ascii_digit() {
                while self.peek().is_ascii_digit() {
                    self.advance();
                }
            } else {
                self.current = save;
            }
        }

        let text: String = self.source[self.start..self.current].iter().collect();
        let value: f64 = text
            .parse()
            .map_err(|_| self.error(format!("malformed number `{text}`")))?;
        self.add_token(TokenKind::Number(value));
        Ok(())
    }

    fn scan_identifier(&mut self) {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }

        let text: String = self.source[self.start..self.current].iter().collect();
        let kind = match text.as_str() {
            "in" => TokenKind::In,
            "and" => TokenKind::And,
            "or" => {
                // `or!` is a distinct operator
                if self.peek() == '!' {
                    self.advance();
                    TokenKind::OrBang
                } else {
                    TokenKind::Or
                }
            }
            "not" => TokenKind::Not,
            "import" => TokenKind::Import,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "return" => TokenKind::Return,
            "defer" => TokenKind::Defer,
            "arena" => TokenKind::Arena,
            "unsafe" => TokenKind::Unsafe,
            _ => TokenKind::Ident(text.clone()),
        };
        self.add_token(kind);
    }

    fn skip_line_comment(&mut self) {
        while !self.is_at_end() && self.peek() != '\n' {
            self.advance();
        }
    }

    fn add_token(&mut self, kind: TokenKind) {
        let lexeme: String = self.source[self.start..self.current].iter().collect();
        self.tokens.push(Token::new(kind, lexeme, self.token_pos));
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current];
        self.current += 1;
        self.column += 1;
        c
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            return false;
        }
        self.current += 1;
        self.column += 1;
        true
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.source.len() {
            '\0'
        } else {
            self.source[self.current + 1]
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::Lex {
            file: self.file.clone(),
            line: self.token_pos.line,
            col: self.token_pos.col,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Scanner::new("test.flap", source)
            .scan_tokens()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn scans_lambda_binding() {
        let ks = kinds("main = () => println(\"hi\")");
        assert_eq!(
            ks,
            vec![
                TokenKind::Ident("main".into()),
                TokenKind::Assign,
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::FatArrow,
                TokenKind::Ident("println".into()),
                TokenKind::LeftParen,
                TokenKind::Str("hi".into()),
                TokenKind::RightParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_or_bang_and_ranges() {
        let ks = kinds("1/0 or! 42");
        assert!(ks.contains(&TokenKind::OrBang));
        let ks = kinds("0..<1000");
        assert_eq!(
            ks,
            vec![
                TokenKind::Number(0.0),
                TokenKind::RangeExclusive,
                TokenKind::Number(1000.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn distinguishes_at_from_atat() {
        let ks = kinds("@ i in 0..<10 { }");
        assert_eq!(ks[0], TokenKind::At);
        let ks = kinds("@@ i in 0..<10 { }");
        assert_eq!(ks[0], TokenKind::AtAt);
    }

    #[test]
    fn match_arrows() {
        let ks = kinds("| n < 0 -> \"neg\" ~> \"pos\"");
        assert!(ks.contains(&TokenKind::Pipe));
        assert!(ks.contains(&TokenKind::Arrow));
        assert!(ks.contains(&TokenKind::DefaultArrow));
    }

    #[test]
    fn store_arrow_vs_comparison() {
        let ks = kinds("l[0] <- 5");
        assert!(ks.contains(&TokenKind::StoreArrow));
        let ks = kinds("a <= b");
        assert!(ks.contains(&TokenKind::LessEqual));
    }

    #[test]
    fn comments_are_skipped() {
        let ks = kinds("x = 1 // trailing\n");
        assert_eq!(
            ks,
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Assign,
                TokenKind::Number(1.0),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn tracks_positions() {
        let toks = Scanner::new("t.flap", "x\n  y").scan_tokens().unwrap();
        assert_eq!(toks[0].pos.line, 1);
        assert_eq!(toks[0].pos.col, 1);
        // after the newline token: y at line 2, col 3
        assert_eq!(toks[2].pos.line, 2);
        assert_eq!(toks[2].pos.col, 3);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = Scanner::new("t.flap", "\"oops").scan_tokens().unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }
}
