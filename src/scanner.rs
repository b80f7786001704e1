use std::iter::Peekable;
use std::str::Chars;

use strum_macros::Display;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Semicolon,
    Question,
    Colon,
    Hash,

    // One or two character tokens.
    Minus,
    MinusEqual,
    Plus,
    PlusEqual,
    Slash,
    SlashEqual,
    Star,
    StarEqual,
    Percent,
    PercentEqual,
    Caret,
    CaretEqual,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Ellipsis,

    // Literals.
    Identifier,
    String,
    Number,

    // Keywords.
    And,
    As,
    Break,
    Class,
    Continue,
    Do,
    Elif,
    Else,
    End,
    Ensure,
    Except,
    False,
    For,
    Fun,
    If,
    Import,
    In,
    Is,
    Native,
    Null,
    Or,
    Raise,
    Return,
    Super,
    Then,
    This,
    True,
    Try,
    Var,
    While,

    Error,
    Eof,
}

static KEYWORDS: phf::Map<&'static str, TokenType> = phf::phf_map! {
    "and" => TokenType::And,
    "as" => TokenType::As,
    "break" => TokenType::Break,
    "class" => TokenType::Class,
    "continue" => TokenType::Continue,
    "do" => TokenType::Do,
    "elif" => TokenType::Elif,
    "else" => TokenType::Else,
    "end" => TokenType::End,
    "ensure" => TokenType::Ensure,
    "except" => TokenType::Except,
    "false" => TokenType::False,
    "for" => TokenType::For,
    "fun" => TokenType::Fun,
    "if" => TokenType::If,
    "import" => TokenType::Import,
    "in" => TokenType::In,
    "is" => TokenType::Is,
    "native" => TokenType::Native,
    "null" => TokenType::Null,
    "or" => TokenType::Or,
    "raise" => TokenType::Raise,
    "return" => TokenType::Return,
    "super" => TokenType::Super,
    "then" => TokenType::Then,
    "this" => TokenType::This,
    "true" => TokenType::True,
    "try" => TokenType::Try,
    "var" => TokenType::Var,
    "while" => TokenType::While,
};

#[derive(Debug, Clone)]
pub struct Token<'a> {
    pub token_type: TokenType,
    pub value: &'a str,
    pub line: usize,
}

impl<'a> Token<'a> {
    pub fn synthetic(token_type: TokenType) -> Token<'a> {
        Token {
            token_type,
            value: "",
            line: 0,
        }
    }
}

#[derive(Clone)]
pub struct Scanner<'a> {
    source: &'a str,
    chars: Peekable<Chars<'a>>,
    start: usize,
    current: usize,
    line: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            source,
            chars: source.chars().peekable(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_end() {
            return self.make_token(TokenType::Eof);
        }

        let c = self.advance();

        if Self::is_alpha(c) {
            return self.make_identifier_token();
        }

        if Self::is_digit(c) {
            return self.make_number_token(c);
        }

        match c {
            '(' => self.make_token(TokenType::LeftParen),
            ')' => self.make_token(TokenType::RightParen),
            '[' => self.make_token(TokenType::LeftBracket),
            ']' => self.make_token(TokenType::RightBracket),
            ';' => self.make_token(TokenType::Semicolon),
            ',' => self.make_token(TokenType::Comma),
            '?' => self.make_token(TokenType::Question),
            ':' => self.make_token(TokenType::Colon),
            '#' => self.make_token(TokenType::Hash),
            '"' | '\'' => self.make_string_token(c),
            '.' => {
                if self.match_char('.') {
                    if self.match_char('.') {
                        self.make_token(TokenType::Ellipsis)
                    } else {
                        self.error_token("Unexpected '..'.")
                    }
                } else {
                    self.make_token(TokenType::Dot)
                }
            }
            '-' => self.two_char_token('=', TokenType::MinusEqual, TokenType::Minus),
            '+' => self.two_char_token('=', TokenType::PlusEqual, TokenType::Plus),
            '/' => self.two_char_token('=', TokenType::SlashEqual, TokenType::Slash),
            '*' => self.two_char_token('=', TokenType::StarEqual, TokenType::Star),
            '%' => self.two_char_token('=', TokenType::PercentEqual, TokenType::Percent),
            '^' => self.two_char_token('=', TokenType::CaretEqual, TokenType::Caret),
            '!' => self.two_char_token('=', TokenType::BangEqual, TokenType::Bang),
            '=' => self.two_char_token('=', TokenType::EqualEqual, TokenType::Equal),
            '<' => self.two_char_token('=', TokenType::LessEqual, TokenType::Less),
            '>' => self.two_char_token('=', TokenType::GreaterEqual, TokenType::Greater),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn two_char_token(
        &mut self,
        expected: char,
        matched: TokenType,
        unmatched: TokenType,
    ) -> Token<'a> {
        if self.match_char(expected) {
            self.make_token(matched)
        } else {
            self.make_token(unmatched)
        }
    }

    fn is_digit(ch: char) -> bool {
        ch.is_ascii_digit()
    }

    fn is_hex_digit(ch: char) -> bool {
        ch.is_ascii_hexdigit()
    }

    fn is_alpha(ch: char) -> bool {
        ch.is_ascii_alphabetic() || ch == '_'
    }

    fn make_identifier_token(&mut self) -> Token<'a> {
        loop {
            match self.peek() {
                Some(c) if Self::is_alpha(*c) || Self::is_digit(*c) => self.advance(),
                _ => break,
            };
        }
        let lexeme = &self.source[self.start..self.current];
        let token_type = KEYWORDS
            .get(lexeme)
            .copied()
            .unwrap_or(TokenType::Identifier);
        self.make_token(token_type)
    }

    fn make_number_token(&mut self, first: char) -> Token<'a> {
        // Hex integer form.
        if first == '0' && matches!(self.peek(), Some('x') | Some('X')) {
            self.advance();
            let mut digits = 0;
            while let Some(&c) = self.peek() {
                if !Self::is_hex_digit(c) {
                    break;
                }
                self.advance();
                digits += 1;
            }
            if digits == 0 {
                return self.error_token("Malformed hex literal.");
            }
            return self.make_token(TokenType::Number);
        }

        loop {
            match self.peek() {
                Some(c) if Self::is_digit(*c) => self.advance(),
                _ => break,
            };
        }

        if let Some('.') = self.peek() {
            if let Some(c) = self.peek_next() {
                if Self::is_digit(c) {
                    self.advance();
                    while let Some(ch) = self.peek() {
                        if Self::is_digit(*ch) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
            }
        }

        self.make_token(TokenType::Number)
    }

    /// The token's lexeme keeps the surrounding quotes and raw escapes; the
    /// parser decodes them.
    fn make_string_token(&mut self, quote: char) -> Token<'a> {
        loop {
            match self.peek() {
                None => return self.error_token("Unterminated string."),
                Some(&c) if c == quote => break,
                Some('\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some('\\') => {
                    self.advance();
                    if self.is_end() {
                        return self.error_token("Unterminated string.");
                    }
                    self.advance();
                }
                Some(_) => {
                    self.advance();
                }
            }
        }

        self.advance();
        self.make_token(TokenType::String)
    }

    fn skip_whitespace(&mut self) {
        loop {
            let next_char = self.peek_next();
            match (self.peek(), next_char) {
                (Some('\n'), _) => {
                    self.line += 1;
                    self.advance();
                }
                (Some(c), _) if c.is_whitespace() => {
                    self.advance();
                }
                (Some('/'), Some('/')) => {
                    while let Some(ch) = self.peek() {
                        if *ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                (Some(_), _) | (None, _) => return,
            }
        }
    }

    fn peek(&mut self) -> Option<&char> {
        self.chars.peek()
    }

    fn peek_next(&self) -> Option<char> {
        if self.is_end() {
            return None;
        }
        let mut iter = self.chars.clone();
        iter.next();
        iter.next()
    }

    fn is_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn make_token(&self, token_type: TokenType) -> Token<'a> {
        Token {
            token_type,
            value: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, reason: &'static str) -> Token<'a> {
        Token {
            token_type: TokenType::Error,
            value: reason,
            line: self.line,
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if let Some(&next_char) = self.chars.peek() {
            if next_char == expected {
                self.advance();
                return true;
            }
        }
        false
    }

    fn advance(&mut self) -> char {
        if let Some(next_char) = self.chars.next() {
            self.current += next_char.len_utf8();
            next_char
        } else {
            '\0'
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<Token<'_>> {
        let mut scanner = Scanner::new(source);
        let mut tokens = vec![];
        loop {
            let token = scanner.scan_token();
            let done = token.token_type == TokenType::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let tokens = scan_all("fun funny end ender elif");
        let types: Vec<TokenType> = tokens.iter().map(|t| t.token_type).collect();
        assert_eq!(
            types,
            vec![
                TokenType::Fun,
                TokenType::Identifier,
                TokenType::End,
                TokenType::Identifier,
                TokenType::Elif,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn test_compound_operators() {
        let tokens = scan_all("+= -= *= /= %= ^= == != <= >= ...");
        let types: Vec<TokenType> = tokens.iter().map(|t| t.token_type).collect();
        assert_eq!(
            types,
            vec![
                TokenType::PlusEqual,
                TokenType::MinusEqual,
                TokenType::StarEqual,
                TokenType::SlashEqual,
                TokenType::PercentEqual,
                TokenType::CaretEqual,
                TokenType::EqualEqual,
                TokenType::BangEqual,
                TokenType::LessEqual,
                TokenType::GreaterEqual,
                TokenType::Ellipsis,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn test_number_forms() {
        let tokens = scan_all("12 3.5 0xff 0");
        assert!(tokens[..4]
            .iter()
            .all(|t| t.token_type == TokenType::Number));
        assert_eq!(tokens[2].value, "0xff");
    }

    #[test]
    fn test_string_with_escaped_quote() {
        let tokens = scan_all(r#""say \"hi\"" 'single'"#);
        assert_eq!(tokens[0].token_type, TokenType::String);
        assert_eq!(tokens[0].value, r#""say \"hi\"""#);
        assert_eq!(tokens[1].token_type, TokenType::String);
        assert_eq!(tokens[1].value, "'single'");
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let tokens = scan_all("\"oops");
        assert_eq!(tokens[0].token_type, TokenType::Error);
    }

    #[test]
    fn test_line_tracking() {
        let tokens = scan_all("a\n// comment\nb");
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 3);
    }
}
