use crate::frontend::token::Token;

/// Columns a tab advances the indentation level by.
const TAB_WIDTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}

#[derive(Debug, thiserror::Error)]
#[error("{line}:{col}: {message}")]
pub struct LexerError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,

    indents: Vec<usize>,
    /// Open `(`, `[` and `{`; newlines inside are not significant.
    depth: usize,
    at_line_start: bool,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            indents: vec![0],
            depth: 0,
            at_line_start: true,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        ch
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            col: self.col,
        }
    }

    fn error(&self, message: impl Into<String>, span: Span) -> LexerError {
        LexerError {
            message: message.into(),
            line: span.line,
            col: span.col,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch == ' ' || ch == '\t' || ch == '\r' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.current() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    /// Measures leading whitespace and emits `Indent`/`Dedent` tokens.
    /// Blank and comment-only lines leave the indentation untouched.
    fn read_indentation(&mut self, tokens: &mut Vec<Spanned>) -> Result<(), LexerError> {
        let mut width = 0;
        while let Some(ch) = self.current() {
            match ch {
                ' ' => width += 1,
                '\t' => width += TAB_WIDTH,
                '\r' => {}
                _ => break,
            }
            self.advance();
        }

        match self.current() {
            None | Some('\n') | Some('#') => return Ok(()),
            _ => {}
        }

        self.at_line_start = false;
        let span = self.span();
        let top = self.indents.last().copied().unwrap_or(0);

        if width > top {
            self.indents.push(width);
            tokens.push(Spanned {
                token: Token::Indent,
                span,
            });
            return Ok(());
        }

        while width < self.indents.last().copied().unwrap_or(0) {
            self.indents.pop();
            tokens.push(Spanned {
                token: Token::Dedent,
                span,
            });
        }
        if width != self.indents.last().copied().unwrap_or(0) {
            return Err(self.error("inconsistent dedent", span));
        }
        Ok(())
    }

    fn read_string(&mut self) -> Result<Token, LexerError> {
        let start = self.span();
        self.advance();

        let mut string = String::new();
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    return Ok(Token::String(string));
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('n') => string.push('\n'),
                        Some('t') => string.push('\t'),
                        Some('r') => string.push('\r'),
                        Some('\\') => string.push('\\'),
                        Some('"') => string.push('"'),
                        Some('0') => string.push('\0'),
                        Some(ch) => {
                            return Err(
                                self.error(format!("unknown escape sequence: \\{}", ch), self.span())
                            );
                        }
                        None => {
                            return Err(self.error("unexpected EOF in escape sequence", self.span()));
                        }
                    }
                    self.advance();
                }
                Some('\n') => {
                    return Err(
                        self.error("unterminated string (newline before closing quote)", start)
                    );
                }
                Some(ch) => {
                    string.push(ch);
                    self.advance();
                }
                None => return Err(self.error("unterminated string literal", start)),
            }
        }
    }

    fn read_digits(&mut self, out: &mut String) {
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                out.push(ch);
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_number(&mut self) -> Result<Token, LexerError> {
        let start = self.span();
        let mut text = String::new();
        self.read_digits(&mut text);

        // a '.' is a decimal point only when a digit follows
        if self.current() == Some('.') && self.peek().is_some_and(|c| c.is_ascii_digit()) {
            text.push('.');
            self.advance();
            self.read_digits(&mut text);
        }

        if matches!(self.current(), Some('e') | Some('E')) {
            let after = self.source.get(self.pos + 1).copied();
            let signed = matches!(after, Some('+') | Some('-'));
            let digit_at = if signed { self.pos + 2 } else { self.pos + 1 };
            if self.source.get(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                text.push('e');
                self.advance();
                if signed {
                    if let Some(sign) = self.advance() {
                        text.push(sign);
                    }
                }
                self.read_digits(&mut text);
            }
        }

        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(format!("invalid number: {}", text), start))
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        Token::keyword(&ident).unwrap_or(Token::Ident(ident))
    }

    fn read_operator(&mut self) -> Option<Token> {
        let ch = self.current()?;
        let next = self.peek();

        let (token, width) = match (ch, next) {
            ('!', Some('=')) => (Token::BangEq, 2),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('=', Some('>')) => (Token::FatArrow, 2),
            ('+', Some('+')) => (Token::PlusPlus, 2),
            ('<', Some('=')) => (Token::LtEq, 2),
            ('>', Some('=')) => (Token::GtEq, 2),
            ('!', _) => (Token::Bang, 1),
            ('=', _) => (Token::Assign, 1),
            ('+', _) => (Token::Plus, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('^', _) => (Token::Caret, 1),
            (':', _) => (Token::Colon, 1),
            (',', _) => (Token::Comma, 1),
            ('?', _) => (Token::Question, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            _ => return None,
        };

        for _ in 0..width {
            self.advance();
        }
        match token {
            Token::LParen | Token::LBracket | Token::LBrace => self.depth += 1,
            Token::RParen | Token::RBracket | Token::RBrace => {
                self.depth = self.depth.saturating_sub(1)
            }
            _ => {}
        }
        Some(token)
    }

    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, LexerError> {
        let mut tokens = Vec::new();

        loop {
            if self.at_line_start && self.depth == 0 {
                self.read_indentation(&mut tokens)?;
            }
            self.skip_whitespace();
            let span = self.span();

            match self.current() {
                None => break,
                Some('#') => self.skip_comment(),
                Some('\n') => {
                    self.advance();
                    if self.depth > 0 {
                        continue;
                    }
                    // blank and comment lines stay at line start
                    if !self.at_line_start {
                        tokens.push(Spanned {
                            token: Token::Newline,
                            span,
                        });
                    }
                    self.at_line_start = true;
                }
                Some('"') => {
                    let token = self.read_string()?;
                    tokens.push(Spanned { token, span });
                }
                Some(ch) if ch.is_ascii_digit() => {
                    let token = self.read_number()?;
                    tokens.push(Spanned { token, span });
                }
                Some(ch) if ch.is_alphabetic() || ch == '_' => {
                    let token = self.read_identifier();
                    tokens.push(Spanned { token, span });
                }
                Some(ch) => match self.read_operator() {
                    Some(token) => tokens.push(Spanned { token, span }),
                    None => {
                        return Err(self.error(format!("unexpected character '{}'", ch), span));
                    }
                },
            }
        }

        let span = self.span();
        if !self.at_line_start {
            tokens.push(Spanned {
                token: Token::Newline,
                span,
            });
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            tokens.push(Spanned {
                token: Token::Dedent,
                span,
            });
        }
        tokens.push(Spanned {
            token: Token::Eof,
            span,
        });

        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tokens(input: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(input);
        lexer
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .filter(|t| !matches!(t, Token::Newline | Token::Eof))
            .collect()
    }

    fn raw(input: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(input);
        lexer.tokenize().unwrap().into_iter().map(|s| s.token).collect()
    }

    fn lex_error(input: &str) -> LexerError {
        let mut lexer = Lexer::new(input);
        match lexer.tokenize() {
            Ok(t) => panic!("expected lexer error, got {:?}", t),
            Err(e) => e,
        }
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            tokens("1 2.5 3e2 4.5E-1"),
            vec![
                Token::Number(1.0),
                Token::Number(2.5),
                Token::Number(300.0),
                Token::Number(0.45)
            ]
        );
    }

    #[test]
    fn test_keywords_vs_identifiers() {
        assert_eq!(
            tokens("let letter func funky nihl _x"),
            vec![
                Token::Let,
                Token::Ident("letter".to_string()),
                Token::Func,
                Token::Ident("funky".to_string()),
                Token::Nihl,
                Token::Ident("_x".to_string()),
            ]
        );
    }

    #[test]
    fn test_all_keywords() {
        assert_eq!(
            tokens("and or xor if elif else true false func ret let while print nihl break continue"),
            vec![
                Token::And,
                Token::Or,
                Token::Xor,
                Token::If,
                Token::Elif,
                Token::Else,
                Token::True,
                Token::False,
                Token::Func,
                Token::Ret,
                Token::Let,
                Token::While,
                Token::Print,
                Token::Nihl,
                Token::Break,
                Token::Continue,
            ]
        );
    }

    #[test]
    fn test_two_char_operators() {
        assert_eq!(
            tokens("= == => + ++ ! != < <= > >="),
            vec![
                Token::Assign,
                Token::EqEq,
                Token::FatArrow,
                Token::Plus,
                Token::PlusPlus,
                Token::Bang,
                Token::BangEq,
                Token::Lt,
                Token::LtEq,
                Token::Gt,
                Token::GtEq,
            ]
        );
    }

    #[test]
    fn test_punctuation() {
        assert_eq!(
            tokens(": , ( ) [ ] { } * - / ^ % ?"),
            vec![
                Token::Colon,
                Token::Comma,
                Token::LParen,
                Token::RParen,
                Token::LBracket,
                Token::RBracket,
                Token::LBrace,
                Token::RBrace,
                Token::Star,
                Token::Minus,
                Token::Slash,
                Token::Caret,
                Token::Percent,
                Token::Question,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            tokens(r#""a\n\t\"b\\""#),
            vec![Token::String("a\n\t\"b\\".to_string())]
        );
    }

    #[test]
    fn test_indent_and_dedent() {
        let src = "if x\n    print 1\nprint 2\n";
        assert_eq!(
            raw(src),
            vec![
                Token::If,
                Token::Ident("x".to_string()),
                Token::Newline,
                Token::Indent,
                Token::Print,
                Token::Number(1.0),
                Token::Newline,
                Token::Dedent,
                Token::Print,
                Token::Number(2.0),
                Token::Newline,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_pending_dedents_before_eof() {
        let src = "while a\n  while b\n    c";
        let t = raw(src);
        assert_eq!(
            &t[t.len() - 4..],
            &[Token::Newline, Token::Dedent, Token::Dedent, Token::Eof]
        );
    }

    #[test]
    fn test_blank_and_comment_lines_are_ignored() {
        let src = "a\n\n   # comment\n\t\nb # trailing\n";
        assert_eq!(
            raw(src),
            vec![
                Token::Ident("a".to_string()),
                Token::Newline,
                Token::Ident("b".to_string()),
                Token::Newline,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_newlines_inside_brackets_are_ignored() {
        let src = "let a = [1,\n  2,\n     3]\n";
        assert_eq!(
            raw(src),
            vec![
                Token::Let,
                Token::Ident("a".to_string()),
                Token::Assign,
                Token::LBracket,
                Token::Number(1.0),
                Token::Comma,
                Token::Number(2.0),
                Token::Comma,
                Token::Number(3.0),
                Token::RBracket,
                Token::Newline,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_tab_counts_as_four_spaces() {
        let src = "if a\n\tb\n    c\n";
        let t = raw(src);
        assert_eq!(t.iter().filter(|t| **t == Token::Indent).count(), 1);
        assert_eq!(t.iter().filter(|t| **t == Token::Dedent).count(), 1);
    }

    #[test]
    fn test_inconsistent_dedent_error() {
        let err = lex_error("if a\n    b\n  c\n");
        assert_eq!(err.message, "inconsistent dedent");
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_unterminated_string_newline_error() {
        let err = lex_error("\"abc\n\"");
        assert!(err.message.contains("unterminated string"));
        assert_eq!((err.line, err.col), (1, 1));
    }

    #[test]
    fn test_unknown_escape_error() {
        let err = lex_error(r#""\q""#);
        assert!(err.message.contains("unknown escape sequence"));
    }

    #[test]
    fn test_unexpected_character_error() {
        let err = lex_error("let a = $");
        assert_eq!(err.to_string(), "1:9: unexpected character '$'");
    }

    #[test]
    fn test_tokens_and_spans_raw() {
        let src = "# hi\nlet x = \"a\"\n  \nprint x\n";

        let mut lexer = Lexer::new(src);
        let sp = lexer.tokenize().unwrap();

        macro_rules! at {
            ($i:expr, $tok:expr, $line:expr, $col:expr) => {{
                assert_eq!(sp[$i].token, $tok, "token mismatch at index {}", $i);
                assert_eq!(sp[$i].span.line, $line, "line mismatch at index {}", $i);
                assert_eq!(sp[$i].span.col, $col, "col mismatch at index {}", $i);
            }};
        }

        assert_eq!(sp.len(), 9, "unexpected token count: {:?}", sp);

        at!(0, Token::Let, 2, 1);
        at!(1, Token::Ident("x".to_string()), 2, 5);
        at!(2, Token::Assign, 2, 7);
        at!(3, Token::String("a".to_string()), 2, 9);
        at!(4, Token::Newline, 2, 12);
        at!(5, Token::Print, 4, 1);
        at!(6, Token::Ident("x".to_string()), 4, 7);
        at!(7, Token::Newline, 4, 8);
        at!(8, Token::Eof, 5, 1);
    }
}
