use std::fmt::Write;

use crate::frontend::lexer::Spanned;
use crate::frontend::token::Token;

pub struct TokenDumper {
    pub color: bool,
    pub show_debug_repr: bool, // if false, prints a nicer value for some tokens
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            show_debug_repr: true,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.show_debug_repr = false;
        self
    }

    pub fn dump(&self, tokens: &[Spanned]) {
        print!("{}", self.render(tokens));
    }

    pub fn render(&self, tokens: &[Spanned]) -> String {
        let mut out = String::new();
        for s in tokens {
            self.write_one(&mut out, s);
        }
        out
    }

    fn write_one(&self, out: &mut String, s: &Spanned) {
        let line = s.span.line;
        let col = s.span.col;

        let kind = self.kind(&s.token);
        let colr = if self.color { self.color(&s.token) } else { "" };
        let reset = if self.color { Self::RESET } else { "" };

        let shown = if self.show_debug_repr {
            format!("{:?}", s.token)
        } else {
            // layout tokens read better upper-cased, literals unquoted
            match &s.token {
                Token::Newline => "NEWLINE".to_string(),
                Token::Indent => "INDENT".to_string(),
                Token::Dedent => "DEDENT".to_string(),
                Token::Eof => "EOF".to_string(),
                Token::Ident(name) => name.clone(),
                Token::Number(n) => n.to_string(),
                Token::String(text) => format!("{:?}", text),
                other => other.to_string().trim_matches('\'').to_string(),
            }
        };

        let _ = writeln!(
            out,
            "[{:02}:{:02}] {}{:<8} {}{}",
            line, col, colr, kind, shown, reset
        );
    }

    fn kind(&self, t: &Token) -> &'static str {
        use Token::*;
        match t {
            // layout
            Newline => "NEWLINE",
            Indent => "INDENT",
            Dedent => "DEDENT",
            Eof => "EOF",

            // literals
            Number(_) => "NUMBER",
            String(_) => "STRING",
            True | False | Nihl => "LITERAL",

            // names
            Ident(_) => "IDENT",

            // structure
            LParen | RParen => "PAREN",
            LBracket | RBracket => "BRACKET",
            LBrace | RBrace => "BRACE",
            Comma | Colon | Question | FatArrow => "PUNCT",

            // ops / comparisons
            Plus | PlusPlus | Minus | Star | Slash | Percent | Caret | Bang | Assign => "OP",
            EqEq | BangEq | Lt | LtEq | Gt | GtEq => "CMP",

            // everything else = keyword
            _ => "KEYWORD",
        }
    }

    fn color(&self, t: &Token) -> &'static str {
        use Token::*;
        match t {
            Newline | Indent | Dedent | Eof => Self::DIM,
            String(_) => Self::GRN,
            Number(_) | True | False | Nihl => Self::CYN,
            Ident(_) => Self::YEL,
            Plus | PlusPlus | Minus | Star | Slash | Percent | Caret | Bang | Assign => Self::MAG,
            EqEq | BangEq | Lt | LtEq | Gt | GtEq => Self::MAG,
            _ => Self::RESET,
        }
    }
}
