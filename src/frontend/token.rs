#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Number(f64),
    String(std::string::String),

    // Identifier
    Ident(std::string::String),

    // Keywords
    And,
    Or,
    Xor,
    If,
    Elif,
    Else,
    True,
    False,
    Func,
    Ret,
    Let,
    While,
    Print,
    Nihl,
    Break,
    Continue,

    // Arithmetic
    Plus,
    PlusPlus, // concat
    Minus,
    Star,
    Slash,
    Percent,
    Caret,

    // Comparison & logic
    Bang,
    BangEq,
    Assign,
    EqEq,
    Lt,
    LtEq,
    Gt,
    GtEq,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Question,
    FatArrow,

    // Layout
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl Token {
    pub fn keyword(ident: &str) -> Option<Token> {
        let token = match ident {
            "and" => Token::And,
            "or" => Token::Or,
            "xor" => Token::Xor,
            "if" => Token::If,
            "elif" => Token::Elif,
            "else" => Token::Else,
            "true" => Token::True,
            "false" => Token::False,
            "func" => Token::Func,
            "ret" => Token::Ret,
            "let" => Token::Let,
            "while" => Token::While,
            "print" => Token::Print,
            "nihl" => Token::Nihl,
            "break" => Token::Break,
            "continue" => Token::Continue,
            _ => return None,
        };
        Some(token)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Token::Number(n) => return write!(f, "number {}", n),
            Token::String(s) => return write!(f, "string \"{}\"", s),
            Token::Ident(name) => return write!(f, "identifier '{}'", name),
            Token::And => "'and'",
            Token::Or => "'or'",
            Token::Xor => "'xor'",
            Token::If => "'if'",
            Token::Elif => "'elif'",
            Token::Else => "'else'",
            Token::True => "'true'",
            Token::False => "'false'",
            Token::Func => "'func'",
            Token::Ret => "'ret'",
            Token::Let => "'let'",
            Token::While => "'while'",
            Token::Print => "'print'",
            Token::Nihl => "'nihl'",
            Token::Break => "'break'",
            Token::Continue => "'continue'",
            Token::Plus => "'+'",
            Token::PlusPlus => "'++'",
            Token::Minus => "'-'",
            Token::Star => "'*'",
            Token::Slash => "'/'",
            Token::Percent => "'%'",
            Token::Caret => "'^'",
            Token::Bang => "'!'",
            Token::BangEq => "'!='",
            Token::Assign => "'='",
            Token::EqEq => "'=='",
            Token::Lt => "'<'",
            Token::LtEq => "'<='",
            Token::Gt => "'>'",
            Token::GtEq => "'>='",
            Token::LParen => "'('",
            Token::RParen => "')'",
            Token::LBracket => "'['",
            Token::RBracket => "']'",
            Token::LBrace => "'{'",
            Token::RBrace => "'}'",
            Token::Comma => "','",
            Token::Colon => "':'",
            Token::Question => "'?'",
            Token::FatArrow => "'=>'",
            Token::Newline => "end of line",
            Token::Indent => "indent",
            Token::Dedent => "dedent",
            Token::Eof => "end of file",
        };
        write!(f, "{}", text)
    }
}
