use crate::frontend::lexer::LexerError;

/// A compile error with source location.
///
/// Lexer errors surface through the same type so callers see one
/// `line:col: message` diagnostic shape for everything before execution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{line}:{col}: {message}")]
pub struct CompileError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl CompileError {
    pub fn new(message: impl Into<String>, line: usize, col: usize) -> Self {
        CompileError {
            message: message.into(),
            line,
            col,
        }
    }
}

impl From<LexerError> for CompileError {
    fn from(e: LexerError) -> Self {
        CompileError {
            message: e.message,
            line: e.line,
            col: e.col,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_line_col_message() {
        let err = CompileError::new("invalid assignment target", 3, 7);
        assert_eq!(err.to_string(), "3:7: invalid assignment target");
    }

    #[test]
    fn test_from_lexer_error_keeps_location() {
        let lexer = LexerError {
            message: "inconsistent dedent".to_string(),
            line: 4,
            col: 3,
        };
        let err = CompileError::from(lexer);
        assert_eq!(err, CompileError::new("inconsistent dedent", 4, 3));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = CompileError::new("test", 1, 1);
        let _: &dyn std::error::Error = &err;
    }
}
