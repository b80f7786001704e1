use thiserror::Error;

/// A compile-time diagnostic produced by the scanner, parser or bytecode
/// emitter. Rendered the same way the front-end has always reported errors:
/// `[line N] Error at 'token': message`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("[line {line}] Error{at}: {message}")]
pub struct CompileError {
    pub line: usize,
    /// Either empty, " at end" or " at '<lexeme>'".
    pub at: String,
    pub message: String,
}

impl CompileError {
    pub fn new(line: usize, at: impl Into<String>, message: impl Into<String>) -> Self {
        CompileError {
            line,
            at: at.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum InterpretResult {
    InterpretOk,
    InterpretCompileError,
    InterpretRuntimeError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display() {
        let err = CompileError::new(3, " at 'end'", "Expect expression.");
        assert_eq!(err.to_string(), "[line 3] Error at 'end': Expect expression.");

        let err = CompileError::new(1, "", "Unterminated string.");
        assert_eq!(err.to_string(), "[line 1] Error: Unterminated string.");
    }
}
