//! Error categories carrying the classic GW-BASIC error codes

use thiserror::Error;

/// Runtime fault kinds, numbered per the classic error table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// Internal: cancellation requested by the host. Never reaches ON ERROR.
    Break,
    NextWithoutFor,
    Syntax,
    ReturnWithoutGosub,
    OutOfData,
    IllegalFunctionCall,
    Overflow,
    UndefinedLine,
    SubscriptOutOfRange,
    DivisionByZero,
    TypeMismatch,
    NoResume,
    ResumeWithoutError,
    BadFileNumber,
    FileNotFound,
    FileAlreadyOpen,
    InputPastEnd,
    PathNotFound,
}

impl ErrorCode {
    /// Classic numeric code as reported by `ERR`.
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::Break => 0,
            ErrorCode::NextWithoutFor => 1,
            ErrorCode::Syntax => 2,
            ErrorCode::ReturnWithoutGosub => 3,
            ErrorCode::OutOfData => 4,
            ErrorCode::IllegalFunctionCall => 5,
            ErrorCode::Overflow => 6,
            ErrorCode::UndefinedLine => 8,
            ErrorCode::SubscriptOutOfRange => 9,
            ErrorCode::DivisionByZero => 11,
            ErrorCode::TypeMismatch => 13,
            ErrorCode::NoResume => 19,
            ErrorCode::ResumeWithoutError => 20,
            ErrorCode::BadFileNumber => 52,
            ErrorCode::FileNotFound => 53,
            ErrorCode::FileAlreadyOpen => 55,
            ErrorCode::InputPastEnd => 62,
            ErrorCode::PathNotFound => 76,
        }
    }

    /// Classic message text.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Break => "Break",
            ErrorCode::NextWithoutFor => "NEXT without FOR",
            ErrorCode::Syntax => "Syntax error",
            ErrorCode::ReturnWithoutGosub => "RETURN without GOSUB",
            ErrorCode::OutOfData => "Out of DATA",
            ErrorCode::IllegalFunctionCall => "Illegal function call",
            ErrorCode::Overflow => "Overflow",
            ErrorCode::UndefinedLine => "Undefined line number",
            ErrorCode::SubscriptOutOfRange => "Subscript out of range",
            ErrorCode::DivisionByZero => "Division by zero",
            ErrorCode::TypeMismatch => "Type mismatch",
            ErrorCode::NoResume => "No RESUME",
            ErrorCode::ResumeWithoutError => "RESUME without error",
            ErrorCode::BadFileNumber => "Bad file name or number",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::FileAlreadyOpen => "File already open",
            ErrorCode::InputPastEnd => "Input past end",
            ErrorCode::PathNotFound => "Path not found",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// An error surfaced to the driver, with the phase it came from.
#[derive(Clone, Debug, Error)]
pub enum BasicError {
    #[error("{message} in line {line}")]
    Lexical { message: String, line: u32 },

    #[error("{message} in line {line}")]
    Parse { message: String, line: u32 },

    #[error("{code} in line {line}")]
    Runtime { code: ErrorCode, line: u32 },
}

impl BasicError {
    /// Classic numeric code. Lexical and parse faults report 2 (Syntax
    /// error) unless the parser tagged a missing line target (8).
    pub fn code(&self) -> u32 {
        match self {
            BasicError::Lexical { .. } => ErrorCode::Syntax.code(),
            BasicError::Parse { message, .. } => {
                if message.contains("Undefined line") {
                    ErrorCode::UndefinedLine.code()
                } else {
                    ErrorCode::Syntax.code()
                }
            }
            BasicError::Runtime { code, .. } => code.code(),
        }
    }

    /// Source line the error was raised on.
    pub fn line(&self) -> u32 {
        match self {
            BasicError::Lexical { line, .. }
            | BasicError::Parse { line, .. }
            | BasicError::Runtime { line, .. } => *line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_codes() {
        assert_eq!(ErrorCode::DivisionByZero.code(), 11);
        assert_eq!(ErrorCode::TypeMismatch.code(), 13);
        assert_eq!(ErrorCode::SubscriptOutOfRange.code(), 9);
        assert_eq!(ErrorCode::PathNotFound.code(), 76);
    }

    #[test]
    fn runtime_display_names_the_line() {
        let e = BasicError::Runtime { code: ErrorCode::OutOfData, line: 120 };
        assert_eq!(e.to_string(), "Out of DATA in line 120");
        assert_eq!(e.code(), 4);
        assert_eq!(e.line(), 120);
    }
}
