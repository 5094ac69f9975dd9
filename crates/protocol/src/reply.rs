//! Command replies sent from the device to the peer.

use std::fmt;

use crate::constants::FIELD_SEPARATOR;

/// Category carried in `ERROR|<CODE>|<detail>` lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    UnknownCommand,
    Processing,
    SyntaxError,
    TransferInProgress,
    NoActiveTransfer,
    FileNotFound,
    CaptureFailed,
    ChecksumMismatch,
    Timeout,
    ProtocolError,
    RetriesExhausted,
    InsufficientSpace,
    InvalidName,
    Cancelled,
    Connection,
    IoError,
    /// Any code not listed above, kept verbatim.
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::UnknownCommand => "UNKNOWN_COMMAND",
            Self::Processing => "PROCESSING",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::TransferInProgress => "TRANSFER_IN_PROGRESS",
            Self::NoActiveTransfer => "NO_ACTIVE_TRANSFER",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::CaptureFailed => "CAPTURE_FAILED",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::Timeout => "TIMEOUT",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::RetriesExhausted => "RETRIES_EXHAUSTED",
            Self::InsufficientSpace => "INSUFFICIENT_SPACE",
            Self::InvalidName => "INVALID_NAME",
            Self::Cancelled => "CANCELLED",
            Self::Connection => "CONNECTION",
            Self::IoError => "IO_ERROR",
            Self::Other(code) => code,
        }
    }

    /// Codes a gated peer sends in answer to a stray command. They never
    /// concern the transfer in progress.
    pub fn is_command_reply(&self) -> bool {
        matches!(self, Self::UnknownCommand | Self::TransferInProgress)
    }

    /// Maps a code received on the wire back to its variant.
    pub fn from_wire(code: &str) -> Self {
        match code {
            "UNKNOWN_COMMAND" => Self::UnknownCommand,
            "PROCESSING" => Self::Processing,
            "SYNTAX_ERROR" => Self::SyntaxError,
            "TRANSFER_IN_PROGRESS" => Self::TransferInProgress,
            "NO_ACTIVE_TRANSFER" => Self::NoActiveTransfer,
            "FILE_NOT_FOUND" => Self::FileNotFound,
            "CAPTURE_FAILED" => Self::CaptureFailed,
            "CHECKSUM_MISMATCH" => Self::ChecksumMismatch,
            "TIMEOUT" => Self::Timeout,
            "PROTOCOL_ERROR" => Self::ProtocolError,
            "RETRIES_EXHAUSTED" => Self::RetriesExhausted,
            "INSUFFICIENT_SPACE" => Self::InsufficientSpace,
            "INVALID_NAME" => Self::InvalidName,
            "CANCELLED" => Self::Cancelled,
            "CONNECTION" => Self::Connection,
            "IO_ERROR" => Self::IoError,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replaces characters that would split a reply into several lines or
/// extra fields.
pub(crate) fn sanitize_field(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            '\r' | '\n' => ' ',
            FIELD_SEPARATOR => '/',
            c => c,
        })
        .collect()
}

/// A single reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `OK|<field>|<field>...`
    Ok(Vec<String>),
    /// A handler-specific success line (`PONG`, `STATUS:ACTIVE|...`).
    ///
    /// Written as-is apart from stripping line breaks.
    Token(String),
    /// `ERROR|<CODE>|<detail>`
    Error { code: ErrorCode, detail: String },
}

impl Reply {
    pub fn ok<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Ok(fields.into_iter().map(Into::into).collect())
    }

    pub fn error(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Error {
            code,
            detail: detail.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Classifies a line received from the device.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("ERROR|") {
            let mut parts = rest.splitn(2, FIELD_SEPARATOR);
            let code = parts.next().unwrap_or_default().trim();
            let detail = parts.next().unwrap_or_default().trim();
            return Self::Error {
                code: ErrorCode::from_wire(code),
                detail: detail.to_string(),
            };
        }
        if line == "OK" {
            return Self::Ok(Vec::new());
        }
        if let Some(rest) = line.strip_prefix("OK|") {
            return Self::Ok(rest.split(FIELD_SEPARATOR).map(str::to_string).collect());
        }
        Self::Token(line.to_string())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok(fields) => {
                f.write_str("OK")?;
                for field in fields {
                    write!(f, "|{}", sanitize_field(field))?;
                }
                Ok(())
            }
            Self::Token(token) => f.write_str(&token.replace(['\r', '\n'], " ")),
            Self::Error { code, detail } => {
                write!(f, "ERROR|{code}|{}", sanitize_field(detail))
            }
        }
    }
}

impl From<String> for Reply {
    fn from(token: String) -> Self {
        Self::Token(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_reply_joins_fields() {
        let reply = Reply::ok(["foto.jpg", "600", "/data/foto.jpg"]);
        assert_eq!(reply.to_string(), "OK|foto.jpg|600|/data/foto.jpg");
    }

    #[test]
    fn empty_ok_reply() {
        assert_eq!(Reply::ok(Vec::<String>::new()).to_string(), "OK");
    }

    #[test]
    fn error_reply_format() {
        let reply = Reply::error(ErrorCode::FileNotFound, "missing.jpg");
        assert_eq!(reply.to_string(), "ERROR|FILE_NOT_FOUND|missing.jpg");
    }

    #[test]
    fn fields_cannot_break_the_line() {
        let reply = Reply::error(ErrorCode::Processing, "boom\r\nCHUNK|0|1");
        assert_eq!(reply.to_string(), "ERROR|PROCESSING|boom  CHUNK/0/1");
    }

    #[test]
    fn parse_classifies_lines() {
        assert_eq!(
            Reply::parse("ERROR|TRANSFER_IN_PROGRESS|busy"),
            Reply::error(ErrorCode::TransferInProgress, "busy")
        );
        assert_eq!(Reply::parse("OK|a|b"), Reply::ok(["a", "b"]));
        assert_eq!(
            Reply::parse("DOWNLOAD_STARTED|ab12cd34|600"),
            Reply::Token("DOWNLOAD_STARTED|ab12cd34|600".into())
        );
    }

    #[test]
    fn command_replies_are_told_apart() {
        assert!(ErrorCode::UnknownCommand.is_command_reply());
        assert!(ErrorCode::from_wire("TRANSFER_IN_PROGRESS").is_command_reply());
        assert!(!ErrorCode::ChecksumMismatch.is_command_reply());
        assert!(!ErrorCode::Cancelled.is_command_reply());
    }

    #[test]
    fn unknown_codes_are_preserved() {
        let code = ErrorCode::from_wire("LIST_FAILED");
        assert_eq!(code, ErrorCode::Other("LIST_FAILED".into()));
        assert_eq!(code.to_string(), "LIST_FAILED");
    }
}
