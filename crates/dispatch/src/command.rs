use chrono::{DateTime, Utc};

use camlink_protocol::PARAM_DELIMITER;

use crate::CommandError;

/// One parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Lowercased command name.
    pub name: String,
    /// Everything after the first `:`, unsplit. `None` when absent or blank.
    pub parameter: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Command {
    /// Parses `name` or `name:parameter`. Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (name, parameter) = match line.split_once(PARAM_DELIMITER) {
            Some((name, param)) => (name, Some(param.trim())),
            None => (line, None),
        };

        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return None;
        }

        Some(Self {
            name,
            parameter: parameter.filter(|p| !p.is_empty()).map(str::to_string),
            received_at: Utc::now(),
        })
    }

    /// The parameter, or a `SYNTAX_ERROR` carrying `usage`.
    pub fn require_parameter(&self, usage: &str) -> Result<&str, CommandError> {
        self.parameter
            .as_deref()
            .ok_or_else(|| CommandError::syntax(format!("usage: {usage}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_is_lowercased() {
        let cmd = Command::parse("  FOTO \r").unwrap();
        assert_eq!(cmd.name, "foto");
        assert_eq!(cmd.parameter, None);
    }

    #[test]
    fn splits_at_first_delimiter_only() {
        let cmd = Command::parse("Descargar:foto:2024.jpg").unwrap();
        assert_eq!(cmd.name, "descargar");
        assert_eq!(cmd.parameter.as_deref(), Some("foto:2024.jpg"));
    }

    #[test]
    fn parameter_case_is_preserved() {
        let cmd = Command::parse("res:1920X1080").unwrap();
        assert_eq!(cmd.parameter.as_deref(), Some("1920X1080"));
    }

    #[test]
    fn blank_parameter_is_absent() {
        let cmd = Command::parse("foto:   ").unwrap();
        assert_eq!(cmd.parameter, None);
    }

    #[test]
    fn blank_lines_do_not_parse() {
        assert!(Command::parse("").is_none());
        assert!(Command::parse("   ").is_none());
        assert!(Command::parse(":orphan").is_none());
    }

    #[test]
    fn require_parameter_reports_usage() {
        let cmd = Command::parse("descargar").unwrap();
        let err = cmd.require_parameter("descargar:<file>").unwrap_err();
        assert_eq!(err.code, camlink_protocol::ErrorCode::SyntaxError);
        assert!(err.detail.contains("descargar:<file>"));
    }
}
