//! Command definition file parser.
//!
//! The format is line-oriented. A command starts at a `= name` line
//! and runs to the next one or end of file; `== section` lines open
//! the named section within it. Section names are case-insensitive.
//! Lines beginning with `#` are comments.
//!
//! ```text
//! = who
//! == abstract
//!   List connected users.
//! == restriction
//!   user
//! == synonyms
//!   users, online
//! == code
//!   who
//! ```
//!
//! Recognized sections: `abstract` (one stripped line), `restriction`
//! (one token, checked against the account-type table), `synonyms`
//! (comma or semicolon separated, accumulated across lines),
//! `description` (lines joined with spaces, blank lines separating
//! paragraphs), `usage` (kept verbatim), `code` (kept verbatim, must
//! be non-empty). Anything else is ignored with a warning.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::errors::{OutpostError, OutpostResult};
use crate::users::AccountType;

static COMMAND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^=\s*(\w+)").expect("command header pattern"));
static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^==\s*(\w+)").expect("section header pattern"));

/// A command as read from its file, before its body is bound to a
/// handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub source_file: PathBuf,
    pub source_line: usize,
    pub summary: String,
    pub description: String,
    pub usage: String,
    pub restriction: AccountType,
    pub synonyms: Vec<String>,
    pub body_source: String,
}

impl ParsedCommand {
    /// Render back into definition-file form. `parse` of the result
    /// yields an equal command (source location aside).
    pub fn to_source(&self) -> String {
        let mut out = format!("= {}\n", self.name);
        if !self.summary.is_empty() {
            out.push_str("== abstract\n");
            out.push_str(&format!("  {}\n", self.summary));
        }
        out.push_str("== restriction\n");
        out.push_str(&format!("  {}\n", self.restriction.name()));
        if !self.synonyms.is_empty() {
            out.push_str("== synonyms\n");
            out.push_str(&format!("  {}\n", self.synonyms.join(", ")));
        }
        if !self.description.is_empty() {
            out.push_str("== description\n");
            for (i, paragraph) in self.description.split("\n\n").enumerate() {
                if i > 0 {
                    out.push('\n');
                }
                out.push_str(&format!("  {}\n", paragraph));
            }
        }
        if !self.usage.is_empty() {
            out.push_str("== usage\n");
            for line in self.usage.lines() {
                out.push_str(&format!("  {}\n", line));
            }
        }
        out.push_str("== code\n");
        for line in self.body_source.lines() {
            out.push_str(&format!("  {}\n", line));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Abstract,
    Restriction,
    Synonyms,
    Description,
    Usage,
    Code,
    Unknown,
}

impl Section {
    fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "abstract" => Section::Abstract,
            "restriction" => Section::Restriction,
            "synonyms" => Section::Synonyms,
            "description" => Section::Description,
            "usage" => Section::Usage,
            "code" => Section::Code,
            _ => Section::Unknown,
        }
    }
}

/// Accumulates one command while its lines come in.
struct PartialCommand {
    name: String,
    line: usize,
    summary: String,
    restriction: Option<AccountType>,
    synonyms: Vec<String>,
    description_parts: Vec<String>,
    paragraph_break: bool,
    usage_lines: Vec<String>,
    code_lines: Vec<String>,
}

impl PartialCommand {
    fn new(name: String, line: usize) -> Self {
        Self {
            name,
            line,
            summary: String::new(),
            restriction: None,
            synonyms: Vec::new(),
            description_parts: Vec::new(),
            paragraph_break: false,
            usage_lines: Vec::new(),
            code_lines: Vec::new(),
        }
    }

    fn finish(self, file: &Path) -> OutpostResult<ParsedCommand> {
        let body_source = self.code_lines.join("\n");
        if body_source.trim().is_empty() {
            return Err(OutpostError::CommandParse {
                file: file.to_path_buf(),
                line: self.line,
                message: format!("command '{}' has an empty body", self.name),
            });
        }

        let mut description = String::new();
        for (i, part) in self.description_parts.iter().enumerate() {
            if i > 0 {
                description.push_str(if part == "\n\n" || self.description_parts[i - 1] == "\n\n" {
                    ""
                } else {
                    " "
                });
            }
            description.push_str(part);
        }

        Ok(ParsedCommand {
            name: self.name,
            source_file: file.to_path_buf(),
            source_line: self.line,
            summary: self.summary,
            description,
            usage: self.usage_lines.join("\n"),
            restriction: self.restriction.unwrap_or(AccountType::User),
            synonyms: self.synonyms,
            body_source,
        })
    }
}

/// Parser for `.cmd` definition files.
#[derive(Debug, Default, Clone)]
pub struct CommandParser;

impl CommandParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_file(&self, path: &Path) -> OutpostResult<Vec<ParsedCommand>> {
        let content = fs::read_to_string(path)?;
        self.parse_str(&content, path)
    }

    pub fn parse_str(&self, content: &str, file: &Path) -> OutpostResult<Vec<ParsedCommand>> {
        let mut commands = Vec::new();
        let mut current: Option<PartialCommand> = None;
        let mut section = Section::None;

        for (index, raw_line) in content.lines().enumerate() {
            let line_no = index + 1;

            if raw_line.starts_with('#') {
                continue;
            }

            if let Some(caps) = SECTION_RE.captures(raw_line) {
                if current.is_none() {
                    return Err(OutpostError::CommandParse {
                        file: file.to_path_buf(),
                        line: line_no,
                        message: "section header before any command".to_string(),
                    });
                }
                section = Section::from_name(&caps[1]);
                if section == Section::Unknown {
                    warn!(
                        file = %file.display(),
                        line = line_no,
                        "ignoring unknown section '{}'",
                        &caps[1]
                    );
                }
                continue;
            }

            // `==` lines are consumed above, so this only sees `= name`.
            if let Some(caps) = COMMAND_RE.captures(raw_line) {
                if let Some(done) = current.take() {
                    commands.push(done.finish(file)?);
                }
                current = Some(PartialCommand::new(caps[1].to_string(), line_no));
                section = Section::None;
                continue;
            }

            let Some(cmd) = current.as_mut() else {
                if !raw_line.trim().is_empty() {
                    warn!(
                        file = %file.display(),
                        line = line_no,
                        "ignoring text outside any command"
                    );
                }
                continue;
            };

            match section {
                Section::None | Section::Unknown => {}
                Section::Abstract => {
                    let text = raw_line.trim();
                    if !text.is_empty() && cmd.summary.is_empty() {
                        if text.len() > 70 {
                            warn!(
                                file = %file.display(),
                                line = line_no,
                                "abstract for '{}' exceeds 70 characters",
                                cmd.name
                            );
                        }
                        cmd.summary = text.to_string();
                    }
                }
                Section::Restriction => {
                    let token = raw_line.trim();
                    if token.is_empty() {
                        continue;
                    }
                    match AccountType::from_name(token) {
                        Some(level) => cmd.restriction = Some(level),
                        None => {
                            return Err(OutpostError::CommandParse {
                                file: file.to_path_buf(),
                                line: line_no,
                                message: format!("unknown restriction '{}'", token),
                            });
                        }
                    }
                }
                Section::Synonyms => {
                    cmd.synonyms.extend(
                        raw_line
                            .split([',', ';'])
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(String::from),
                    );
                }
                Section::Description => {
                    let text = raw_line.trim();
                    if text.is_empty() {
                        if !cmd.description_parts.is_empty() && !cmd.paragraph_break {
                            cmd.description_parts.push("\n\n".to_string());
                            cmd.paragraph_break = true;
                        }
                    } else {
                        cmd.description_parts.push(text.to_string());
                        cmd.paragraph_break = false;
                    }
                }
                Section::Usage => {
                    cmd.usage_lines.push(raw_line.trim().to_string());
                }
                Section::Code => {
                    cmd.code_lines.push(raw_line.trim().to_string());
                }
            }
        }

        if let Some(done) = current.take() {
            commands.push(done.finish(file)?);
        }

        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> OutpostResult<Vec<ParsedCommand>> {
        CommandParser::new().parse_str(content, Path::new("test.cmd"))
    }

    const WHO: &str = r#"
= who
== abstract
  List connected users.
== restriction
  user
== synonyms
  users, online; connected
== description
  Shows everyone connected right now.

  Account types are shown in parentheses.
== usage
  /who
== code
  who
"#;

    #[test]
    fn parses_all_sections() {
        let commands = parse(WHO).unwrap();
        assert_eq!(commands.len(), 1);
        let who = &commands[0];
        assert_eq!(who.name, "who");
        assert_eq!(who.summary, "List connected users.");
        assert_eq!(who.restriction, AccountType::User);
        assert_eq!(who.synonyms, vec!["users", "online", "connected"]);
        assert_eq!(
            who.description,
            "Shows everyone connected right now.\n\nAccount types are shown in parentheses."
        );
        assert_eq!(who.usage, "/who");
        assert_eq!(who.body_source, "who");
        assert_eq!(who.source_line, 2);
    }

    #[test]
    fn multiple_commands_per_file() {
        let content = "= one\n== code\n  echo\n  first\n= two\n== code\n  echo\n  second\n";
        let commands = parse(content).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].name, "one");
        assert_eq!(commands[1].name, "two");
        assert_eq!(commands[1].body_source, "echo\nsecond");
    }

    #[test]
    fn comments_are_skipped() {
        let content = "# a file comment\n= cmd\n# not part of the body\n== code\n  echo\n  hi\n";
        let commands = parse(content).unwrap();
        assert_eq!(commands[0].body_source, "echo\nhi");
    }

    #[test]
    fn section_names_are_case_insensitive() {
        let content = "= cmd\n== ABSTRACT\n  Hello.\n== Code\n  echo\n  hi\n";
        let commands = parse(content).unwrap();
        assert_eq!(commands[0].summary, "Hello.");
    }

    #[test]
    fn unknown_restriction_is_an_error() {
        let content = "= cmd\n== restriction\n  wizard\n== code\n  echo\n  hi\n";
        let err = parse(content).unwrap_err();
        match err {
            OutpostError::CommandParse { line, message, .. } => {
                assert_eq!(line, 3);
                assert!(message.contains("wizard"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn empty_body_is_an_error() {
        let content = "= cmd\n== abstract\n  Has no code.\n";
        let err = parse(content).unwrap_err();
        assert!(matches!(err, OutpostError::CommandParse { .. }));
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let content = "= cmd\n== flavor\n  ignored entirely\n== code\n  echo\n  hi\n";
        let commands = parse(content).unwrap();
        assert_eq!(commands[0].body_source, "echo\nhi");
    }

    #[test]
    fn restriction_defaults_to_user() {
        let content = "= cmd\n== code\n  echo\n  hi\n";
        let commands = parse(content).unwrap();
        assert_eq!(commands[0].restriction, AccountType::User);
    }

    #[test]
    fn round_trip() {
        let commands = parse(WHO).unwrap();
        let rendered = commands[0].to_source();
        let reparsed = parse(&rendered).unwrap();
        assert_eq!(reparsed.len(), 1);

        let (a, b) = (&commands[0], &reparsed[0]);
        assert_eq!(a.name, b.name);
        assert_eq!(a.summary, b.summary);
        assert_eq!(a.restriction, b.restriction);
        assert_eq!(a.synonyms, b.synonyms);
        assert_eq!(a.description, b.description);
        assert_eq!(a.usage, b.usage);
        assert_eq!(a.body_source, b.body_source);
    }
}
