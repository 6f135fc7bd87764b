//! Bot commands recognised ahead of the completion pipeline.

/// A slash command. Unknown commands are treated as ordinary text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Reset,
    ShowDialog,
}

impl Command {
    /// Parse the first word of `text`, ignoring a trailing `@botname`.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let name = word.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);
        match name.to_lowercase().as_str() {
            "start" => Some(Command::Start),
            "help" => Some(Command::Help),
            "reset_conversation" | "reset" => Some(Command::Reset),
            "show_dialog" | "history" => Some(Command::ShowDialog),
            _ => None,
        }
    }

    /// Whether the command reads or writes the history and so needs the lock.
    pub fn needs_lock(&self) -> bool {
        matches!(self, Command::Reset | Command::ShowDialog)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Help => "help",
            Command::Reset => "reset_conversation",
            Command::ShowDialog => "show_dialog",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("/start", Some(Command::Start))]
    #[test_case("/help", Some(Command::Help))]
    #[test_case("/reset_conversation", Some(Command::Reset))]
    #[test_case("/reset@parley_bot", Some(Command::Reset))]
    #[test_case("/show_dialog please", Some(Command::ShowDialog))]
    #[test_case("/HISTORY", Some(Command::ShowDialog))]
    #[test_case("/weather", None)]
    #[test_case("hello /start", None)]
    #[test_case("", None)]
    fn test_parse(text: &str, expected: Option<Command>) {
        assert_eq!(Command::parse(text), expected);
    }

    #[test]
    fn test_needs_lock() {
        assert!(Command::Reset.needs_lock());
        assert!(Command::ShowDialog.needs_lock());
        assert!(!Command::Start.needs_lock());
        assert!(!Command::Help.needs_lock());
    }
}
