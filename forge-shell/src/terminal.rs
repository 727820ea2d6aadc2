//! Echo-only terminal pane. Nothing is executed.

pub const PROMPT: &str = "\x1b[1;32m➜\x1b[0m ";

const BANNER: [&str; 3] = [
    "┌────────────────────────────────────────┐",
    "│   Welcome to AI Development Platform   │",
    "└────────────────────────────────────────┘",
];

#[derive(Debug, Clone)]
pub struct TerminalPane {
    screen: String,
    line: String,
}

impl Default for TerminalPane {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalPane {
    pub fn new() -> Self {
        let mut screen = BANNER.join("\r\n");
        screen.push_str("\r\n\r\n");
        screen.push_str(PROMPT);
        Self {
            screen,
            line: String::new(),
        }
    }

    /// Feed raw input and return what the pane writes back.
    pub fn input(&mut self, bytes: &[u8]) -> String {
        let mut echo = String::new();
        for ch in String::from_utf8_lossy(bytes).chars() {
            match ch {
                '\r' => {
                    if !self.line.is_empty() {
                        log::trace!("terminal line: {}", self.line);
                    }
                    self.line.clear();
                    echo.push_str("\r\n");
                    echo.push_str(PROMPT);
                }
                _ => {
                    self.line.push(ch);
                    echo.push(ch);
                }
            }
        }
        self.screen.push_str(&echo);
        echo
    }

    /// Everything written so far, banner included.
    pub fn screen(&self) -> &str {
        &self.screen
    }

    pub fn current_line(&self) -> &str {
        &self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_and_prompt() {
        let pane = TerminalPane::new();
        assert!(pane.screen().contains("Welcome to AI Development Platform"));
        assert!(pane.screen().ends_with(PROMPT));
    }

    #[test]
    fn test_echo_and_enter() {
        let mut pane = TerminalPane::new();
        assert_eq!(pane.input(b"ls"), "ls");
        assert_eq!(pane.current_line(), "ls");

        let out = pane.input(b"\r");
        assert_eq!(out, format!("\r\n{PROMPT}"));
        assert_eq!(pane.current_line(), "");
        assert!(pane.screen().ends_with(&format!("ls\r\n{PROMPT}")));
    }
}
