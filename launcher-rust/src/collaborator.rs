use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
};

use crate::launch::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Info,
    Warning,
    Error,
}

/// Everything the launcher needs from whoever is driving it.
///
/// `None` and `false` mean the user backed out.
pub trait Collaborator {
    fn select_folder(&mut self, prompt: &str) -> Option<PathBuf>;
    fn select_file(&mut self, prompt: &str) -> Option<PathBuf>;
    fn prompt_text(&mut self, prompt: &str, default: &str) -> Option<String>;
    fn confirm(&mut self, question: &str) -> bool;
    fn notify(&mut self, kind: Notice, message: &str);
    fn progress(&mut self, stage: Stage);
}

/// Line-oriented prompts on stdin, messages on stderr.
pub struct ConsoleCollaborator<R, W> {
    input: R,
    output: W,
}

impl ConsoleCollaborator<io::StdinLock<'static>, io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stderr())
    }
}

impl<R: BufRead, W: Write> ConsoleCollaborator<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Trimmed line, or `None` on EOF or an empty answer.
    fn ask(&mut self, prompt: &str) -> Option<String> {
        let _ = write!(self.output, "{prompt}");
        let _ = self.output.flush();
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                let answer = line.trim();
                (!answer.is_empty()).then(|| answer.to_string())
            }
        }
    }
}

impl<R: BufRead, W: Write> Collaborator for ConsoleCollaborator<R, W> {
    fn select_folder(&mut self, prompt: &str) -> Option<PathBuf> {
        self.ask(&format!("{prompt}\nfolder (empty to cancel): "))
            .map(PathBuf::from)
    }

    fn select_file(&mut self, prompt: &str) -> Option<PathBuf> {
        self.ask(&format!("{prompt}\nfile (empty to cancel): "))
            .map(PathBuf::from)
    }

    fn prompt_text(&mut self, prompt: &str, default: &str) -> Option<String> {
        let _ = write!(self.output, "{prompt} [{default}]: ");
        let _ = self.output.flush();
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) if line.trim().is_empty() => Some(default.to_string()),
            Ok(_) => Some(line.trim().to_string()),
        }
    }

    fn confirm(&mut self, question: &str) -> bool {
        self.ask(&format!("{question} [y/N]: "))
            .is_some_and(|a| a.eq_ignore_ascii_case("y") || a.eq_ignore_ascii_case("yes"))
    }

    fn notify(&mut self, kind: Notice, message: &str) {
        let tag = match kind {
            Notice::Info => "info",
            Notice::Warning => "warning",
            Notice::Error => "error",
        };
        let _ = writeln!(self.output, "{tag}: {message}");
    }

    fn progress(&mut self, stage: Stage) {
        let _ = writeln!(self.output, "[{}]", stage.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn console(input: &str) -> ConsoleCollaborator<&[u8], Vec<u8>> {
        ConsoleCollaborator::new(input.as_bytes(), Vec::new())
    }

    #[test]
    fn empty_answer_cancels_selection() {
        let mut c = console("\n");
        assert_eq!(c.select_folder("Pick the game folder"), None);
        let mut c = console("");
        assert_eq!(c.select_file("Pick MAA.exe"), None);
    }

    #[test]
    fn selection_is_trimmed() {
        let mut c = console("  /games/ArknightsGame  \n");
        assert_eq!(
            c.select_folder("Pick the game folder"),
            Some(PathBuf::from("/games/ArknightsGame"))
        );
    }

    #[test]
    fn prompt_text_uses_default_on_empty_line() {
        let mut c = console("\nalt\n");
        assert_eq!(c.prompt_text("Label", "main").as_deref(), Some("main"));
        assert_eq!(c.prompt_text("Label", "main").as_deref(), Some("alt"));
        assert_eq!(c.prompt_text("Label", "main"), None);
    }

    #[test]
    fn confirm_requires_yes() {
        assert!(console("y\n").confirm("Delete?"));
        assert!(console("YES\n").confirm("Delete?"));
        assert!(!console("n\n").confirm("Delete?"));
        assert!(!console("").confirm("Delete?"));
    }

    #[test]
    fn notices_are_tagged() {
        let mut c = console("");
        c.notify(Notice::Warning, "process 12 still running");
        c.progress(Stage::DeployingPayload);
        let out = String::from_utf8(c.output).unwrap();
        assert!(out.contains("warning: process 12 still running"));
        assert!(out.contains("[deploying payload]"));
    }
}
