//! Menu collaborator: the narrow interface the orchestrator uses to ask the
//! user to pick one option, plus a line-based terminal implementation.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};

use crate::core::menu::{MenuChoice, MenuOption, render_options, resolve_input};

/// Invalid answers tolerated before the menu gives up and cancels.
const MAX_ATTEMPTS: usize = 5;

pub trait Menu {
    fn choose<T: Clone>(&self, title: &str, options: &[MenuOption<T>]) -> Result<MenuChoice<T>>;
}

/// Prompts on stderr and reads answers from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalMenu;

impl Menu for TerminalMenu {
    fn choose<T: Clone>(&self, title: &str, options: &[MenuOption<T>]) -> Result<MenuChoice<T>> {
        let stdin = std::io::stdin();
        let mut input = stdin.lock();
        let mut output = std::io::stderr();
        prompt_choice(&mut input, &mut output, title, options)
    }
}

/// Present `options` on `output` and read answers from `input` until one
/// resolves. `q` or end of input cancels.
pub fn prompt_choice<T: Clone, R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    title: &str,
    options: &[MenuOption<T>],
) -> Result<MenuChoice<T>> {
    writeln!(output, "\n{title}").context("write menu")?;
    for line in render_options(options) {
        writeln!(output, "  {line}").context("write menu")?;
    }

    for _ in 0..MAX_ATTEMPTS {
        write!(output, "Choose (q to cancel): ").context("write menu")?;
        output.flush().context("flush menu")?;

        let mut answer = String::new();
        let read = input.read_line(&mut answer).context("read menu answer")?;
        if read == 0 {
            return Ok(MenuChoice::Cancelled);
        }
        let answer = answer.trim();
        if answer.eq_ignore_ascii_case("q") {
            return Ok(MenuChoice::Cancelled);
        }
        match resolve_input(options, answer) {
            Some(option) => return Ok(MenuChoice::Selected(option.value.clone())),
            None => writeln!(output, "'{answer}' is not an available option.")
                .context("write menu")?,
        }
    }
    Ok(MenuChoice::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn options() -> Vec<MenuOption<u8>> {
        vec![
            MenuOption::new("Resume", 1).hotkey('r'),
            MenuOption::new("Discard", 2).hotkey('d'),
            MenuOption::new("Replan", 3).disabled("no specs"),
        ]
    }

    fn run(answers: &str) -> (MenuChoice<u8>, String) {
        let mut input = Cursor::new(answers.as_bytes().to_vec());
        let mut output = Vec::new();
        let choice = prompt_choice(&mut input, &mut output, "Checkpoint found", &options())
            .expect("choose");
        (choice, String::from_utf8(output).expect("utf8"))
    }

    #[test]
    fn hotkey_selects_option() {
        let (choice, output) = run("d\n");
        assert_eq!(choice, MenuChoice::Selected(2));
        assert!(output.contains("1) [r] Resume"));
        assert!(output.contains("3) Replan (unavailable: no specs)"));
    }

    #[test]
    fn disabled_and_unknown_answers_reprompt() {
        let (choice, output) = run("3\nnope\n1\n");
        assert_eq!(choice, MenuChoice::Selected(1));
        assert_eq!(output.matches("is not an available option").count(), 2);
    }

    #[test]
    fn eof_and_q_cancel() {
        assert_eq!(run("").0, MenuChoice::Cancelled);
        assert_eq!(run("q\n").0, MenuChoice::Cancelled);
    }

    #[test]
    fn gives_up_after_repeated_invalid_answers() {
        assert_eq!(run("x\nx\nx\nx\nx\n1\n").0, MenuChoice::Cancelled);
    }
}
