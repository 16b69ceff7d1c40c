// file: src/cli/prompt.rs
// version: 1.0.0
// guid: a593e7e1-605a-4c5a-95fe-7c87ffd87e6c

//! Interactive prompts used when `--yes` is not given

use crate::{Result, SetupError};
use std::io::{BufRead, Write};

/// Ask a question; an empty answer selects `default` when there is one
pub fn ask<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    question: &str,
    default: Option<&str>,
) -> Result<String> {
    loop {
        match default {
            Some(value) => write!(output, "{} [{}]: ", question, value)?,
            None => write!(output, "{}: ", question)?,
        }
        output.flush()?;

        let mut answer = String::new();
        if input.read_line(&mut answer)? == 0 {
            return Err(SetupError::config(format!("No answer given for '{}'", question)));
        }
        let answer = answer.trim();
        if !answer.is_empty() {
            return Ok(answer.to_string());
        }
        if let Some(value) = default {
            return Ok(value.to_string());
        }
    }
}

/// Yes/no question defaulting to no
pub fn confirm<R: BufRead, W: Write>(input: &mut R, output: &mut W, question: &str) -> Result<bool> {
    let answer = ask(input, output, &format!("{} (y/N)", question), Some("n"))?;
    Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// [`ask`] on the process's terminal
pub fn ask_stdin(question: &str, default: Option<&str>) -> Result<String> {
    let stdin = std::io::stdin();
    ask(&mut stdin.lock(), &mut std::io::stdout(), question, default)
}

/// [`confirm`] on the process's terminal
pub fn confirm_stdin(question: &str) -> Result<bool> {
    let stdin = std::io::stdin();
    confirm(&mut stdin.lock(), &mut std::io::stdout(), question)
}
