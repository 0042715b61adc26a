//! Human interaction: confirmations, disambiguation and manual steps.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result, bail};

/// Asks a human a question and returns the answer text.
pub trait HumanInput {
    /// When `allowed_answers` is set, only those answers (case-insensitive,
    /// or an empty answer meaning the first one) are accepted.
    fn ask(&self, question: &str, allowed_answers: Option<&[&str]>) -> Result<String>;
}

/// Interactive stdin/stdout prompt.
#[derive(Debug, Default)]
pub struct TerminalInput;

impl HumanInput for TerminalInput {
    fn ask(&self, question: &str, allowed_answers: Option<&[&str]>) -> Result<String> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();
        loop {
            let written = match allowed_answers {
                Some(allowed) => write!(stdout, "\n{question} [{}]: ", allowed.join("/")),
                None => write!(stdout, "\n{question}\n> "),
            };
            written.context("write prompt")?;
            stdout.flush().context("flush prompt")?;

            let mut line = String::new();
            let read = stdin.lock().read_line(&mut line).context("read answer")?;
            if read == 0 {
                bail!("stdin closed while waiting for an answer");
            }
            let answer = line.trim().to_string();
            match allowed_answers {
                None => return Ok(answer),
                Some(allowed) => {
                    if let Some(choice) = match_allowed(&answer, allowed) {
                        return Ok(choice.to_string());
                    }
                    writeln!(stdout, "Please answer one of: {}", allowed.join(", "))
                        .context("write hint")?;
                }
            }
        }
    }
}

/// Map `answer` onto an allowed answer. Empty input picks the first (default).
pub fn match_allowed<'a>(answer: &str, allowed: &[&'a str]) -> Option<&'a str> {
    let answer = answer.trim();
    if answer.is_empty() {
        return allowed.first().copied();
    }
    allowed
        .iter()
        .copied()
        .find(|candidate| candidate.eq_ignore_ascii_case(answer))
}
