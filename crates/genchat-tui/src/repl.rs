//! Line-oriented front ends: an interactive REPL and a one-shot `ask`.

use anyhow::{bail, Result};
use genchat_core::{
    ConfigField, ConfigForm, ConfigFormError, EntryKind, PreferenceStore, Session, SessionState,
    SubmitOutcome, Transcript, UiUpdate,
};
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
Type a prompt and press Enter. Entering a line while a response is generating cancels it.
  /stream              toggle streaming responses
  /config              show generation settings
  /set key=value ...   change settings (temperature, top_k, max_output_tokens)
  /help                show this help
  /quit                exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Prompt(String),
    ToggleStreaming,
    ShowConfig,
    Set(Vec<(String, String)>),
    Help,
    Quit,
    Unknown(String),
}

impl ReplCommand {
    pub fn parse(line: &str) -> ReplCommand {
        let trimmed = line.trim();
        let Some(command) = trimmed.strip_prefix('/') else {
            return ReplCommand::Prompt(line.to_string());
        };

        let mut parts = command.split_whitespace();
        match parts.next().unwrap_or_default() {
            "stream" => ReplCommand::ToggleStreaming,
            "config" => ReplCommand::ShowConfig,
            "help" | "?" => ReplCommand::Help,
            "quit" | "exit" | "q" => ReplCommand::Quit,
            "set" => ReplCommand::Set(
                parts
                    .map(|pair| match pair.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => (pair.to_string(), String::new()),
                    })
                    .collect(),
            ),
            other => ReplCommand::Unknown(other.to_string()),
        }
    }
}

/// Writes transcript entries to a terminal as they appear and grow.
///
/// Requests are not echoed since the user just typed them. Streaming text
/// is written incrementally; error entries go to the error writer.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    /// Entries fully written
    done: usize,
    /// Bytes already written of the entry at `done`
    partial: usize,
}

impl TranscriptPrinter {
    /// Returns true when an error entry was written
    pub fn render(
        &mut self,
        transcript: &Transcript,
        out: &mut impl Write,
        err: &mut impl Write,
    ) -> io::Result<bool> {
        let mut wrote_error = false;
        while let Some(entry) = transcript.get(self.done) {
            let open = transcript.streaming_index() == Some(self.done);
            let unseen = entry.text.get(self.partial..).unwrap_or_default();
            match entry.kind {
                EntryKind::Request => {}
                EntryKind::Response => {
                    write!(out, "{}", unseen)?;
                    if !open {
                        writeln!(out)?;
                    }
                    out.flush()?;
                }
                EntryKind::ErrorResponse => {
                    writeln!(err, "error: {}", unseen)?;
                    wrote_error = true;
                }
            }
            if open {
                self.partial = entry.text.len();
                break;
            }
            self.done += 1;
            self.partial = 0;
        }
        Ok(wrote_error)
    }
}

fn apply_settings(
    session: &mut Session,
    store: &mut dyn PreferenceStore,
    pairs: &[(String, String)],
) -> Result<()> {
    if !session.affordances().config_enabled {
        bail!("settings are locked while a response is generating");
    }
    if pairs.is_empty() {
        bail!("usage: /set temperature=0.4 top_k=20 max_output_tokens=512");
    }

    let mut form = ConfigForm::load(store);
    for (key, value) in pairs {
        let Some(field) = ConfigField::from_key(key) else {
            bail!("unknown setting '{}'", key);
        };
        *form.field_mut(field) = value.clone();
    }

    match form.confirm(store, session) {
        Ok(_) => Ok(()),
        Err(ConfigFormError::Invalid(errors)) => {
            let details: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            bail!("{}", details.join("\n"))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_prompt_marker() {
    print!("> ");
    let _ = io::stdout().flush();
}

pub async fn run_repl(
    mut session: Session,
    mut store: Box<dyn PreferenceStore + Send>,
    mut use_streaming: bool,
    model: &str,
) -> Result<bool> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printer = TranscriptPrinter::default();
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();

    println!(
        "genchat {} - model {} - streaming {} (/help for commands)",
        env!("CARGO_PKG_VERSION"),
        model,
        if use_streaming { "on" } else { "off" }
    );
    print_prompt_marker();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match ReplCommand::parse(&line) {
                    ReplCommand::Prompt(prompt) => {
                        if let SubmitOutcome::CancelRequested(_) = session.submit(&prompt, use_streaming) {
                            eprintln!("cancelling...");
                        }
                    }
                    ReplCommand::ToggleStreaming => {
                        if session.affordances().streaming_toggle_enabled {
                            use_streaming = !use_streaming;
                            println!("streaming {}", if use_streaming { "on" } else { "off" });
                        } else {
                            eprintln!("streaming can't be changed while a response is generating");
                        }
                    }
                    ReplCommand::ShowConfig => {
                        let params = session.params();
                        println!(
                            "temperature={} top_k={} max_output_tokens={}",
                            params.temperature, params.top_k, params.max_output_tokens
                        );
                    }
                    ReplCommand::Set(pairs) => {
                        if let Err(e) = apply_settings(&mut session, store.as_mut(), &pairs) {
                            eprintln!("{}", e);
                        }
                    }
                    ReplCommand::Help => println!("{}", HELP),
                    ReplCommand::Quit => break,
                    ReplCommand::Unknown(name) => eprintln!("unknown command '/{}', try /help", name),
                }
            }
            Some(event) = session.next_event() => session.apply(event),
        }
        session.apply_pending_config().await;

        printer.render(session.transcript(), &mut stdout, &mut stderr)?;

        let mut show_marker = false;
        for update in session.take_updates() {
            match update {
                UiUpdate::Notice(text) => eprintln!("{}", text),
                UiUpdate::ConfigUpdated(params) => println!(
                    "saved: temperature={} top_k={} max_output_tokens={}",
                    params.temperature, params.top_k, params.max_output_tokens
                ),
                UiUpdate::StateChanged(SessionState::Idle) => show_marker = true,
                _ => {}
            }
        }
        if show_marker || !session.state().is_generating() {
            print_prompt_marker();
        }
    }

    println!();
    session.shutdown().await;
    Ok(use_streaming)
}

/// Send one prompt and print the answer. Returns false when the engine reported an error.
pub async fn run_ask(mut session: Session, prompt: &str, use_streaming: bool) -> Result<bool> {
    if let SubmitOutcome::Rejected = session.submit(prompt, use_streaming) {
        bail!("prompt is empty");
    }

    let mut printer = TranscriptPrinter::default();
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let mut failed = printer.render(session.transcript(), &mut stdout, &mut stderr)?;

    while session.state().is_generating() {
        tokio::select! {
            Some(event) = session.next_event() => session.apply(event),
            _ = tokio::signal::ctrl_c() => {
                session.submit("", use_streaming);
            }
        }
        failed |= printer.render(session.transcript(), &mut stdout, &mut stderr)?;
    }

    session.shutdown().await;
    Ok(!failed)
}
