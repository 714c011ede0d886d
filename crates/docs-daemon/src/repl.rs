//! Line-oriented command driver.
//!
//! Each stdin line is one command. Documents are addressed by display name,
//! resolved against the latest published view.

use anyhow::{anyhow, bail, Result};
use docs_core::{DocumentId, DocumentMetadata, EngineHandle, EngineView};
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    New { name: String, content: String },
    Write { name: String, content: String },
    Cat { name: String },
    Rm { name: String },
    Open { name: String },
    Close,
    Reload,
    Ack,
    Status,
    Quit,
}

pub const HELP: &str = "commands: list | new <name> [content] | write <name> <content> | \
cat <name> | rm <name> | open <name> | close | reload | ack | status | quit";

/// Parse one input line. Blank lines parse to `None`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim_start()),
        None => (line, ""),
    };
    let (first, tail) = match rest.split_once(char::is_whitespace) {
        Some((first, tail)) => (first.to_string(), tail.to_string()),
        None => (rest.to_string(), String::new()),
    };
    let name = || -> Result<String> {
        if first.is_empty() {
            bail!("{} needs a document name", verb);
        }
        Ok(first.clone())
    };

    let command = match verb {
        "list" | "ls" => Command::List,
        // A blank name falls back to the configured default
        "new" => Command::New {
            name: first.clone(),
            content: tail.clone(),
        },
        "write" => Command::Write {
            name: name()?,
            content: tail.clone(),
        },
        "cat" => Command::Cat { name: name()? },
        "rm" => Command::Rm { name: name()? },
        "open" => Command::Open { name: name()? },
        "close" => Command::Close,
        "reload" => Command::Reload,
        "ack" => Command::Ack,
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        other => bail!("Unknown command {:?}; {}", other, HELP),
    };
    Ok(Some(command))
}

/// Find a document by display name, or by full file name.
pub fn resolve<'a>(view: &'a EngineView, name: &str) -> Option<&'a DocumentMetadata> {
    view.documents
        .iter()
        .find(|d| d.display_name == name)
        .or_else(|| view.documents.iter().find(|d| d.id.file_name() == Some(name)))
}

fn lookup(handle: &EngineHandle, name: &str) -> Result<DocumentId> {
    resolve(&handle.view(), name)
        .map(|d| d.id.clone())
        .ok_or_else(|| anyhow!("No document named {:?}", name))
}

/// Run a command against the engine and return what to print.
pub async fn execute(handle: &EngineHandle, command: Command, json: bool) -> Result<String> {
    let output = match command {
        Command::List => render_list(&handle.view(), json)?,
        Command::Status => render_status(&handle.view(), json)?,
        Command::New { name, content } => {
            let id = handle.create(name, content).await?;
            format!("created {} (pending confirmation)", id)
        }
        Command::Write { name, content } => {
            let id = lookup(handle, &name)?;
            handle.update(id.clone(), content).await?;
            format!("wrote {} (pending confirmation)", id)
        }
        Command::Cat { name } => handle.read(lookup(handle, &name)?).await?,
        Command::Rm { name } => {
            let id = lookup(handle, &name)?;
            handle.delete(id.clone()).await?;
            format!("deleted {} (pending confirmation)", id)
        }
        Command::Open { name } => {
            handle.select(Some(lookup(handle, &name)?)).await?;
            format!("opened {}", name)
        }
        Command::Close => {
            handle.select(None).await?;
            "closed".to_string()
        }
        Command::Reload => {
            handle.reload_all().await?;
            format!("reloaded {} documents", handle.view().documents.len())
        }
        Command::Ack => {
            handle.dismiss_error();
            "ok".to_string()
        }
        Command::Quit => String::new(),
    };
    Ok(output)
}

fn render_list(view: &EngineView, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string(&view.documents)?);
    }
    let mut out = String::new();
    for document in &view.documents {
        let selected = view.selection.as_ref().is_some_and(|s| s.id == document.id);
        let _ = writeln!(
            out,
            "{} {:<24} {}",
            if selected { "*" } else { " " },
            document.display_name,
            document
                .last_modified
                .map(|ts| ts.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    if out.is_empty() {
        out.push_str("(no documents)");
    }
    Ok(out.trim_end().to_string())
}

fn render_status(view: &EngineView, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string(view)?);
    }
    let mut out = format!("phase: {:?}, documents: {}", view.phase, view.documents.len());
    if let Some(pending) = &view.pending {
        let _ = write!(out, ", pending: {:?} {}", pending.kind, pending.target);
    }
    if let Some(selection) = &view.selection {
        let _ = write!(out, ", open: {}", selection.display_name);
    }
    if let Some(error) = &view.error {
        let _ = write!(out, ", error: {}", error);
    }
    Ok(out)
}
