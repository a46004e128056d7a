//! Building requests from command words and printing replies.

use anyhow::{Context, Result, bail};

use tally_core::message::{
    CMD_DISCONNECT, CMD_LIST_ALL, ERROR_PREFIX, JSON_PREFIX, Message, Request, TXT_PREFIX,
};
use tally_services::Client;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Add(String),
    AddValue(String, f64),
    Del(String),
    All,
    Hist(String),
    Say(String),
    Disconnect,
    Help,
}

impl Command {
    /// Parse `word args...`. Accepts both `addv` and `/addv`.
    pub fn parse(words: &[&str]) -> Result<Command> {
        let Some((first, args)) = words.split_first() else {
            bail!("empty command");
        };
        let word = first.strip_prefix('/').unwrap_or(*first);
        Ok(match (word, args) {
            ("add", [currency]) => Command::Add(currency.to_string()),
            ("addv", [currency, value]) => Command::AddValue(
                currency.to_string(),
                value
                    .parse()
                    .with_context(|| format!("not a number: {value}"))?,
            ),
            ("del", [currency]) => Command::Del(currency.to_string()),
            ("all", []) => Command::All,
            ("hist", [currency]) => Command::Hist(currency.to_string()),
            ("say", text) if !text.is_empty() => Command::Say(text.join(" ")),
            ("disconnect", []) => Command::Disconnect,
            ("help", _) => Command::Help,
            ("add" | "addv" | "del" | "all" | "hist" | "say" | "disconnect", _) => {
                bail!("invalid arguments for {word}")
            }
            _ => bail!("unknown command: {word}"),
        })
    }

    /// Message sent to the server, `None` for local-only commands.
    pub fn to_message(&self) -> Result<Option<String>> {
        let request = match self {
            Command::Add(currency) => Request::AddCurrency {
                currency: currency.clone(),
            },
            Command::AddValue(currency, value) => Request::AddCurrencyValue {
                currency: currency.clone(),
                value: *value,
            },
            Command::Del(currency) => Request::DelCurrency {
                currency: currency.clone(),
            },
            Command::Hist(currency) => Request::GetCurrencyHistory {
                currency: currency.clone(),
            },
            Command::All => return Ok(Some(Message::command(CMD_LIST_ALL).render())),
            Command::Say(text) => return Ok(Some(Message::text(text.clone()).render())),
            Command::Disconnect => return Ok(Some(Message::command(CMD_DISCONNECT).render())),
            Command::Help => return Ok(None),
        };
        Ok(Some(Message::json(&request)?.render()))
    }
}

/// A reply made readable: tags stripped, JSON pretty-printed.
#[derive(Debug, PartialEq)]
pub enum Reply {
    Ok(String),
    Err(String),
}

pub fn render_reply(raw: &str) -> Reply {
    if let Some(text) = raw.strip_prefix(TXT_PREFIX) {
        Reply::Ok(text.to_string())
    } else if let Some(text) = raw.strip_prefix(ERROR_PREFIX) {
        Reply::Err(text.to_string())
    } else if let Some(doc) = raw.strip_prefix(JSON_PREFIX) {
        match serde_json::from_str::<serde_json::Value>(doc) {
            Ok(value) => Reply::Ok(serde_json::to_string_pretty(&value).unwrap_or_else(|_| doc.into())),
            Err(_) => Reply::Ok(doc.to_string()),
        }
    } else {
        Reply::Ok(raw.to_string())
    }
}

/// Run one command against the server and print the outcome.
/// Returns false when the session was closed.
pub async fn execute(client: &mut Client, command: &Command) -> Result<bool> {
    let Some(message) = command.to_message()? else {
        print_help();
        return Ok(true);
    };

    if *command == Command::Disconnect {
        client.send(&message).await?;
        println!("Disconnected.");
        return Ok(false);
    }

    let raw = client.request(&message).await?;
    match render_reply(&raw) {
        Reply::Ok(text) => println!("{text}"),
        Reply::Err(text) => eprintln!("error: {text}"),
    }
    Ok(true)
}

pub fn print_help() {
    println!("  add <currency>            add a new currency");
    println!("  addv <currency> <value>   add a value to a currency");
    println!("  del <currency>            remove a currency");
    println!("  all                       list all currencies");
    println!("  hist <currency>           history for a currency");
    println!("  say <text...>             send text, the server echoes it");
    println!("  disconnect                close the session");
    println!("  help                      this list");
}
