//! Interactive prompt: `/command args` lines are commands, anything else is
//! sent as text.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use tally_services::Client;

use super::request::{Command, execute};

/// How one input line is interpreted.
pub fn interpret(line: &str) -> Option<Result<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with('/') {
        let words: Vec<&str> = line.split_whitespace().collect();
        Some(Command::parse(&words))
    } else {
        Some(Ok(Command::Say(line.to_string())))
    }
}

pub async fn run(client: &mut Client) -> Result<()> {
    println!("Connected to {}. /help for commands, Ctrl-D to quit.", client.server());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let command = match interpret(&line) {
            None => continue,
            Some(Ok(c)) => c,
            Some(Err(e)) => {
                eprintln!("{e}");
                continue;
            }
        };
        match execute(client, &command).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            // Keep the prompt alive; the next request may well get through.
            Err(e) => eprintln!("error: {e:#}"),
        }
    }
    Ok(())
}
