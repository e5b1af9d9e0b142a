use std::thread;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::protocol::{self, NICKNAME_PROMPT, ProtocolError};

pub const CHAT_HINT: &str = "You can start chatting. Use @username to message a specific user.";
pub const DISCONNECTED: &str = "Disconnected from server.";

pub async fn run(address: &str) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(address).await?;
    let mut input = spawn_stdin_reader();

    let Some(nickname) = prompt_nickname(&mut input).await? else {
        shutdown_connection(&mut writer).await;
        return Ok(());
    };
    protocol::write_line(&mut writer, &nickname)
        .await
        .context("failed to send nickname")?;

    match protocol::read_line(&mut reader)
        .await
        .context("failed to read server confirmation")?
    {
        Some(confirmation) => write_stdout(&confirmation).await?,
        None => {
            write_stdout(DISCONNECTED).await?;
            return Ok(());
        }
    }
    write_stdout(CHAT_HINT).await?;

    let printer = tokio::spawn(print_server_lines(reader));
    run_client_loop(&mut input, &mut writer, printer).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(address: &str) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("failed to connect to {address}"))?;

    info!("connected to {address}");

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// Terminal lines arrive from a plain thread: a blocking stdin read must not
/// keep the runtime alive once the server hangs up.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn prompt_nickname(input: &mut mpsc::UnboundedReceiver<String>) -> Result<Option<String>> {
    loop {
        write_prompt(&format!("{NICKNAME_PROMPT} ")).await?;
        let Some(line) = input.recv().await else {
            return Ok(None);
        };

        let nickname = line.trim();
        if !nickname.is_empty() {
            return Ok(Some(nickname.to_string()));
        }
        write_stdout(&ProtocolError::EmptyNickname.to_string()).await?;
    }
}

async fn run_client_loop(
    input: &mut mpsc::UnboundedReceiver<String>,
    writer: &mut OwnedWriteHalf,
    mut printer: JoinHandle<()>,
) -> Result<()> {
    let mut forwarding = true;
    loop {
        select! {
            _ = &mut printer => break,
            line = input.recv(), if forwarding => {
                forwarding = handle_stdin_input(line, writer).await;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

/// Returns whether further input should be forwarded.
async fn handle_stdin_input(line: Option<String>, writer: &mut OwnedWriteHalf) -> bool {
    let Some(line) = line else {
        // Local input is done; half-close and let the server end the session.
        shutdown_connection(writer).await;
        return false;
    };

    let text = line.trim();
    if text.is_empty() {
        return true;
    }

    if let Err(error) = protocol::write_line(writer, text).await {
        warn!(?error, "failed to send message");
        return false;
    }
    true
}

async fn print_server_lines(mut reader: BufReader<OwnedReadHalf>) {
    loop {
        match protocol::read_line(&mut reader).await {
            Ok(Some(line)) => {
                if let Err(error) = write_stdout(&line).await {
                    debug!(?error, "failed to print server line");
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                debug!(?error, "failed to read from server");
                break;
            }
        }
    }

    if let Err(error) = write_stdout(DISCONNECTED).await {
        debug!(?error, "failed to print disconnect notice");
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_prompt(prompt: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.as_bytes()).await?;
    stdout.flush().await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
