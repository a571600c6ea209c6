// Interactive client for the portico hub.
use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use portico_client::{Client, Event};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

mod command;

use command::{Command, ParseOutcome};

#[derive(Parser, Debug)]
#[command(name = "hubcli")]
#[command(about = "Interactive client for the portico hub")]
struct Args {
    /// Hub address (host:port)
    #[arg(long, default_value = "localhost:1703")]
    addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let client = Client::connect(&args.addr)
        .await
        .with_context(|| format!("connect to {}", args.addr))?;
    let (commands, mut events) = client.into_parts();

    // Print incoming messages and error signals as they arrive; success
    // signals stay quiet.
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::Message(delivery) => {
                    println!(
                        "< {} ? {}",
                        delivery.port,
                        String::from_utf8_lossy(&delivery.body)
                    );
                }
                Event::Signal(signal) if signal.is_error() => {
                    println!("ERR {}", signal.as_byte());
                }
                Event::Signal(_) => {}
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await.context("read stdin")? else {
            break;
        };
        match command::parse(&line) {
            ParseOutcome::Command(Command::Enter { port }) => commands.enter(port).await?,
            ParseOutcome::Command(Command::Exit { port }) => commands.exit(port).await?,
            ParseOutcome::Command(Command::Send { port, body }) => {
                commands.send(port, Bytes::from(body.into_bytes())).await?
            }
            ParseOutcome::Command(Command::Quit) => {
                println!("quitting. goodbye!");
                break;
            }
            ParseOutcome::Cancelled => println!("command cancelled"),
            ParseOutcome::Invalid => println!("invalid command"),
        }
    }
    printer.abort();
    Ok(())
}
