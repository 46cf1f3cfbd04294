use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use chat_client::{
    cli::Cli, ChatClient, ClientConfig, ClientEvent, StaticCredentials,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let cli = Cli::parse();

    let credentials = StaticCredentials {
        token: cli.token,
        user_id: cli.user_id,
    };
    let client = ChatClient::new(ClientConfig::new(cli.url), Arc::new(credentials));

    let mut events = client.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::StatusChanged(status) => println!("-- {status}"),
                ClientEvent::MessageReceived(chat) => {
                    let who = if chat.is_current_user {
                        "you".to_string()
                    } else {
                        chat.message.sender_name.clone()
                    };
                    println!("[{}] {}: {}", chat.message.timestamp, who, chat.message.text);
                }
            }
        }
    });

    client.initialize(cli.house).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim() == "/quit" {
                    break;
                }
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = client.send(cli.house, &line).await {
                    warn!(error = %e, "message not sent");
                    println!("-- not sent: {e}");
                }
            }
        }
    }

    client.disconnect().await;
    drop(client);
    printer.abort();
    Ok(())
}
