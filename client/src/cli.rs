use chat_api::{HouseId, UserId};
use clap::Parser;

/// Command line interface for the terminal house chat.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Base WebSocket URL of the chat hub.
    #[arg(long, default_value = "ws://127.0.0.1:8787")]
    pub url: String,
    /// House whose chat to join.
    #[arg(long)]
    pub house: HouseId,
    /// Bearer token issued for the current user.
    #[arg(long, env = "HOUSE_CHAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// Id of the current user, used to tell own messages apart.
    #[arg(long)]
    pub user_id: Option<UserId>,
}
