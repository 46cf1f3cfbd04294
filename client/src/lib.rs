pub mod cli;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;

pub use client::{ChatClient, ConnectionState};
pub use config::ClientConfig;
pub use credentials::{CredentialProvider, StaticCredentials};
pub use error::ClientError;
pub use events::{ChatMessage, ClientEvent, ConnectionStatus, Subscription};
