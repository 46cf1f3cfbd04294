use chat_api::UserId;

/// Source of the bearer token and local user id. Consulted on every connect
/// and reconnect so a refreshed token is picked up.
pub trait CredentialProvider: Send + Sync {
    fn token(&self) -> Option<String>;
    fn user_id(&self) -> Option<UserId>;
}

/// Fixed credentials, e.g. from the command line.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    pub token: Option<String>,
    pub user_id: Option<UserId>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>, user_id: UserId) -> Self {
        Self {
            token: Some(token.into()),
            user_id: Some(user_id),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.token.clone().filter(|t| !t.trim().is_empty())
    }

    fn user_id(&self) -> Option<UserId> {
        self.user_id
    }
}
