//! CLI configuration

use convoy_client::QueueClient;

#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the Convoy server
    pub server_url: String,
    pub token: Option<String>,
}

impl Config {
    pub fn client(&self) -> QueueClient {
        QueueClient::new(self.server_url.clone()).with_token(self.token.clone())
    }
}
