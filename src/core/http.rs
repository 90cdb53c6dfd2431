use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING};
use reqwest::Client;

use crate::core::state::EngineConfig;

pub fn build_http_client(config: &EngineConfig) -> Result<Client, reqwest::Error> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    Client::builder()
        .user_agent(config.user_agent.as_str())
        .default_headers(default_headers)
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()
}
