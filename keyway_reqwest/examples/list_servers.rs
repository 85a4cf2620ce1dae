use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use clap::Parser;
use keyway_reqwest::{
    hooks::{ExponentialBackoff, ExponentialRetry},
    BoxError, ProviderClient, Reauthenticate, RequestOptions, UserAgent, SUBJECT_TOKEN_HEADER,
};
use keyway_tokens::{
    backoff::ErrorBackoffConfig, jitter::RandomJitter, AccessToken, AuthResult, TokenExtractError,
};
use reqwest::{Method, Url};
use serde::Deserialize;

#[derive(Debug, Parser)]
struct Opts {
    /// The identity service's token URL
    #[arg(long, env = "OS_AUTH_URL")]
    auth_url: Url,

    /// The compute service's endpoint
    #[arg(long, env = "OS_COMPUTE_URL")]
    compute_url: Url,

    /// The user to authenticate as
    #[arg(short, long, env = "OS_USERNAME")]
    username: String,

    /// The user's password
    #[arg(short, long, env = "OS_PASSWORD", hide_env_values = true)]
    password: String,

    /// The domain of the user
    #[arg(long, env = "OS_USER_DOMAIN_NAME", default_value = "Default")]
    domain: String,

    /// How many times to list the servers
    #[arg(long, default_value_t = 1)]
    repeat: u32,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: TokenDetails,
}

#[derive(Debug, Deserialize)]
struct TokenDetails {
    expires_at: String,
}

/// A token issued by the identity service
#[derive(Debug)]
struct IssuedToken {
    id: AccessToken,
    details: TokenDetails,
}

impl AuthResult for IssuedToken {
    fn extract_token_id(&self) -> Result<AccessToken, TokenExtractError> {
        Ok(self.id.clone())
    }
}

struct PasswordAuth {
    auth_url: Url,
    body: serde_json::Value,
}

#[async_trait]
impl Reauthenticate for PasswordAuth {
    async fn reauthenticate(&self, client: &ProviderClient) -> Result<(), BoxError> {
        let options = RequestOptions::new().with_json_body(&self.body)?;
        let response = client
            .throwaway()
            .request_json::<TokenBody>(Method::POST, self.auth_url.clone(), options)
            .await?;

        let id = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .ok_or("identity service did not return a token")?
            .to_str()?
            .to_owned();
        let body = response
            .into_value()
            .ok_or("identity service returned no token details")?;

        let issued = IssuedToken {
            id: AccessToken::new(id),
            details: body.token,
        };
        tracing::info!(expires_at = %issued.details.expires_at, "authenticated");

        client.set_token_and_auth_result(Arc::new(issued))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Servers {
    servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct Server {
    id: String,
    name: String,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let body = serde_json::json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": opts.username,
                        "domain": { "name": opts.domain },
                        "password": opts.password,
                    }
                }
            }
        }
    });

    let transport = reqwest::Client::builder().https_only(true).build()?;

    let client = ProviderClient::builder()
        .transport(transport)
        .user_agent(UserAgent::new().with_prepended(["list-servers/0.1"]))
        .reauthenticator(PasswordAuth {
            auth_url: opts.auth_url,
            body,
        })
        .retry_backoff(
            ExponentialBackoff::new(ErrorBackoffConfig::default())
                .with_jitter(RandomJitter::new(Duration::from_millis(250))),
        )
        .retry_policy(ExponentialRetry::new(3, ErrorBackoffConfig::default()))
        .build();

    // No token yet, so authenticate up front
    client.reauthenticate(None).await?;

    let servers_url = opts.compute_url.join("servers")?;
    for _ in 0..opts.repeat {
        let servers = client
            .request_json::<Servers>(Method::GET, servers_url.clone(), RequestOptions::new())
            .await?
            .into_value()
            .map_or_else(Vec::new, |list| list.servers);

        for server in &servers {
            tracing::info!(server.id = %server.id, server.name = %server.name, "found server");
        }
        tracing::info!(count = servers.len(), "listed servers");
    }

    Ok(())
}
