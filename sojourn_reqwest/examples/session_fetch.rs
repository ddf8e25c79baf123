use std::{path::PathBuf, time::Duration};

use clap::Parser;
use reqwest::Url;
use reqwest_middleware::ClientBuilder;
use sojourn_reqwest::{Credentials, RequestOptions, SessionClient};
use sojourn_tokens::{
    store::{spawn_persistence, FileSessionStore, SessionStore},
    Password, SessionConfig, Username,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The API base URL, beneath which `auth/login` and `auth/refresh-token` live
    #[arg(short, long, env)]
    api_url: Url,

    /// The username to log in with
    #[arg(short, long, env)]
    username: Username,

    /// The password to log in with
    #[arg(short, long, env, hide_env_values = true)]
    password: Password,

    /// The resource path fetched on every tick
    #[arg(short, long, env, default_value = "/auth/me")]
    resource: String,

    /// The local file used to carry the session across runs
    #[arg(short = 'f', long, env, default_value = ".session.json")]
    session_file: PathBuf,
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

    let client = ClientBuilder::new(reqwest::Client::new()).build();
    let sessions = SessionClient::with_config(client, &opts.api_url, SessionConfig::default())?;

    let mut store = FileSessionStore::new(opts.session_file);
    let persisted = match store.load().await {
        Ok(tokens) => tokens,
        Err(error) => {
            tracing::warn!(%error, "unable to load persisted session");
            None
        }
    };
    let _persistence = spawn_persistence(sessions.session().events(), store);
    if let Some(tokens) = persisted {
        sessions.session().resume(tokens);
    }

    if sessions.session().record().is_none() {
        let principal = sessions
            .login(&Credentials {
                username: opts.username,
                password: opts.password,
            })
            .await?;
        tracing::info!(%principal, "logged in");
    }

    let mut interval = time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;

        match sessions
            .fetch_json::<serde_json::Value>(&opts.resource, &RequestOptions::get())
            .await
        {
            Ok(body) => tracing::info!(%body, "fetched resource"),
            Err(error) if error.requires_sign_in() => {
                tracing::error!(%error, "session ended, sign in again");
                return Ok(());
            }
            Err(error) => tracing::warn!(%error, "fetch failed"),
        }

        if let Some(record) = sessions.session().record() {
            let current = record.current();
            tracing::debug!(
                status = ?current.token_status(),
                renew_at = current.renew_at().0,
                expiry = current.expiry().0,
                token = format_args!("{:#?}", current.access_token()),
                "current token pair"
            );
        }
    }
}
