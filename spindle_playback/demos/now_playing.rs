use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, Report};
use spindle_playback::{AuthFailurePolicy, NowPlayingReport, ProviderSettings};
use spindle_tokens::{
    backoff::{self, ErrorBackoffConfig, ErrorBackoffHandler, WithBackoff},
    store::{FileSessionStore, RefreshCredentialStore},
    ClientId, ClientSecret, RefreshToken, TokenBroker,
};

#[derive(Debug, Parser)]
#[command(about = "Shows what a Spotify account is playing")]
struct Opts {
    /// The client ID registered with the provider
    #[arg(short, long, env = "SPOTIFY_CLIENT_ID")]
    client_id: ClientId,

    /// The client secret used to identify a confidential client
    #[arg(short = 's', long, env = "SPOTIFY_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<ClientSecret>,

    /// A refresh token to seed an empty session with
    #[arg(short, long, env = "SPOTIFY_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<RefreshToken>,

    /// The local file holding the session
    #[arg(
        short = 'f',
        long,
        env = "SPOTIFY_SESSION_FILE",
        default_value = ".spotify-session.json"
    )]
    session_file: PathBuf,

    /// The provider's token endpoint
    #[arg(long, env = "SPOTIFY_TOKEN_URL", default_value = spindle_playback::SPOTIFY_TOKEN_URL)]
    token_url: String,

    /// Report authorization failures as nothing playing
    #[arg(long)]
    degrade: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Looks up what is playing once
    Current,
    /// Keeps looking up what is playing until interrupted
    Watch {
        /// Seconds between lookups
        #[arg(short, long, default_value_t = 15)]
        interval: u64,
    },
    /// Obtains an access token and shows the broker's state
    Status,
    /// Forgets the stored session
    Logout,
}

fn print_json<T: serde::Serialize>(value: &T) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let mut settings = ProviderSettings::new(opts.client_id);
    settings.token_url = opts.token_url;
    settings.client_secret = opts.client_secret;
    if opts.degrade {
        settings.auth_failure_policy = AuthFailurePolicy::Degrade;
    }

    let session = Arc::new(FileSessionStore::new(&opts.session_file));
    if let Some(refresh_token) = opts.refresh_token {
        if session.load().await.map_err(Report::msg)?.is_none() {
            session.rotate(&refresh_token).await.map_err(Report::msg)?;
            tracing::info!(path = %opts.session_file.display(), "seeded session with refresh token");
        }
    }

    let client = reqwest_middleware::ClientBuilder::new(
        reqwest::Client::builder().https_only(true).build()?,
    )
    .build();

    let broker = TokenBroker::builder(settings.token_endpoint(client.clone())?, session.clone())
        .with_config(settings.broker.into())
        .with_cache("file", session)
        .build();
    let fetcher = settings.fetcher(client, broker.clone())?;

    match opts.command {
        Command::Current => {
            let result = fetcher.fetch_currently_playing().await;
            print_json(&NowPlayingReport::from_result(
                result,
                settings.auth_failure_policy,
            ))?;
        }
        Command::Watch { interval } => {
            let mut backoff = ErrorBackoffHandler::new(ErrorBackoffConfig::default());
            let mut ticks = tokio::time::interval(Duration::from_secs(interval));

            loop {
                tokio::select! {
                    _ = ticks.tick() => {}
                    _ = tokio::signal::ctrl_c() => break,
                }

                match fetcher.fetch_currently_playing().await.with_backoff(&mut backoff) {
                    Ok(track) => {
                        print_json(&NowPlayingReport::from_result(
                            Ok(track),
                            settings.auth_failure_policy,
                        ))?;
                    }
                    Err((err, delay)) => {
                        let failure = err.auth_failure().clone();
                        print_json(&NowPlayingReport::from_result(
                            Err(err),
                            settings.auth_failure_policy,
                        ))?;
                        if failure.needs_reauthentication() {
                            bail!("session can no longer be refreshed: {failure}");
                        }

                        let delay = failure.retry_after().map_or(delay, |hint| hint.max(delay));
                        tracing::warn!(
                            kind = failure.kind(),
                            delay_ms = delay.as_millis() as u64,
                            "lookup failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Command::Status => {
            let broker = &broker;
            let outcome =
                backoff::retry_with_backoff(ErrorBackoffConfig::default(), move || {
                    broker.get_valid_access_token()
                })
                .await;

            match outcome {
                Ok(token) => tracing::info!(
                    token = format_args!("{:#?}", token),
                    "obtained access token"
                ),
                Err(err) => tracing::error!(
                    kind = %err.kind(),
                    error = (&err as &dyn std::error::Error),
                    "unable to obtain access token"
                ),
            }

            print_json(&broker.status())?;
        }
        Command::Logout => {
            broker.logout().await.map_err(Report::msg)?;
            println!("session forgotten");
        }
    }

    Ok(())
}
