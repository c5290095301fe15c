mod commands;
mod config;
mod error;
mod gcp;
mod llm;
mod rag;
mod search;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use poise::serenity_prelude as serenity;
use poise::{Framework, FrameworkOptions};
use tracing::{error, info, Level};

use config::Settings;
use gcp::signer::GcsUrlSigner;
use gcp::{AmbientCredentials, ImpersonatedCredentials, TokenSource};
use llm::{AnswerStreamer, VertexClaudeClient};
use rag::cache::ResultCache;
use rag::citations::CitationRenderer;
use rag::RagEngine;
use search::{DiscoveryEngineClient, EvidenceRetriever};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load env
    let _ = dotenv::dotenv();

    let level = dotenv::var("LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let token = dotenv::var("DISCORD_TOKEN").context("DISCORD_TOKEN required")?;
    let guild_id: Option<serenity::GuildId> = dotenv::var("DISCORD_GUILD_ID")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(serenity::GuildId::new);

    let settings = Settings::from_env()?;
    info!(
        project = %settings.project_id,
        datastore = %settings.datastore_id,
        model = %settings.llm_model,
        "settings loaded"
    );

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(settings.http_timeout)
        .build()
        .context("Failed to create HTTP client")?;

    // Credentials: ambient identity for search and generation, an impersonated
    // service account for signing download links.
    let ambient: Arc<dyn TokenSource> = Arc::new(AmbientCredentials::from_env(http.clone())?);
    let impersonated = Arc::new(ImpersonatedCredentials::new(
        http.clone(),
        ambient.clone(),
        settings.signer_service_account.clone(),
    ));

    let cache = Arc::new(ResultCache::new(settings.result_cache_capacity));
    let retriever = EvidenceRetriever::new(
        Arc::new(DiscoveryEngineClient::new(http.clone(), &settings, ambient.clone())),
        cache.clone(),
    );
    let streamer = AnswerStreamer::new(
        Arc::new(VertexClaudeClient::new(http.clone(), &settings, ambient.clone())),
        &settings.client_name,
    );
    let renderer = CitationRenderer::new(
        Arc::new(GcsUrlSigner::new(impersonated)),
        settings.signed_url_ttl,
    );
    let engine = Arc::new(RagEngine::new(retriever, streamer, renderer, cache));
    info!("RAG pipeline initialized");

    let app_state = AppState::new(engine);

    let intents =
        serenity::GatewayIntents::GUILDS | serenity::GatewayIntents::GUILD_MESSAGES;

    let framework = Framework::builder()
        .options(FrameworkOptions {
            commands: vec![commands::legal()],
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                info!("Bot connected as: {} ({})", ready.user.name, ready.user.id);

                if let Some(gid) = guild_id {
                    info!("Registering to guild {} (instant)", gid);
                    poise::builtins::register_in_guild(
                        ctx,
                        &framework.options().commands,
                        gid,
                    )
                    .await?;
                } else {
                    info!("Registering globally (up to 1 hour delay)");
                    poise::builtins::register_globally(
                        ctx,
                        &framework.options().commands,
                    )
                    .await?;
                }

                Ok(app_state)
            })
        })
        .build();

    info!("Starting legal assistant bot...");

    let mut client = serenity::ClientBuilder::new(&token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    if let Err(e) = client.start().await {
        error!("Client error: {}", e);
    }

    Ok(())
}
