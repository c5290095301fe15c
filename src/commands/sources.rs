use tracing::{info, warn};

use super::send_chunked;
use crate::error::RagError;
use crate::state::Context;

/// Re-post the sources of this channel's last answer with fresh download links
#[poise::command(slash_command, guild_only)]
pub async fn sources(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    ctx.defer().await?;

    let Some(token) = ctx.data().last_answer(ctx.channel_id().get()).await else {
        ctx.say("No answers in this channel yet. Use `/legal ask` first.")
            .await?;
        return Ok(());
    };

    match ctx.data().engine.cached_citations(token).await {
        Ok((entry, block)) => {
            info!(%token, "sources re-rendered");
            let text = format!(
                "Sources for **{}** (asked {} UTC), links valid for a limited time:\n\n{}",
                entry.query,
                entry.stored_at.format("%Y-%m-%d %H:%M"),
                block
            );
            send_chunked(&ctx, &text).await?;
        }
        Err(RagError::CacheMiss(_)) => {
            ctx.say("Those search results are no longer cached. Ask the question again.")
                .await?;
        }
        Err(e) => {
            warn!(%token, error = %e, "sources re-render failed");
            ctx.say(format!("Couldn't rebuild the sources: {}", e)).await?;
        }
    }

    Ok(())
}
