mod ask;
mod sources;

use crate::state::Context;

/// Discord rejects messages over 2000 characters; stay a little under.
pub(crate) const MESSAGE_LIMIT: usize = 1990;

/// Legal research assistant over the indexed document corpus
#[poise::command(slash_command, subcommands("ask::ask", "sources::sources"))]
pub async fn legal(_ctx: Context<'_>) -> Result<(), anyhow::Error> {
    Ok(())
}

/// Byte offset at which to cut `text` so the head fits in `limit` bytes,
/// preferring a line break, then a space, and never splitting a character.
pub(crate) fn split_point(text: &str, limit: usize) -> usize {
    if text.len() <= limit {
        return text.len();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let head = &text[..end];
    head.rfind('\n')
        .or_else(|| head.rfind(' '))
        .map(|i| i + 1)
        .unwrap_or(end)
}

/// Send a message in Discord-safe chunks.
/// Uses ctx.say() for all chunks. Poise routes follow-ups through the
/// interaction webhook, which doesn't require Send Messages channel permission.
pub(crate) async fn send_chunked(ctx: &Context<'_>, text: &str) -> Result<(), anyhow::Error> {
    let mut remaining = text;
    while !remaining.is_empty() {
        let split_at = split_point(remaining, MESSAGE_LIMIT);
        let (chunk, rest) = remaining.split_at(split_at);
        remaining = rest;

        if !chunk.trim().is_empty() {
            ctx.say(chunk).await?;
        }
    }
    Ok(())
}
