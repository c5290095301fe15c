use std::time::{Duration, Instant};

use futures::StreamExt;
use poise::serenity_prelude as serenity;
use poise::{CreateReply, ReplyHandle};
use tracing::{error, info, warn};

use super::{split_point, MESSAGE_LIMIT};
use crate::rag::AnswerSession;
use crate::state::Context;

/// Discord rate-limits message edits; batch fragments between edits.
const EDIT_INTERVAL: Duration = Duration::from_secs(1);

/// Ask a question about the indexed documents
#[poise::command(slash_command, guild_only)]
pub async fn ask(
    ctx: Context<'_>,
    #[description = "Your question"] question: String,
) -> Result<(), anyhow::Error> {
    // Deferring shows the "thinking…" indicator until the first fragment lands.
    ctx.defer().await?;

    info!(user = %ctx.author().name, question = %question, "query started");

    let engine = &ctx.data().engine;
    let AnswerSession {
        retrieval,
        mut stream,
    } = match engine.answer(&question).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "query failed before streaming");
            ctx.say(format!("Sorry, I couldn't answer that: {}", e)).await?;
            return Ok(());
        }
    };

    let mut reply = LiveReply::new(ctx);
    while let Some(fragment) = stream.next().await {
        match fragment {
            Ok(text) => {
                if let Err(e) = reply.push(&text).await {
                    // Discord went away; stop generating.
                    stream.close();
                    return Err(e.into());
                }
            }
            Err(e) => {
                error!(token = %retrieval.token, error = %e, "answer stream failed");
                reply
                    .push(&format!("\n\n**Answer interrupted:** {}", e))
                    .await?;
                reply.flush().await?;
                return Ok(());
            }
        }
    }

    ctx.data()
        .remember_answer(ctx.channel_id().get(), retrieval.token)
        .await;

    match engine.citations(&retrieval).await {
        Ok(block) => {
            reply.push("\n\n**Sources:**\n\n").await?;
            reply.push(&block).await?;
        }
        Err(e) => {
            warn!(token = %retrieval.token, error = %e, "citations unavailable");
            reply
                .push(&format!("\n\n_Sources unavailable: {}_", e))
                .await?;
        }
    }
    reply.flush().await?;

    info!(
        token = %retrieval.token,
        answer_len = reply.total,
        messages = reply.messages,
        "query complete"
    );
    Ok(())
}

/// An append-only reply that is edited in place as text arrives and spills
/// into follow-up messages when it outgrows one Discord message.
struct LiveReply<'a> {
    ctx: Context<'a>,
    handle: Option<ReplyHandle<'a>>,
    current: String,
    dirty: bool,
    last_sync: Instant,
    total: usize,
    messages: usize,
}

impl<'a> LiveReply<'a> {
    fn new(ctx: Context<'a>) -> Self {
        Self {
            ctx,
            handle: None,
            current: String::new(),
            dirty: false,
            last_sync: Instant::now(),
            total: 0,
            messages: 0,
        }
    }

    async fn push(&mut self, text: &str) -> Result<(), serenity::Error> {
        self.current.push_str(text);
        self.total += text.len();
        self.dirty = true;

        while self.current.len() > MESSAGE_LIMIT {
            let at = split_point(&self.current, MESSAGE_LIMIT);
            let rest = self.current.split_off(at);
            self.sync().await?;
            // The filled message is final; continue in a new one.
            self.handle = None;
            self.current = rest;
            self.dirty = true;
        }

        if self.last_sync.elapsed() >= EDIT_INTERVAL {
            self.sync().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), serenity::Error> {
        self.sync().await
    }

    async fn sync(&mut self) -> Result<(), serenity::Error> {
        if !self.dirty || self.current.trim().is_empty() {
            return Ok(());
        }

        if let Some(handle) = &self.handle {
            handle
                .edit(self.ctx, CreateReply::default().content(self.current.clone()))
                .await?;
        } else {
            let handle = self.ctx.say(self.current.clone()).await?;
            self.handle = Some(handle);
            self.messages += 1;
        }

        self.dirty = false;
        self.last_sync = Instant::now();
        Ok(())
    }
}
