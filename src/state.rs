use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::rag::cache::RequestToken;
use crate::rag::RagEngine;

pub struct AppState {
    pub engine: Arc<RagEngine>,
    /// Token of the most recent answer posted in each channel.
    last_answers: RwLock<HashMap<u64, RequestToken>>,
}

impl AppState {
    pub fn new(engine: Arc<RagEngine>) -> Self {
        Self {
            engine,
            last_answers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn remember_answer(&self, channel_id: u64, token: RequestToken) {
        self.last_answers.write().await.insert(channel_id, token);
    }

    pub async fn last_answer(&self, channel_id: u64) -> Option<RequestToken> {
        self.last_answers.read().await.get(&channel_id).copied()
    }
}

pub type Context<'a> = poise::Context<'a, AppState, anyhow::Error>;
