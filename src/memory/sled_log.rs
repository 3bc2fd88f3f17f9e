use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sled::{Db, Tree};
use tracing::debug;

use super::{ConversationMemory, ConversationTurn};

const TREE_NAME: &str = "turns";
const EMBEDDING_DIM: usize = 256;
const SESSION_SEPARATOR: u8 = 0;
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Conversation log stored in a sled tree.
///
/// Keys are `session ++ 0x00 ++ id` with `id` a big-endian monotonic counter,
/// so a prefix scan yields one session's turns in append order.
#[derive(Clone)]
pub struct SledConversationLog {
    db: Db,
    tree: Tree,
}

impl SledConversationLog {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    pub fn from_db(db: Db) -> Result<Self> {
        let tree = db.open_tree(bincode::serialize(TREE_NAME)?)?;
        Ok(Self { db, tree })
    }

    fn session_prefix(session: &str) -> Vec<u8> {
        let mut prefix = session.as_bytes().to_vec();
        prefix.push(SESSION_SEPARATOR);
        prefix
    }

    fn turns(&self, session: &str) -> Result<Vec<ConversationTurn>> {
        let mut turns = Vec::new();
        for entry in self.tree.scan_prefix(Self::session_prefix(session)) {
            let (_, val) = entry?;
            turns.push(bincode::deserialize::<ConversationTurn>(&val)?);
        }
        Ok(turns)
    }
}

#[async_trait]
impl ConversationMemory for SledConversationLog {
    async fn top_k_similar(
        &self,
        session: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<ConversationTurn>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let target = embed(query);

        // Iterating newest first lets the stable sort keep recency on ties.
        let mut scored: Vec<(f32, ConversationTurn)> = self
            .turns(session)?
            .into_iter()
            .rev()
            .map(|turn| {
                let score = turn
                    .embedding
                    .as_deref()
                    .map_or(0.0, |embedding| cosine(&target, embedding));
                (score, turn)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(k);

        debug!(session, found = scored.len(), "Retrieved similar turns");
        Ok(scored.into_iter().map(|(_, turn)| turn).collect())
    }

    async fn append(&self, session: &str, mut turn: ConversationTurn) -> Result<()> {
        turn.embedding = Some(embed(&format!("{} {}", turn.question, turn.answer_summary)));

        let id = self.db.generate_id()?;
        let mut key = Self::session_prefix(session);
        key.extend_from_slice(&id.to_be_bytes());

        self.tree.insert(key, bincode::serialize(&turn)?)?;
        self.tree.flush_async().await?;
        Ok(())
    }
}

/// 64-bit FNV-1a. Stored embeddings depend on it, so it must never change.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Hashed bag-of-words vector, L2-normalised.
fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0_f32; EMBEDDING_DIM];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let hash = fnv1a(token.to_lowercase().as_bytes());
        let bucket = usize::try_from(hash % EMBEDDING_DIM as u64).unwrap_or(0);
        vector[bucket] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}
