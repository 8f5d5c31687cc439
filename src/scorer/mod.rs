pub mod game_events;

pub use game_events::GameEventScorer;

use crate::error::ScoreError;
use crate::types::RawPayload;

/// Turns one raw payload into model-specific derived fields.
///
/// Implementations must be pure: the same payload always yields the same
/// value, so the processor can regenerate records at will.
pub trait Scorer: Send + Sync {
    /// Stored beside each derived record.
    fn model_version(&self) -> &str;

    fn score(&self, payload: &RawPayload) -> Result<serde_json::Value, ScoreError>;
}
