//! Scene-gated fact composition for embedding callers; no gateway route uses it.

use serde::{Deserialize, Serialize};

/// A piece of story context, visible once revealed or once its scene is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub fact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revealed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reveal_at_scene: Option<u32>,
}

impl Fact {
    pub fn is_visible_at(&self, scene_index: u32) -> bool {
        self.revealed == Some(true)
            || self
                .reveal_at_scene
                .is_some_and(|threshold| threshold <= scene_index)
    }
}

/// Join the text of every fact visible at `scene_index`, in input order, one per line.
pub fn compose_context(facts: &[Fact], scene_index: u32) -> String {
    facts
        .iter()
        .filter(|fact| fact.is_visible_at(scene_index))
        .map(|fact| fact.fact.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
