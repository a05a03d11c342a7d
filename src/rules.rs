//! Administrator-maintained command rules.
//!
//! Two pattern lists: `block` (never let the line through) and `prompt`
//! (hold the line until the client confirms). The lists are mutated through
//! the admin API while every live session reads them, so the set sits behind
//! an `RwLock` and each mutation swaps in a fully built replacement.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A pair of pattern lists, as stored and as submitted to merge/remove.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rules {
    #[serde(default)]
    pub block: Vec<String>,
    #[serde(default)]
    pub prompt: Vec<String>,
}

/// Outcome of checking one input line against the rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// Line matched this block pattern.
    Block(String),
    /// Line matched this prompt pattern.
    Prompt(String),
}

/// The live rule set shared by all sessions.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: RwLock<Rules>,
}

impl RuleSet {
    pub fn new(rules: Rules) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Snapshot of the current lists.
    pub async fn get(&self) -> Rules {
        self.rules.read().await.clone()
    }

    /// Append `extra` to both lists. Duplicates are kept.
    pub async fn merge(&self, extra: &Rules) -> Rules {
        let mut rules = self.rules.write().await;
        let mut block = rules.block.clone();
        block.extend(extra.block.iter().cloned());
        let mut prompt = rules.prompt.clone();
        prompt.extend(extra.prompt.iter().cloned());
        *rules = Rules { block, prompt };
        rules.clone()
    }

    /// Drop every entry that exactly equals one of the patterns in `gone`.
    pub async fn remove(&self, gone: &Rules) -> Rules {
        let mut rules = self.rules.write().await;
        let block = without(&rules.block, &gone.block);
        let prompt = without(&rules.prompt, &gone.prompt);
        *rules = Rules { block, prompt };
        rules.clone()
    }

    /// Check a completed input line. Block patterns take precedence.
    pub async fn check(&self, line: &str) -> Verdict {
        let line = line.trim();
        if line.is_empty() {
            return Verdict::Allow;
        }
        let rules = self.rules.read().await;
        if let Some(p) = first_match(&rules.block, line) {
            return Verdict::Block(p.clone());
        }
        if let Some(p) = first_match(&rules.prompt, line) {
            return Verdict::Prompt(p.clone());
        }
        Verdict::Allow
    }
}

fn without(list: &[String], gone: &[String]) -> Vec<String> {
    list.iter().filter(|p| !gone.contains(p)).cloned().collect()
}

fn first_match<'a>(patterns: &'a [String], line: &str) -> Option<&'a String> {
    patterns
        .iter()
        .find(|p| !p.is_empty() && line.contains(p.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(block: &[&str], prompt: &[&str]) -> Rules {
        Rules {
            block: block.iter().map(ToString::to_string).collect(),
            prompt: prompt.iter().map(ToString::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn remove_absent_pattern_is_noop() {
        let set = RuleSet::new(rules(&["rm -rf"], &["reboot"]));
        let before = set.get().await;
        set.remove(&rules(&["mkfs"], &["halt"])).await;
        assert_eq!(set.get().await, before);
    }

    #[tokio::test]
    async fn merge_then_remove_restores() {
        let set = RuleSet::new(rules(&["rm -rf"], &[]));
        let before = set.get().await;
        let extra = rules(&["dd if="], &["shutdown"]);
        set.merge(&extra).await;
        assert_eq!(set.get().await.block.len(), 2);
        set.remove(&extra).await;
        assert_eq!(set.get().await, before);
    }

    #[tokio::test]
    async fn removed_pattern_stops_matching_even_when_duplicated() {
        let set = RuleSet::new(rules(&["rm -rf", "mkfs"], &[]));
        let merged = set.merge(&rules(&["rm -rf"], &[])).await;
        assert_eq!(merged.block, vec!["rm -rf", "mkfs", "rm -rf"]);
        let removed = set.remove(&rules(&["rm -rf"], &[])).await;
        assert_eq!(removed.block, vec!["mkfs"]);
        assert_eq!(set.check("rm -rf /").await, Verdict::Allow);
    }

    #[tokio::test]
    async fn block_wins_over_prompt() {
        let set = RuleSet::new(rules(&["rm"], &["rm -rf"]));
        assert_eq!(set.check("rm -rf /tmp").await, Verdict::Block("rm".into()));
        assert_eq!(set.check("ls").await, Verdict::Allow);
    }

    #[tokio::test]
    async fn empty_line_and_empty_pattern_never_match() {
        let set = RuleSet::new(rules(&[""], &["sudo"]));
        assert_eq!(set.check("   ").await, Verdict::Allow);
        assert_eq!(set.check("ls").await, Verdict::Allow);
        assert_eq!(set.check("sudo ls").await, Verdict::Prompt("sudo".into()));
    }
}
