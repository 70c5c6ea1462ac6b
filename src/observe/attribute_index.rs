//! Attribute-chain trie used to match events against partial patterns.
//!
//! A pattern is flattened into its attribute chain (see
//! [`EventPattern::attribute_chain`]) and occupies exactly one path from the
//! root. Names and nested values share that path: `{a: 1, b: {c: 2}}` lives
//! at `root → a → 1 → b → c → 2`. Every `Value` node on the path carries the
//! pattern's key in its leaf set.
//!
//! Searching walks the event's own chain along the same single path and
//! counts, per key, the marks it passes. A pattern matches the first time
//! its count reaches the number of terminal attributes it was registered
//! with. The walk stops at the first step without a child, so a pattern
//! matches exactly when its chain is a prefix of the event's chain.
//!
//! Registrations are reference counted: inserting the same structural
//! pattern twice needs two removals before it stops matching.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use crate::events::{ChainStep, EventPattern, PatternKey};

/// A registered pattern reported by [`AttributeIndex::search`].
#[derive(Clone)]
pub struct PatternMatch {
    pub key: PatternKey,
    pub pattern: Arc<dyn EventPattern>,
}

impl std::fmt::Debug for PatternMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternMatch")
            .field("key", &self.key)
            .field("attribute_count", &self.pattern.attribute_count())
            .finish()
    }
}

#[derive(Default)]
struct Node {
    children: HashMap<ChainStep, Node>,
    leaf: HashSet<PatternKey>,
}

impl Node {
    fn is_vacant(&self) -> bool {
        self.children.is_empty() && self.leaf.is_empty()
    }
}

struct Registration {
    pattern: Arc<dyn EventPattern>,
    attribute_count: usize,
    refs: usize,
}

/// Trie over attribute chains.
#[derive(Default)]
pub struct AttributeIndex {
    root: Node,
    registrations: HashMap<PatternKey, Registration>,
}

impl AttributeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pattern and returns its key.
    ///
    /// A pattern without any terminal attribute is accepted but can never
    /// match; callers that care reject it beforehand.
    pub fn insert(&mut self, pattern: Arc<dyn EventPattern>) -> PatternKey {
        let chain = pattern.attribute_chain();
        let key = PatternKey::of(pattern.as_ref());

        if let Some(registration) = self.registrations.get_mut(&key) {
            registration.refs += 1;
            trace!("Pattern {} registered again (refs={})", key, registration.refs);
            return key;
        }

        let mut node = &mut self.root;
        for step in chain.iter() {
            node = node.children.entry(step.clone()).or_default();
            if matches!(step, ChainStep::Value(_)) {
                node.leaf.insert(key);
            }
        }

        let attribute_count = chain
            .iter()
            .filter(|step| matches!(step, ChainStep::Value(_)))
            .count();

        self.registrations.insert(
            key,
            Registration {
                pattern,
                attribute_count,
                refs: 1,
            },
        );

        trace!("Pattern {} indexed with {} attribute(s)", key, attribute_count);
        key
    }

    /// Drops one registration of the pattern. Returns `false` when the pattern
    /// was not registered.
    pub fn remove(&mut self, pattern: &dyn EventPattern) -> bool {
        let key = PatternKey::of(pattern);

        let Some(registration) = self.registrations.get_mut(&key) else {
            return false;
        };

        registration.refs -= 1;
        if registration.refs > 0 {
            return true;
        }

        self.registrations.remove(&key);
        let chain = pattern.attribute_chain();
        Self::unmark(&mut self.root, &chain, key);
        trace!("Pattern {} removed from index", key);
        true
    }

    /// Removes `key` from every leaf along `chain` and prunes nodes left empty.
    fn unmark(node: &mut Node, chain: &[ChainStep], key: PatternKey) {
        let Some((step, rest)) = chain.split_first() else {
            return;
        };

        let Some(child) = node.children.get_mut(step) else {
            return;
        };

        if matches!(step, ChainStep::Value(_)) {
            child.leaf.remove(&key);
        }

        Self::unmark(child, rest, key);

        if child.is_vacant() {
            node.children.remove(step);
        }
    }

    /// Returns every registered pattern whose chain is a prefix of the
    /// event's chain. Each pattern is reported once.
    pub fn search(&self, event: &dyn EventPattern) -> Vec<PatternMatch> {
        let mut found: HashMap<PatternKey, usize> = HashMap::new();
        let mut matches = Vec::new();
        let mut node = &self.root;

        for step in event.attribute_chain() {
            let Some(child) = node.children.get(&step) else {
                break;
            };
            node = child;

            for key in node.leaf.iter() {
                let Some(registration) = self.registrations.get(key) else {
                    continue;
                };

                let count = found.entry(*key).or_insert(0);
                *count += 1;

                if *count == registration.attribute_count {
                    matches.push(PatternMatch {
                        key: *key,
                        pattern: Arc::clone(&registration.pattern),
                    });
                }
            }
        }

        matches
    }

    /// Number of distinct registered patterns.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Number of registrations held for a pattern.
    pub fn references(&self, pattern: &dyn EventPattern) -> usize {
        self.registrations
            .get(&PatternKey::of(pattern))
            .map(|registration| registration.refs)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn node_count(&self) -> usize {
        fn count(node: &Node) -> usize {
            1 + node.children.values().map(count).sum::<usize>()
        }
        count(&self.root)
    }
}
