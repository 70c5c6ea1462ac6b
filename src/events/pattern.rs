//! Attribute protocol consumed by the matching engine.
//!
//! Anything that can list its set attributes in a stable order can be
//! indexed and matched. The order is load-bearing: a pattern is flattened
//! into one linear chain of `Name`/`Value` steps, depth-first, and that
//! chain is the path it occupies in the attribute index.

use std::fmt;
use std::hash::{Hash, Hasher};

use sha2::{Digest, Sha256};

/// Terminal attribute value.
///
/// Floats without a fractional part are normalized to `Int` by
/// [`Scalar::float`], so `100` and `100.0` index to the same node.
#[derive(Debug, Clone)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Builds a numeric scalar, folding integral floats into `Int`.
    pub fn float(value: f64) -> Self {
        if value.fract() == 0.0 && value >= i64::MIN as f64 && value < i64::MAX as f64 {
            Scalar::Int(value as i64)
        } else {
            Scalar::Float(value)
        }
    }

    /// Empty text counts as an unset attribute.
    pub fn is_empty(&self) -> bool {
        matches!(self, Scalar::Text(text) if text.is_empty())
    }

    fn float_bits(value: f64) -> u64 {
        if value == 0.0 {
            0.0f64.to_bits()
        } else if value.is_nan() {
            f64::NAN.to_bits()
        } else {
            value.to_bits()
        }
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::Int(a), Scalar::Int(b)) => a == b,
            (Scalar::Float(a), Scalar::Float(b)) => Self::float_bits(*a) == Self::float_bits(*b),
            (Scalar::Text(a), Scalar::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Scalar {}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Scalar::Bool(value) => value.hash(state),
            Scalar::Int(value) => value.hash(state),
            Scalar::Float(value) => Self::float_bits(*value).hash(state),
            Scalar::Text(value) => value.hash(state),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(value) => write!(f, "{}", value),
            Scalar::Int(value) => write!(f, "{}", value),
            Scalar::Float(value) => write!(f, "{}", value),
            Scalar::Text(value) => write!(f, "{}", value),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

/// Value of a single attribute: terminal, or a nested pattern whose own
/// chain continues the parent's path.
pub enum AttrValue<'a> {
    Scalar(Scalar),
    Nested(&'a dyn EventPattern),
}

/// One step of a flattened attribute chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChainStep {
    Name(String),
    Value(Scalar),
}

/// Identity of a pattern inside the index: its structural hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternKey(pub u64);

impl PatternKey {
    /// Key of any pattern.
    pub fn of<P: EventPattern + ?Sized>(pattern: &P) -> Self {
        PatternKey(pattern.structural_hash())
    }
}

impl fmt::Display for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Capability required from events and subscription patterns.
///
/// Implementors only provide the two enumeration methods; chain, count and
/// hash are derived from them so they can never disagree. Attributes whose
/// value is unset or empty must be left out of `attribute_names`, or return
/// `None` from `attribute_value`.
pub trait EventPattern: Send + Sync {
    /// Set attribute names, in the order that defines the index path.
    fn attribute_names(&self) -> Vec<String>;

    /// Value of one attribute.
    fn attribute_value(&self, name: &str) -> Option<AttrValue<'_>>;

    /// Depth-first flattening of the pattern into `Name`/`Value` steps.
    fn attribute_chain(&self) -> Vec<ChainStep> {
        let mut chain = Vec::new();
        extend_chain(self, &mut chain);
        chain
    }

    /// Number of terminal attributes reachable, nested ones included.
    fn attribute_count(&self) -> usize {
        self.attribute_chain()
            .iter()
            .filter(|step| matches!(step, ChainStep::Value(_)))
            .count()
    }

    /// Hash of the attribute chain, stable across processes.
    fn structural_hash(&self) -> u64 {
        chain_hash(&self.attribute_chain())
    }
}

/// Appends the chain of `pattern` and reports whether anything was added.
/// Nested patterns without a single set attribute are dropped with their name.
fn extend_chain<P: EventPattern + ?Sized>(pattern: &P, chain: &mut Vec<ChainStep>) -> bool {
    let start = chain.len();

    for name in pattern.attribute_names() {
        match pattern.attribute_value(&name) {
            Some(AttrValue::Scalar(value)) if !value.is_empty() => {
                chain.push(ChainStep::Name(name));
                chain.push(ChainStep::Value(value));
            }
            Some(AttrValue::Nested(nested)) => {
                let mark = chain.len();
                chain.push(ChainStep::Name(name));
                if !extend_chain(nested, chain) {
                    chain.truncate(mark);
                }
            }
            _ => {}
        }
    }

    chain.len() > start
}

fn chain_hash(chain: &[ChainStep]) -> u64 {
    let mut hasher = Sha256::new();

    for step in chain {
        match step {
            ChainStep::Name(name) => {
                hasher.update(b"N");
                hasher.update((name.len() as u64).to_le_bytes());
                hasher.update(name.as_bytes());
            }
            ChainStep::Value(value) => {
                hasher.update(b"V");
                match value {
                    Scalar::Bool(b) => hasher.update([b'b', *b as u8]),
                    Scalar::Int(i) => {
                        hasher.update(b"i");
                        hasher.update(i.to_le_bytes());
                    }
                    Scalar::Float(x) => {
                        hasher.update(b"f");
                        hasher.update(Scalar::float_bits(*x).to_le_bytes());
                    }
                    Scalar::Text(text) => {
                        hasher.update(b"t");
                        hasher.update((text.len() as u64).to_le_bytes());
                        hasher.update(text.as_bytes());
                    }
                }
            }
        }
    }

    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
