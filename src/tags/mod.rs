pub mod merge;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BotRadarError;

/// Closed set of labels an entity can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagLabel {
    Suspicious,
    Bot,
}

impl TagLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagLabel::Suspicious => "suspicious",
            TagLabel::Bot => "bot",
        }
    }
}

impl FromStr for TagLabel {
    type Err = BotRadarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suspicious" => Ok(TagLabel::Suspicious),
            "bot" => Ok(TagLabel::Bot),
            other => Err(BotRadarError::InvalidTag(format!("unknown label '{other}'"))),
        }
    }
}

/// A `(label, confidence)` pair attached to a contract, signature or caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub label: TagLabel,
    pub confidence: f64,
}

impl Tag {
    /// Provisional flag from the explorer; always confidence 1.
    pub fn suspicious() -> Self {
        Self {
            label: TagLabel::Suspicious,
            confidence: 1.0,
        }
    }

    /// Scored label, confidence clamped into [0, 1].
    pub fn bot(confidence: f64) -> Self {
        Self {
            label: TagLabel::Bot,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn is_bot(&self) -> bool {
        self.label == TagLabel::Bot
    }

    pub fn is_suspicious(&self) -> bool {
        self.label == TagLabel::Suspicious
    }
}

/// Flat column form: `('bot', '0.7')`.
impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "('{}', '{}')", self.label.as_str(), self.confidence)
    }
}

impl FromStr for Tag {
    type Err = BotRadarError;

    /// Accepts `('bot', '0.7')` as well as the unquoted `('bot', 0.7)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BotRadarError::InvalidTag(s.to_string());
        let inner = s
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(invalid)?;
        let (label, confidence) = inner.split_once(',').ok_or_else(invalid)?;
        let unquote = |part: &str| part.trim().trim_matches(|c| c == '\'' || c == '"').to_string();

        let label: TagLabel = unquote(label).parse()?;
        let confidence: f64 = unquote(confidence).parse().map_err(|_| invalid())?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(invalid());
        }
        Ok(Self { label, confidence })
    }
}

/// Known legitimate contracts. Read-only; entities touching these never leave the analyzer.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    addresses: HashSet<String>,
}

impl Whitelist {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let addresses: HashSet<String> = addresses
            .into_iter()
            .map(|a| normalize_address(a.as_ref()))
            .filter(|a| !a.is_empty())
            .collect();
        tracing::info!("Whitelist loaded with {} addresses", addresses.len());
        Self { addresses }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.contains(&normalize_address(address))
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Addresses compare case-insensitively.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}
