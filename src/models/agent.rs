// Agent kinds and the invocation boundary types

//! # Agent Models
//!
//! Agents are opaque to the engine: each one is identified by an [`AgentKind`],
//! described by an [`AgentCapability`] for planning, and invoked through
//! `execute(kind, input, config) -> AgentOutput`.
//!
//! ## Rust Learning Notes:
//!
//! ### Closed Enums Instead of Strings
//! Agent kinds are a closed enum rather than free-form strings. Every `match`
//! on [`AgentKind`] is checked for exhaustiveness by the compiler, so adding a
//! new kind forces every lookup table to be updated.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every agent kind the engine can plan and dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    TrendAnalysis,
    Seo,
    Content,
    Design,
    SocialMedia,
    Advertising,
    Email,
    Outreach,
    Analytics,
}

impl AgentKind {
    /// All kinds in declaration order
    pub fn all() -> &'static [AgentKind] {
        &[
            AgentKind::TrendAnalysis,
            AgentKind::Seo,
            AgentKind::Content,
            AgentKind::Design,
            AgentKind::SocialMedia,
            AgentKind::Advertising,
            AgentKind::Email,
            AgentKind::Outreach,
            AgentKind::Analytics,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::TrendAnalysis => "trend_analysis",
            AgentKind::Seo => "seo",
            AgentKind::Content => "content",
            AgentKind::Design => "design",
            AgentKind::SocialMedia => "social_media",
            AgentKind::Advertising => "advertising",
            AgentKind::Email => "email",
            AgentKind::Outreach => "outreach",
            AgentKind::Analytics => "analytics",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        AgentKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .or(match normalized.as_str() {
                "trend" | "trends" => Some(AgentKind::TrendAnalysis),
                "social" => Some(AgentKind::SocialMedia),
                "ad" | "ads" => Some(AgentKind::Advertising),
                _ => None,
            })
            .ok_or_else(|| format!("unknown agent kind '{}'", s))
    }
}

/// Planning data for one agent kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    pub kind: AgentKind,
    pub name: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    /// Expected cost of one invocation in USD
    pub expected_cost: f64,
    /// Expected wall-clock latency of one invocation
    pub expected_latency_ms: u64,
    /// Historical fraction of invocations that succeed
    pub reliability: f64,
}

/// What an agent returns from a successful invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub output: serde_json::Value,
    pub confidence: Option<f64>,
    pub quality_score: Option<f64>,
    pub cost: f64,
}

impl AgentOutput {
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            confidence: None,
            quality_score: None,
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_quality(mut self, quality_score: f64) -> Self {
        self.quality_score = Some(quality_score);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// A failed agent invocation
///
/// `retryable` distinguishes transient failures (timeouts, rate limits) from
/// failures that will repeat for the same input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentError {
    pub message: String,
    pub retryable: bool,
}

impl AgentError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AgentError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_kind_parsing() {
        assert_eq!("content".parse::<AgentKind>().unwrap(), AgentKind::Content);
        assert_eq!("social-media".parse::<AgentKind>().unwrap(), AgentKind::SocialMedia);
        assert_eq!("Social".parse::<AgentKind>().unwrap(), AgentKind::SocialMedia);
        assert_eq!("ads".parse::<AgentKind>().unwrap(), AgentKind::Advertising);
        assert!("billing".parse::<AgentKind>().is_err());
    }

    #[test]
    fn test_agent_kind_serializes_snake_case() {
        let json = serde_json::to_value(AgentKind::TrendAnalysis).unwrap();
        assert_eq!(json, serde_json::json!("trend_analysis"));
        for kind in AgentKind::all() {
            assert_eq!(kind.as_str().parse::<AgentKind>().unwrap(), *kind);
        }
    }
}
