//! The fixed blackboard namespace enumeration and consistency classes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Consistency class of a namespace.
///
/// Strong namespaces publish a synchronous notification before a write
/// returns; eventual namespaces notify asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    Strong,
    Eventual,
}

/// The declared namespace set. Consistency is a property of the
/// namespace, never of individual entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    UserInput,
    Prefs,
    Intent,
    Constraints,
    Candidates,
    Evals,
    Selections,
    Itinerary,
    Affiliate,
    Media,
    Cache,
    Errors,
    Audit,
}

impl Namespace {
    /// All namespaces, in declaration order.
    pub const ALL: [Namespace; 13] = [
        Namespace::UserInput,
        Namespace::Prefs,
        Namespace::Intent,
        Namespace::Constraints,
        Namespace::Candidates,
        Namespace::Evals,
        Namespace::Selections,
        Namespace::Itinerary,
        Namespace::Affiliate,
        Namespace::Media,
        Namespace::Cache,
        Namespace::Errors,
        Namespace::Audit,
    ];

    /// The consistency class of this namespace.
    pub fn consistency(&self) -> Consistency {
        match self {
            Namespace::Selections | Namespace::Itinerary => Consistency::Strong,
            _ => Consistency::Eventual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::UserInput => "user_input",
            Namespace::Prefs => "prefs",
            Namespace::Intent => "intent",
            Namespace::Constraints => "constraints",
            Namespace::Candidates => "candidates",
            Namespace::Evals => "evals",
            Namespace::Selections => "selections",
            Namespace::Itinerary => "itinerary",
            Namespace::Affiliate => "affiliate",
            Namespace::Media => "media",
            Namespace::Cache => "cache",
            Namespace::Errors => "errors",
            Namespace::Audit => "audit",
        }
    }
}

impl FromStr for Namespace {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Namespace::ALL
            .iter()
            .copied()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| EngineError::UnknownNamespace(s.to_string()))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for ns in Namespace::ALL {
            assert_eq!(ns.as_str().parse::<Namespace>().unwrap(), ns);
        }
    }

    #[test]
    fn test_unknown_namespace_is_fatal() {
        let err = "bookings".parse::<Namespace>().unwrap_err();
        assert!(matches!(err, EngineError::UnknownNamespace(ref s) if s == "bookings"));
    }

    #[test]
    fn test_consistency_classes() {
        assert_eq!(Namespace::Selections.consistency(), Consistency::Strong);
        assert_eq!(Namespace::Itinerary.consistency(), Consistency::Strong);
        assert_eq!(Namespace::Media.consistency(), Consistency::Eventual);
        assert_eq!(Namespace::Candidates.consistency(), Consistency::Eventual);
    }

    #[test]
    fn test_serde_names_match_as_str() {
        let v = serde_json::to_value(Namespace::UserInput).unwrap();
        assert_eq!(v, serde_json::json!("user_input"));
    }
}
