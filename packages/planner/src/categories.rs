//! Travel categories the pipeline fans out across.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A travel product category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Hotel,
    Flight,
    Activity,
    Restaurant,
    Car,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Hotel,
        Category::Flight,
        Category::Activity,
        Category::Restaurant,
        Category::Car,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Hotel => "hotel",
            Category::Flight => "flight",
            Category::Activity => "activity",
            Category::Restaurant => "restaurant",
            Category::Car => "car",
        }
    }

    /// Key prefix used for blackboard candidate caches; lines up with
    /// the configured per-category TTL rules.
    pub fn cache_prefix(&self) -> &'static str {
        match self {
            Category::Hotel => "hotels",
            Category::Flight => "flights",
            Category::Activity => "activities",
            Category::Restaurant => "restaurants",
            Category::Car => "cars",
        }
    }

    pub fn parse(s: &str) -> Option<Category> {
        Category::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for category in Category::ALL {
            assert_eq!(Category::parse(category.as_str()), Some(category));
        }
        assert_eq!(Category::parse("cruise"), None);
    }

    #[test]
    fn test_cache_prefixes_match_ttl_rules() {
        // These prefixes must stay in sync with the blackboard's
        // category TTL patterns (flights*, hotels*, ...).
        assert_eq!(Category::Flight.cache_prefix(), "flights");
        assert_eq!(Category::Hotel.cache_prefix(), "hotels");
        assert_eq!(Category::Car.cache_prefix(), "cars");
    }

    #[test]
    fn test_serde_uses_lowercase() {
        assert_eq!(
            serde_json::to_value(Category::Restaurant).unwrap(),
            serde_json::json!("restaurant")
        );
    }
}
