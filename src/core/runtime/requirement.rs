use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::EngineError;

/// How a requirement pins its version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionConstraint {
    /// Highest compatible version.
    Latest,
    /// This version and nothing else.
    Exact(String),
    /// Highest compatible version at or above the bound.
    Minimum(String),
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Latest => write!(f, "latest"),
            VersionConstraint::Exact(v) => write!(f, "={v}"),
            VersionConstraint::Minimum(v) => write!(f, ">={v}"),
        }
    }
}

impl FromStr for VersionConstraint {
    type Err = EngineError;

    /// `latest` (or empty), `>=1.2`, `=1.2`, or a bare version meaning exact.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("latest") || raw == "*" {
            return Ok(VersionConstraint::Latest);
        }
        if let Some(min) = raw.strip_prefix(">=") {
            return non_empty(min, raw).map(VersionConstraint::Minimum);
        }
        let exact = raw.strip_prefix("==").or_else(|| raw.strip_prefix('=')).unwrap_or(raw);
        non_empty(exact, raw).map(VersionConstraint::Exact)
    }
}

fn non_empty(version: &str, raw: &str) -> Result<String, EngineError> {
    let version = version.trim();
    if version.is_empty() {
        Err(EngineError::InvalidRecipe(format!(
            "empty version in constraint '{raw}'"
        )))
    } else {
        Ok(version.to_string())
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionConstraint> for String {
    fn from(value: VersionConstraint) -> Self {
        value.to_string()
    }
}

/// A component family plus a version constraint, e.g. `wine >=8.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub family: String,
    #[serde(default = "latest")]
    pub constraint: VersionConstraint,
}

fn latest() -> VersionConstraint {
    VersionConstraint::Latest
}

impl Requirement {
    pub fn new(family: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self {
            family: family.into(),
            constraint,
        }
    }

    pub fn latest(family: impl Into<String>) -> Self {
        Self::new(family, VersionConstraint::Latest)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.constraint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_constraint_forms() {
        assert_eq!("latest".parse::<VersionConstraint>().unwrap(), VersionConstraint::Latest);
        assert_eq!("".parse::<VersionConstraint>().unwrap(), VersionConstraint::Latest);
        assert_eq!(
            ">= 8.0".parse::<VersionConstraint>().unwrap(),
            VersionConstraint::Minimum("8.0".into())
        );
        assert_eq!(
            "=8-26".parse::<VersionConstraint>().unwrap(),
            VersionConstraint::Exact("8-26".into())
        );
        assert_eq!(
            "9.1".parse::<VersionConstraint>().unwrap(),
            VersionConstraint::Exact("9.1".into())
        );
        assert!(">=".parse::<VersionConstraint>().is_err());
    }

    #[test]
    fn requirement_json_defaults_to_latest() {
        let req: Requirement = serde_json::from_str(r#"{ "family": "dxvk" }"#).unwrap();
        assert_eq!(req, Requirement::latest("dxvk"));
        let req: Requirement =
            serde_json::from_str(r#"{ "family": "wine", "constraint": ">=8.0" }"#).unwrap();
        assert_eq!(req.to_string(), "wine >=8.0");
    }
}
