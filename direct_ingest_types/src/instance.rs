use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr, sync::LazyLock};

use regex::Regex;

static STATE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^US_[A-Z]{2}(_[A-Z]+)?$").expect("valid state code regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid state code [{0}], expected a code of the form US_XX")]
    InvalidStateCode(String),

    #[error("invalid ingest instance [{0}], expected PRIMARY or SECONDARY")]
    InvalidInstance(String),

    #[error("invalid schema type [{0}], expected STATE or OPERATIONS")]
    InvalidSchemaType(String),
}

/// The region a set of raw data belongs to, e.g. `US_XX`.
///
/// Always stored upper case. Dataset, queue and bucket names use
/// [`StateCode::lower`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StateCode(String);

impl StateCode {
    pub fn new(code: impl AsRef<str>) -> Result<Self, ParseError> {
        let upper = code.as_ref().trim().to_ascii_uppercase();
        if STATE_CODE_RE.is_match(&upper) {
            Ok(Self(upper))
        } else {
            Err(ParseError::InvalidStateCode(code.as_ref().to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn lower(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl FromStr for StateCode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for StateCode {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StateCode> for String {
    fn from(value: StateCode) -> Self {
        value.0
    }
}

impl Display for StateCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One of the two parallel copies of a region's ingest data.
///
/// `PRIMARY` feeds production; `SECONDARY` is a sandbox used for reruns and raw
/// data reimports before a flash swaps its results into `PRIMARY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectIngestInstance {
    Primary,
    Secondary,
}

impl DirectIngestInstance {
    pub const ALL: [Self; 2] = [Self::Primary, Self::Secondary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "PRIMARY",
            Self::Secondary => "SECONDARY",
        }
    }

    pub fn lower(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }
}

impl FromStr for DirectIngestInstance {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PRIMARY" => Ok(Self::Primary),
            "SECONDARY" => Ok(Self::Secondary),
            _ => Err(ParseError::InvalidInstance(s.to_string())),
        }
    }
}

impl Display for DirectIngestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Warehouse schemas that are periodically refreshed from the metadata store.
/// A refresh must not overlap with ingest writes for the same instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaType {
    State,
    Operations,
}

impl SchemaType {
    pub const ALL: [Self; 2] = [Self::State, Self::Operations];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::State => "STATE",
            Self::Operations => "OPERATIONS",
        }
    }
}

impl FromStr for SchemaType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STATE" => Ok(Self::State),
            "OPERATIONS" => Ok(Self::Operations),
            _ => Err(ParseError::InvalidSchemaType(s.to_string())),
        }
    }
}

impl Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
