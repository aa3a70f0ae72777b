//! Parsing of normalized raw data file names.
//!
//! Raw files are renamed on upload so the name alone carries everything needed
//! to register them, e.g. `unprocessed_2015-01-02T03:03:03:000003_raw_file_tag.csv`.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::{fmt::Display, str::FromStr, sync::LazyLock};

const FILENAME_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S:%6f";

static NORMALIZED_FILE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<state>processed|unprocessed)_(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}:\d{6})_raw_(?P<tag>[A-Za-z0-9][A-Za-z0-9_]*?)(?:-(?P<suffix>\d+))?\.(?P<ext>[A-Za-z0-9]+)$",
    )
    .expect("valid normalized file name regex")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("file name [{0}] is not a normalized raw data file name")]
    NotNormalized(String),

    #[error("file name [{name}] has an invalid timestamp: {source}")]
    InvalidTimestamp {
        name: String,
        source: chrono::ParseError,
    },
}

/// Components of a normalized raw data file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedRawFileName {
    pub processed: bool,
    pub update_datetime: DateTime<Utc>,
    pub file_tag: String,
    /// Distinguishes multiple files with the same tag and timestamp.
    pub filename_suffix: Option<u32>,
    pub extension: String,
}

impl NormalizedRawFileName {
    pub fn new_unprocessed(
        file_tag: impl Into<String>,
        update_datetime: DateTime<Utc>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            processed: false,
            update_datetime,
            file_tag: file_tag.into(),
            filename_suffix: None,
            extension: extension.into(),
        }
    }

    pub fn parse(name: &str) -> Result<Self, Error> {
        let caps = NORMALIZED_FILE_NAME_RE
            .captures(name)
            .ok_or_else(|| Error::NotNormalized(name.to_string()))?;

        let update_datetime = NaiveDateTime::parse_from_str(&caps["ts"], FILENAME_DATETIME_FORMAT)
            .map_err(|source| Error::InvalidTimestamp {
                name: name.to_string(),
                source,
            })?
            .and_utc();

        let filename_suffix = match caps.name("suffix") {
            Some(m) => Some(
                m.as_str()
                    .parse()
                    .map_err(|_| Error::NotNormalized(name.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            processed: &caps["state"] == "processed",
            update_datetime,
            file_tag: caps["tag"].to_string(),
            filename_suffix,
            extension: caps["ext"].to_string(),
        })
    }

    /// The same file name with the `processed_` prefix.
    pub fn to_processed(&self) -> Self {
        Self {
            processed: true,
            ..self.clone()
        }
    }
}

impl FromStr for NormalizedRawFileName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for NormalizedRawFileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}_raw_{}",
            if self.processed {
                "processed"
            } else {
                "unprocessed"
            },
            self.update_datetime.format(FILENAME_DATETIME_FORMAT),
            self.file_tag,
        )?;
        if let Some(suffix) = self.filename_suffix {
            write!(f, "-{suffix}")?;
        }
        write!(f, ".{}", self.extension)
    }
}
