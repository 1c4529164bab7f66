use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::OttError;

static CANONICAL_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^ott(\d+)$").unwrap());

pub const UNKNOWN_TAXON_NAME: &str = "Unknown Taxon";
pub const UNNAMED_CLADE_NAME: &str = "Unnamed Clade";

/// Numeric identifier of a record in the Open Tree Taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OttId(u64);

impl OttId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OttId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node label as it appears in the tree, e.g. `ott93302` or `mrcaott1ott2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxonId(String);

impl TaxonId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> TaxonKind {
        CANONICAL_ID
            .captures(&self.0)
            .and_then(|caps| caps.get(1))
            .and_then(|digits| digits.as_str().parse::<u64>().ok())
            .map(|value| TaxonKind::Canonical(OttId(value)))
            .unwrap_or(TaxonKind::Composite)
    }
}

impl fmt::Display for TaxonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaxonId {
    type Err = OttError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(OttError::InvalidTaxonId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for TaxonId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaxonId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxonKind {
    /// `ott<digits>`: has a record in the taxonomy.
    Canonical(OttId),
    /// Synthetic or merged node with no remote record.
    Composite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrichment {
    pub name: String,
    #[serde(default)]
    pub extant: Option<bool>,
    #[serde(default)]
    pub other_names: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Enrichment {
    /// Payload written for composite ids without asking the API.
    pub fn placeholder() -> Self {
        Self {
            name: UNKNOWN_TAXON_NAME.to_string(),
            extant: None,
            other_names: Vec::new(),
            description: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.name == UNKNOWN_TAXON_NAME && self.extant.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taxon {
    pub id: TaxonId,
    pub parent: Option<TaxonId>,
    pub enrichment: Option<Enrichment>,
}

impl Taxon {
    pub fn state(&self) -> TaxonState {
        match &self.enrichment {
            None => TaxonState::Pending,
            Some(enrichment) if enrichment.is_placeholder() => TaxonState::Skipped,
            Some(_) => TaxonState::Enriched,
        }
    }
}

/// Per-taxon lifecycle. `Skipped` and `Enriched` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxonState {
    Pending,
    Skipped,
    Enriched,
}

impl TaxonState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaxonState::Pending => "pending",
            TaxonState::Skipped => "skipped",
            TaxonState::Enriched => "enriched",
        }
    }
}

/// Outcome of matching a free-text name against the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Resolved(OttId),
    NotFound,
    Ambiguous,
}

impl Resolution {
    pub fn from_match_count(matches: &[OttId]) -> Self {
        match matches {
            [] => Resolution::NotFound,
            [only] => Resolution::Resolved(*only),
            _ => Resolution::Ambiguous,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Resolved(id) => write!(f, "resolved:{id}"),
            Resolution::NotFound => write!(f, "not_found"),
            Resolution::Ambiguous => write!(f, "ambiguous"),
        }
    }
}

impl FromStr for Resolution {
    type Err = OttError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "not_found" => Ok(Resolution::NotFound),
            "ambiguous" => Ok(Resolution::Ambiguous),
            other => other
                .strip_prefix("resolved:")
                .and_then(|digits| digits.parse::<u64>().ok())
                .map(|id| Resolution::Resolved(OttId(id)))
                .ok_or_else(|| OttError::Store(format!("unknown name resolution `{other}`"))),
        }
    }
}
