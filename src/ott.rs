use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::domain::{Enrichment, OttId, UNNAMED_CLADE_NAME};
use crate::error::OttError;

const EXTINCT_FLAGS: [&str; 2] = ["extinct", "extinct_inherited"];

/// Taxon record as returned by `taxonomy/taxon_info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaxonRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rank: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub tax_sources: Vec<String>,
}

impl TaxonRecord {
    pub fn is_extant(&self) -> bool {
        !self
            .flags
            .iter()
            .any(|flag| EXTINCT_FLAGS.contains(&flag.as_str()))
    }

    pub fn into_enrichment(self) -> Enrichment {
        let extant = self.is_extant();
        let description = format!(
            "Rank: {}\nSources: {}",
            self.rank.as_deref().unwrap_or("no rank"),
            self.tax_sources.join(", ")
        );
        Enrichment {
            name: self
                .name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| UNNAMED_CLADE_NAME.to_string()),
            extant: Some(extant),
            other_names: self.synonyms,
            description: Some(description),
        }
    }
}

/// Candidate matches for one submitted name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameMatches {
    pub name: String,
    pub matches: Vec<OttId>,
}

pub trait OttClient: Send + Sync {
    fn taxon_info(&self, id: OttId) -> Result<TaxonRecord, OttError>;
    /// One call for the whole batch; results are keyed by the submitted name.
    fn match_names(&self, names: &[String]) -> Result<Vec<NameMatches>, OttError>;
    fn download_tree(&self, url: &str, destination: &Path) -> Result<(), OttError>;
}

#[derive(Clone)]
pub struct OttHttpClient {
    client: Client,
    api_url: String,
    download_timeout: Duration,
}

impl OttHttpClient {
    pub fn new(
        api_url: &str,
        timeout: Duration,
        download_timeout: Duration,
    ) -> Result<Self, OttError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ott-enricher/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| OttError::OttHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|err| OttError::OttHttp(err.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            download_timeout,
        })
    }

    fn taxon_info_url(&self) -> String {
        format!("{}/taxonomy/taxon_info", self.api_url)
    }

    fn match_names_url(&self) -> String {
        format!("{}/tnrs/match_names", self.api_url)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, OttError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "OTT request failed".to_string());
        Err(OttError::OttStatus { status, message })
    }
}

impl OttClient for OttHttpClient {
    fn taxon_info(&self, id: OttId) -> Result<TaxonRecord, OttError> {
        debug!(ott_id = id.get(), "taxon_info");
        let response = self
            .client
            .post(self.taxon_info_url())
            .json(&json!({ "ott_id": id.get() }))
            .send()
            .map_err(|err| OttError::OttHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        response
            .json::<TaxonRecord>()
            .map_err(|err| OttError::OttResponse(err.to_string()))
    }

    fn match_names(&self, names: &[String]) -> Result<Vec<NameMatches>, OttError> {
        debug!(batch = names.len(), "match_names");
        let response = self
            .client
            .post(self.match_names_url())
            .json(&json!({ "names": names }))
            .send()
            .map_err(|err| OttError::OttHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        let body: MatchNamesResponse = response
            .json()
            .map_err(|err| OttError::OttResponse(err.to_string()))?;
        Ok(body.into_name_matches())
    }

    fn download_tree(&self, url: &str, destination: &Path) -> Result<(), OttError> {
        let response = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .map_err(|err| OttError::TreeDownload(err.to_string()))?;
        let mut response = Self::handle_status(response)
            .map_err(|err| OttError::TreeDownload(err.to_string()))?;
        let mut file =
            File::create(destination).map_err(|err| OttError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| OttError::TreeDownload(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct MatchNamesResponse {
    #[serde(default)]
    pub results: Vec<MatchResult>,
    #[serde(default)]
    pub unmatched_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct MatchResult {
    pub name: String,
    #[serde(default)]
    pub matches: Vec<MatchCandidate>,
}

#[derive(Debug, Deserialize)]
pub struct MatchCandidate {
    pub taxon: MatchTaxon,
}

#[derive(Debug, Deserialize)]
pub struct MatchTaxon {
    pub ott_id: u64,
}

impl MatchNamesResponse {
    /// Flattens `results` and `unmatched_names`; the latter count as zero matches.
    pub fn into_name_matches(self) -> Vec<NameMatches> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(self.results.len() + self.unmatched_names.len());
        for result in self.results {
            if seen.insert(result.name.clone()) {
                out.push(NameMatches {
                    name: result.name,
                    matches: result
                        .matches
                        .into_iter()
                        .map(|candidate| OttId::new(candidate.taxon.ott_id))
                        .collect(),
                });
            }
        }
        for name in self.unmatched_names {
            if seen.insert(name.clone()) {
                out.push(NameMatches {
                    name,
                    matches: Vec::new(),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrichment_from_record() {
        let record: TaxonRecord = serde_json::from_value(json!({
            "ott_id": 770315,
            "name": "Homo sapiens",
            "rank": "species",
            "flags": ["sibling_higher"],
            "synonyms": ["Homo sapiens sapiens"],
            "tax_sources": ["ncbi:9606", "gbif:2436436"]
        }))
        .unwrap();
        let enrichment = record.into_enrichment();
        assert_eq!(enrichment.name, "Homo sapiens");
        assert_eq!(enrichment.extant, Some(true));
        assert_eq!(enrichment.other_names, vec!["Homo sapiens sapiens"]);
        assert_eq!(
            enrichment.description.as_deref(),
            Some("Rank: species\nSources: ncbi:9606, gbif:2436436")
        );
    }

    #[test]
    fn inherited_extinction_counts() {
        let record = TaxonRecord {
            flags: vec!["extinct_inherited".to_string()],
            ..TaxonRecord::default()
        };
        let enrichment = record.into_enrichment();
        assert_eq!(enrichment.extant, Some(false));
        assert_eq!(enrichment.name, UNNAMED_CLADE_NAME);
    }

    #[test]
    fn unmatched_names_become_empty_matches() {
        let response: MatchNamesResponse = serde_json::from_value(json!({
            "results": [
                {"name": "Bar", "matches": [
                    {"taxon": {"ott_id": 1}},
                    {"taxon": {"ott_id": 2}}
                ]}
            ],
            "unmatched_names": ["Foo"]
        }))
        .unwrap();
        let matches = response.into_name_matches();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[1].name, "Foo");
        assert!(matches[1].matches.is_empty());
    }
}
