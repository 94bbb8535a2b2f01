//! Directory-listing source: an HTML index page of files, each line carrying
//! a modification time and size ahead of the link. Those two fields form the
//! version marker, so unchanged files are skipped without downloading.

use super::{RemoteSource, SourceError, http};
use crate::models::{object::VersionMarker, sync::Candidate};
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use reqwest::Client;
use std::sync::LazyLock;
use tracing::{debug, instrument};

// ` 3/26/2025  8:30 AM     12345 <A HREF="/pub/time.series/pr/pr.series">pr.series</A>`
static ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(\d{1,2}/\d{1,2}/\d{4}\s+\d{1,2}:\d{2}\s*[AP]M)\s+(\d+)\s+<a\s+href="[^"]*">([^<]+)</a>"#,
    )
    .expect("listing pattern is valid")
});

static SPACES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub name: String,
    pub modified: String,
    pub size: u64,
}

impl ListingEntry {
    pub fn version_marker(&self) -> VersionMarker {
        VersionMarker::new(format!("{}|{}", self.modified, self.size))
    }
}

/// Extract file entries from an index page. Directory rows (`<dir>`) and the
/// parent-directory link carry no size and are skipped.
pub fn parse_listing(html: &str) -> Vec<ListingEntry> {
    ENTRY
        .captures_iter(html)
        .filter_map(|caps| {
            let size = caps[2].parse().ok()?;
            Some(ListingEntry {
                name: caps[3].trim().to_string(),
                modified: SPACES.replace_all(caps[1].trim(), " ").into_owned(),
                size,
            })
        })
        .collect()
}

pub struct ListingSource {
    name: String,
    base_url: String,
    allowlist: Vec<String>,
    client: Client,
}

impl ListingSource {
    /// `allowlist` restricts the mirrored files; empty means every listed file.
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        allowlist: Vec<String>,
        client: Client,
    ) -> Self {
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        Self {
            name: name.into(),
            base_url,
            allowlist,
            client,
        }
    }

    fn allowed(&self, file: &str) -> bool {
        self.allowlist.is_empty() || self.allowlist.iter().any(|f| f == file)
    }
}

#[async_trait]
impl RemoteSource for ListingSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn list_candidates(&self) -> Result<Vec<Candidate>, SourceError> {
        let body = http::get_bytes(&self.client, &self.base_url).await?;
        let html = std::str::from_utf8(&body).map_err(|err| SourceError::Listing {
            url: self.base_url.clone(),
            reason: err.to_string(),
        })?;
        let candidates: Vec<Candidate> = parse_listing(html)
            .into_iter()
            .filter(|entry| self.allowed(&entry.name))
            .map(|entry| Candidate::new(entry.name.clone(), Some(entry.version_marker())))
            .collect();
        debug!(count = candidates.len(), "listed candidates");
        Ok(candidates)
    }

    async fn fetch(&self, remote_id: &str) -> Result<Bytes, SourceError> {
        if remote_id.is_empty() || remote_id.contains('/') || remote_id.contains("..") {
            return Err(SourceError::UnknownRemote(remote_id.to_string()));
        }
        http::get_bytes(&self.client, &format!("{}{}", self.base_url, remote_id)).await
    }
}
