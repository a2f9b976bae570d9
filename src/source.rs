//! Source periods and payload download.
//!
//! A source template is a URL whose file name carries a six-digit year-month
//! token (e.g. `202301` in `.../202301-citibike-tripdata.csv.zip`). Each
//! [`SourcePeriod`] substitutes its own `{year}{month:02}` for that token and
//! leaves the rest of the URL untouched.

use std::ops::Range;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

/// One (template, year, month) unit of remote data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePeriod {
    pub template: String,
    pub year: i32,
    pub month: u32,
}

impl SourcePeriod {
    /// The `{year}{month:02}` token for this period.
    pub fn token(&self) -> String {
        format!("{}{:02}", self.year, self.month)
    }

    pub fn url(&self) -> Result<String> {
        let token = find_period_token(&self.template).ok_or_else(|| {
            Error::Configuration(format!(
                "source template has no year-month token: {}",
                self.template
            ))
        })?;
        let mut url = self.template.clone();
        url.replace_range(token, &self.token());
        Ok(url)
    }
}

/// Byte range of the year-month token: the last run of exactly six ASCII
/// digits in the final path segment whose last two digits are a month.
/// Digit runs in directories, the query string or the fragment never match.
pub fn find_period_token(template: &str) -> Option<Range<usize>> {
    let path_end = template
        .find(|c: char| c == '?' || c == '#')
        .unwrap_or(template.len());
    let bytes = &template.as_bytes()[..path_end];
    let mut start = template[..path_end].rfind('/').map_or(0, |slash| slash + 1);
    let mut found = None;
    while start < bytes.len() {
        if !bytes[start].is_ascii_digit() {
            start += 1;
            continue;
        }
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end - start == 6 {
            if let Ok(month) = template[start + 4..end].parse::<u32>() {
                if (1..=12).contains(&month) {
                    found = Some(start..end);
                }
            }
        }
        start = end;
    }
    found
}

/// The twelve periods of `year`, January first.
pub fn periods_for_year(template: &str, year: i32) -> Result<Vec<SourcePeriod>> {
    if !(template.starts_with("http://")
        || template.starts_with("https://")
        || template.starts_with("file://"))
    {
        return Err(Error::Configuration(format!(
            "source template must be an http(s):// or file:// url: {}",
            template
        )));
    }
    if find_period_token(template).is_none() {
        return Err(Error::Configuration(format!(
            "source template has no year-month token: {}",
            template
        )));
    }

    Ok((1..=12)
        .map(|month| SourcePeriod {
            template: template.to_string(),
            year,
            month,
        })
        .collect())
}

/// The twelve monthly source URLs for `year`, in calendar order.
pub fn generate_monthly_urls(base_url: &str, year: i32) -> Result<Vec<String>> {
    periods_for_year(base_url, year)?
        .iter()
        .map(SourcePeriod::url)
        .collect()
}

/// File name a payload is saved under: the URL's last path segment.
pub fn archive_name(url: &str) -> String {
    let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "payload.zip".to_string(),
    }
}

/// Where [`download`] saves the payload for `url`.
pub fn archive_path(url: &str, dir: &Path) -> PathBuf {
    dir.join(archive_name(url))
}

/// Download `url` into `dir`, returning the saved path.
///
/// `http(s)://` payloads are streamed to disk; `file://` payloads are copied
/// from a local mirror.
pub async fn download(client: &reqwest::Client, url: &str, dir: &Path) -> Result<PathBuf> {
    let destination = archive_path(url, dir);

    if let Some(source) = url.strip_prefix("file://") {
        tokio::fs::copy(source, &destination)
            .await
            .map_err(|e| Error::TransientIo(format!("copy {} failed: {}", source, e)))?;
        return Ok(destination);
    }

    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::Configuration(format!("unsupported url scheme: {}", url)));
    }

    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::TransientIo(format!("GET {} failed: {}", url, e)))?;

    let mut file = tokio::fs::File::create(&destination).await.map_err(|e| {
        Error::TransientIo(format!("cannot create {}: {}", destination.display(), e))
    })?;

    let mut written = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| Error::TransientIo(format!("reading {} failed: {}", url, e)))?
    {
        file.write_all(&chunk).await.map_err(|e| {
            Error::TransientIo(format!("writing {} failed: {}", destination.display(), e))
        })?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| Error::TransientIo(format!("writing {} failed: {}", destination.display(), e)))?;

    tracing::debug!(url, bytes = written, "payload downloaded");
    Ok(destination)
}
