use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::error::AppError;

const DOWNLOAD_ATTEMPTS: u32 = 3;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// A package file ready for installation. Downloaded files are owned by the kit and removed by
/// `cleanup`; local files are never touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub path: PathBuf,
    pub downloaded: bool,
}

impl ResolvedArtifact {
    pub fn path_str(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    pub fn cleanup(&self) {
        if !self.downloaded {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %err, "failed to remove downloaded artifact");
        }
    }
}

pub fn is_url(source: &str) -> bool {
    let lowered = source.trim().to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://")
}

/// Last path segment of a URL without query or fragment.
pub fn file_name_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .unwrap_or("artifact.bin")
        .to_string()
}

/// Resolves a local path or downloads an http(s) URL into `download_dir`.
pub fn resolve_artifact(
    source: &str,
    download_dir: &Path,
    trace_id: &str,
) -> Result<ResolvedArtifact, AppError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(AppError::validation("Package source is empty", trace_id));
    }
    if is_url(source) {
        let path = download(source, download_dir, trace_id)?;
        return Ok(ResolvedArtifact {
            path,
            downloaded: true,
        });
    }
    let path = PathBuf::from(source);
    if !path.is_file() {
        return Err(AppError::not_found(
            format!("Local path {source} not exist"),
            trace_id,
        ));
    }
    Ok(ResolvedArtifact {
        path,
        downloaded: false,
    })
}

fn download(url: &str, download_dir: &Path, trace_id: &str) -> Result<PathBuf, AppError> {
    fs::create_dir_all(download_dir).map_err(|err| {
        AppError::system(format!("Failed to create download dir: {err}"), trace_id)
    })?;
    let target = download_dir.join(file_name_from_url(url));
    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|err| AppError::dependency(format!("HTTP client unavailable: {err}"), trace_id))?;

    let mut last_error = String::new();
    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        match download_once(&client, url, download_dir, &target) {
            Ok(()) => {
                info!(trace_id = %trace_id, url, path = %target.display(), "artifact downloaded");
                return Ok(target);
            }
            Err(err) => {
                warn!(trace_id = %trace_id, url, attempt, error = %err, "artifact download failed");
                last_error = err;
            }
        }
    }
    Err(AppError::transport(
        format!("Download of {url} failed: {last_error}"),
        trace_id,
    ))
}

fn download_once(
    client: &reqwest::blocking::Client,
    url: &str,
    download_dir: &Path,
    target: &Path,
) -> Result<(), String> {
    let mut response = client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(|err| err.to_string())?;
    // Written through a temp file so a failed transfer never leaves a truncated artifact behind.
    let mut file = tempfile::NamedTempFile::new_in(download_dir).map_err(|err| err.to_string())?;
    response.copy_to(&mut file).map_err(|err| err.to_string())?;
    file.persist(target).map_err(|err| err.to_string())?;
    Ok(())
}
