//! Startup configuration and optional model fetching.

use std::{env, fs, path::Path, path::PathBuf};

use log::info;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

/// Environment-derived settings, with defaults suitable for local runs.
pub struct Config {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub model_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Config {
        let body_limit_bytes = {
            let mb = env::var("BODY_LIMIT_MB")
                .unwrap_or_else(|_| "5".into())
                .parse::<usize>()
                .expect("BODY_LIMIT_MB must be a valid integer");
            mb * 1024 * 1024
        };

        let port = env::var("PORT")
            .unwrap_or_else(|_| "5000".into())
            .parse::<u16>()
            .expect("PORT must be a valid number between 0 and 65535");

        let model_dir = env::var("MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./model"));

        Config {
            port,
            body_limit_bytes,
            model_dir,
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("download of {url} returned {status}")]
    BadStatus { url: String, status: reqwest::StatusCode },
    #[error("failed to write {path}: {source}")]
    Write { path: String, source: std::io::Error },
}

/// Downloads the frozen graph when it is missing and `MODEL_URL` is set.
/// Without a URL, a missing file is left for the model loader to report.
pub async fn ensure_model_file(path: &Path) -> Result<(), FetchError> {
    if path.exists() {
        return Ok(());
    }
    let url = match env::var("MODEL_URL") {
        Ok(url) => url,
        Err(_) => {
            info!("{} not present and MODEL_URL unset; skipping fetch", path.display());
            return Ok(());
        }
    };
    download_file(&url, path).await
}

async fn download_file(url: &str, path: &Path) -> Result<(), FetchError> {
    info!("downloading {} from {}", path.display(), url);

    let mut header_map = HeaderMap::new();
    if let Ok(token) = env::var("MODEL_URL_TOKEN") {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .expect("MODEL_URL_TOKEN contains invalid header characters");
        header_map.insert(HeaderName::from_static("authorization"), auth_value);
    }
    header_map.insert(
        HeaderName::from_static("accept"),
        HeaderValue::from_static("application/octet-stream"),
    );

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;

    if !response.status().is_success() {
        return Err(FetchError::BadStatus {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let bytes = response.bytes().await.map_err(|source| FetchError::Request {
        url: url.to_string(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| FetchError::Write {
            path: parent.display().to_string(),
            source,
        })?;
    }
    fs::write(path, bytes).map_err(|source| FetchError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_file_skips_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frozen_graph.pb");
        std::fs::write(&path, b"graph").unwrap();

        assert!(ensure_model_file(&path).await.is_ok());
    }
}
