use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::constants::PART_EXTENSION;
use crate::error::AcquireError;
use crate::resolver::RemoteDescriptor;

/// Classified result of a single archive request.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    Success(T),
    /// The archive has not published this cycle/hour yet (HTTP 404).
    NotYetPublished,
    HardFailure(FetchFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    Status(u16),
    Timeout,
    Transport(String),
    Io(String),
}

impl From<FetchFailure> for AcquireError {
    fn from(failure: FetchFailure) -> Self {
        match failure {
            FetchFailure::Status(code) => AcquireError::UpstreamHardFailure {
                status: Some(code),
                reason: String::new(),
            },
            FetchFailure::Timeout => AcquireError::UpstreamHardFailure {
                status: None,
                reason: "timed out".to_string(),
            },
            FetchFailure::Transport(reason) => AcquireError::UpstreamHardFailure {
                status: None,
                reason,
            },
            FetchFailure::Io(reason) => AcquireError::LocalIoFailure(reason),
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Streams the descriptor's body to `dest`, replacing whatever was there.
    async fn fetch_once(&self, descriptor: &RemoteDescriptor, dest: &Path) -> Outcome<PathBuf>;

    /// Checks availability without keeping the body.
    async fn probe(&self, descriptor: &RemoteDescriptor) -> Outcome<()>;
}

pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, FetchFailure> {
        debug!("GET {url}");
        self.http.get(url).send().await.map_err(classify_error)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_once(&self, descriptor: &RemoteDescriptor, dest: &Path) -> Outcome<PathBuf> {
        let url = descriptor.url();
        let response = match self.send(&url).await {
            Ok(response) => response,
            Err(failure) => return Outcome::HardFailure(failure),
        };
        match classify_status(response.status()) {
            Outcome::Success(()) => {}
            Outcome::NotYetPublished => return Outcome::NotYetPublished,
            Outcome::HardFailure(failure) => return Outcome::HardFailure(failure),
        }

        match stream_to_file(response, dest).await {
            Ok(()) => Outcome::Success(dest.to_path_buf()),
            Err(failure) => {
                warn!("Download of {url} to {} failed: {failure:?}", dest.display());
                Outcome::HardFailure(failure)
            }
        }
    }

    async fn probe(&self, descriptor: &RemoteDescriptor) -> Outcome<()> {
        match self.send(&descriptor.url()).await {
            Ok(response) => classify_status(response.status()),
            Err(failure) => Outcome::HardFailure(failure),
        }
    }
}

pub fn classify_status(status: StatusCode) -> Outcome<()> {
    match status {
        StatusCode::OK => Outcome::Success(()),
        StatusCode::NOT_FOUND => Outcome::NotYetPublished,
        other => Outcome::HardFailure(FetchFailure::Status(other.as_u16())),
    }
}

fn classify_error(error: reqwest::Error) -> FetchFailure {
    if error.is_timeout() {
        FetchFailure::Timeout
    } else if let Some(status) = error.status() {
        FetchFailure::Status(status.as_u16())
    } else {
        FetchFailure::Transport(format!("{error:#}"))
    }
}

async fn stream_to_file(response: reqwest::Response, dest: &Path) -> Result<(), FetchFailure> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|error| FetchFailure::Io(format!("create {}: {error}", parent.display())))?;
    }

    let part = PartFile::new(dest.with_extension(PART_EXTENSION));
    let mut file = fs::File::create(part.path())
        .await
        .map_err(|error| FetchFailure::Io(format!("create {}: {error}", part.path().display())))?;

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(classify_error)?;
        file.write_all(&chunk)
            .await
            .map_err(|error| FetchFailure::Io(format!("write {}: {error}", part.path().display())))?;
    }
    file.flush()
        .await
        .map_err(|error| FetchFailure::Io(format!("flush {}: {error}", part.path().display())))?;
    drop(file);

    part.commit(dest).await
}

/// Download target that is deleted on drop unless committed, so an aborted
/// or failed transfer never leaves a partial file behind.
struct PartFile {
    path: PathBuf,
    committed: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn commit(mut self, dest: &Path) -> Result<(), FetchFailure> {
        fs::rename(&self.path, dest).await.map_err(|error| {
            FetchFailure::Io(format!(
                "rename {} -> {}: {error}",
                self.path.display(),
                dest.display()
            ))
        })?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
