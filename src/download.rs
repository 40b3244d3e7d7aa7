//! Streaming firmware downloader.
//!
//! Fetches a release artifact over HTTP and hands the body to the caller in
//! fixed-size chunks. The downloader keeps no state beyond the open response;
//! persisting bytes is the sink's job (see [`StreamingDownloader::download_to_file`]
//! for the common "write to disk" sink).

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

#[cfg(test)]
use mockall::automock;

use crate::config::{DEFAULT_CHUNK_SIZE, DOWNLOAD_TIMEOUT};
use crate::error::{ProvisionError, ProvisionResult};
use crate::verify::hash::FirmwareArtifact;

/// A GET request as issued by the downloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl DownloadRequest {
    /// Build the request for `url` with the fixed header set and timeout.
    pub fn new(url: &str) -> Self {
        let filename = filename_from_url(url);
        Self {
            url: url.to_string(),
            headers: vec![
                (
                    "Content-Disposition".to_string(),
                    format!("attachment filename={}", filename),
                ),
                ("Connection".to_string(), "keep-alive".to_string()),
                ("Cache-Control".to_string(), "max-age=0".to_string()),
                ("Accept-Encoding".to_string(), "gzip, deflate, br".to_string()),
            ],
            timeout: DOWNLOAD_TIMEOUT,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response head plus a readable body.
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Abstraction over the HTTP stack so the downloader can be exercised
/// without a network.
#[cfg_attr(test, automock)]
pub trait HttpClient: Send + Sync {
    /// Issue a GET for the request, returning as soon as headers arrive.
    fn get(&self, request: &DownloadRequest) -> ProvisionResult<HttpResponse>;
}

/// Real implementation backed by `reqwest`'s blocking client.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    pub fn new() -> ProvisionResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("krux-provisioner/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, request: &DownloadRequest) -> ProvisionResult<HttpResponse> {
        let mut builder = self.client.get(&request.url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send()?;
        let status = response.status();

        Ok(HttpResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }
}

/// Downloads artifacts in bounded chunks.
pub struct StreamingDownloader {
    client: Box<dyn HttpClient>,
}

impl StreamingDownloader {
    /// Create a downloader using the real HTTP stack.
    pub fn new() -> ProvisionResult<Self> {
        Ok(Self::with_client(Box::new(ReqwestClient::new()?)))
    }

    pub fn with_client(client: Box<dyn HttpClient>) -> Self {
        Self { client }
    }

    /// Stream `url` in chunks of [`DEFAULT_CHUNK_SIZE`] bytes.
    ///
    /// Returns the number of bytes delivered to `on_data`.
    pub fn download<F>(&self, url: &str, on_data: F) -> ProvisionResult<u64>
    where
        F: FnMut(&[u8]),
    {
        self.download_with_chunk_size(url, DEFAULT_CHUNK_SIZE, on_data)
    }

    /// Stream `url`, calling `on_data` once per chunk, in order.
    ///
    /// Every chunk is exactly `chunk_size` bytes except possibly the last.
    pub fn download_with_chunk_size<F>(
        &self,
        url: &str,
        chunk_size: usize,
        mut on_data: F,
    ) -> ProvisionResult<u64>
    where
        F: FnMut(&[u8]),
    {
        let response = self.open(url)?;
        stream_chunks(response.body, chunk_size, |chunk| {
            on_data(chunk);
            Ok(())
        })
    }

    /// Download `url` into `dest_dir`, returning the materialised artifact.
    ///
    /// Bytes land in `<name>.part` first and are renamed only after the body
    /// was fully received, so a failed transfer never leaves a file that looks
    /// complete. `on_progress` receives `(downloaded, total)` after every chunk.
    pub fn download_to_file<P>(
        &self,
        url: &str,
        dest_dir: &Path,
        chunk_size: usize,
        mut on_progress: P,
    ) -> ProvisionResult<FirmwareArtifact>
    where
        P: FnMut(u64, Option<u64>),
    {
        let filename = filename_from_url(url);
        if filename.is_empty() {
            return Err(ProvisionError::validation(format!(
                "Cannot derive a file name from url: {}",
                url
            )));
        }

        fs::create_dir_all(dest_dir)?;
        let final_path = dest_dir.join(filename);
        let part_path = part_path_for(&final_path);

        let response = self.open(url)?;
        let total = response.content_length;

        let mut file = fs::File::create(&part_path)?;
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;

        let streamed = stream_chunks(response.body, chunk_size, |chunk| {
            file.write_all(chunk)?;
            hasher.update(chunk);
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total);
            Ok(())
        })
        .and_then(|size| {
            file.flush()?;
            Ok(size)
        });

        let size = match streamed {
            Ok(size) => size,
            Err(e) => {
                drop(file);
                if let Err(remove_err) = fs::remove_file(&part_path) {
                    warn!(target: "downloader", "Failed to remove {}: {}", part_path.display(), remove_err);
                }
                return Err(e);
            }
        };
        drop(file);

        fs::rename(&part_path, &final_path)?;

        let sha256 = format!("{:x}", hasher.finalize());
        info!(
            target: "downloader",
            "Saved {} ({} bytes, sha256 {})",
            final_path.display(),
            size,
            sha256
        );

        Ok(FirmwareArtifact {
            path: final_path,
            size,
            sha256,
        })
    }

    /// Issue the request and reject non-success responses.
    fn open(&self, url: &str) -> ProvisionResult<HttpResponse> {
        let request = DownloadRequest::new(url);
        info!(target: "downloader", "Downloading {}", url);
        debug!(target: "downloader", "Request headers: {:?}", request.headers);

        let response = self.client.get(&request)?;
        if !response.is_success() {
            warn!(
                target: "downloader",
                "{} returned {} {}",
                url,
                response.status,
                response.reason
            );
            return Err(ProvisionError::Network {
                status: response.status,
                message: response.reason,
            });
        }

        Ok(response)
    }
}

/// Read `body` to the end in chunks of `chunk_size`, handing each to `sink`.
fn stream_chunks<R, F>(mut body: R, chunk_size: usize, mut sink: F) -> ProvisionResult<u64>
where
    R: Read,
    F: FnMut(&[u8]) -> ProvisionResult<()>,
{
    if chunk_size == 0 {
        return Err(ProvisionError::validation("Chunk size must be greater than 0"));
    }

    let mut buffer = vec![0u8; chunk_size];
    let mut total: u64 = 0;

    loop {
        let filled = fill_chunk(&mut body, &mut buffer)?;
        if filled == 0 {
            break;
        }
        sink(&buffer[..filled])?;
        total += filled as u64;
        if filled < chunk_size {
            break;
        }
    }

    Ok(total)
}

/// Read until `buffer` is full or the reader is exhausted.
fn fill_chunk<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Last path segment of a URL, without query or fragment.
pub fn filename_from_url(url: &str) -> &str {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query.rsplit('/').next().unwrap_or("")
}

fn part_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}
