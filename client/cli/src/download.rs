//! Streaming download with cooperative cancellation.

use futures_util::TryStreamExt;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

use crate::error::InstallError;
use crate::hashing::DOWNLOAD_CHUNK_SIZE;
use crate::status::CancelToken;

pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Cancelled,
}

/// Stream a GET into `dest`, reading at most 1 MiB at a time. The cancel
/// token is checked before every read; on cancellation the partial file is
/// deleted. If the transport declared a content length that the written
/// byte count misses, the partial file is deleted and the download fails.
/// No retries: retry is a policy of the caller.
pub async fn download_stream(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    dest: &Path,
    cancel: &CancelToken,
    mut on_bytes: impl FnMut(u64),
) -> Result<DownloadOutcome, InstallError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::try_exists(dest).await? {
        tokio::fs::remove_file(dest).await?;
    }

    let response = client
        .get(url)
        .header(API_KEY_HEADER, api_key)
        .send()
        .await?
        .error_for_status()?;
    let declared = response.content_length();

    let mut reader = StreamReader::new(
        response
            .bytes_stream()
            .map_err(std::io::Error::other),
    );
    let mut file = tokio::fs::File::create(dest).await?;
    let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    let mut written: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
            return Ok(DownloadOutcome::Cancelled);
        }

        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| InstallError::Transport(e.to_string()))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        written += n as u64;
        on_bytes(n as u64);
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(expected) = declared {
        if written != expected {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(InstallError::Truncated {
                expected,
                got: written,
            });
        }
    }

    Ok(DownloadOutcome::Completed)
}
