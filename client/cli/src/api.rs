//! REST client for the depot server.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;

use crate::download::API_KEY_HEADER;
use crate::error::InstallError;

/// Total timeout for small metadata fetches (manifest, config).
const METADATA_TIMEOUT: Duration = Duration::from_secs(20);
/// Total timeout for auth and listing calls.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ApiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct ProcessRow {
    pub id: String,
    pub download: f64,
    pub process: f64,
    pub download_url: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountGame {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    user: String,
}

#[derive(Debug, Deserialize)]
struct GamesResponse {
    games: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProcessesResponse {
    processes: Vec<ProcessRow>,
}

#[derive(Debug, Deserialize)]
struct AccountGamesResponse {
    games: Vec<AccountGame>,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        // Connection and between-read timeouts; chunk downloads must not be
        // bounded by a total-request timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn chunk_url(&self, game_id: &str, chunk_index: u32) -> String {
        format!("{}/games/{game_id}/downloadchunk/{chunk_index}", self.base_url)
    }

    async fn get(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<reqwest::Response, InstallError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp)
    }

    /// Auth ping: resolves the API key to its username.
    pub async fn check_user(&self) -> Result<String, InstallError> {
        let resp: UserResponse = self.get("/", PING_TIMEOUT).await?.json().await?;
        Ok(resp.user)
    }

    pub async fn games(&self) -> Result<Vec<String>, InstallError> {
        let resp: GamesResponse = self.get("/games", PING_TIMEOUT).await?.json().await?;
        Ok(resp.games)
    }

    pub async fn manifest_text(&self, game_id: &str) -> Result<String, InstallError> {
        Ok(self
            .get(
                &format!("/games/{game_id}/download/manifest.json"),
                METADATA_TIMEOUT,
            )
            .await?
            .text()
            .await?)
    }

    pub async fn config_text(&self, game_id: &str) -> Result<String, InstallError> {
        Ok(self
            .get(
                &format!("/games/{game_id}/download/config.yaml"),
                METADATA_TIMEOUT,
            )
            .await?
            .text()
            .await?)
    }

    pub async fn processes(&self) -> Result<Vec<ProcessRow>, InstallError> {
        let resp: ProcessesResponse = self
            .get("/processes/data", PING_TIMEOUT)
            .await?
            .json()
            .await?;
        Ok(resp.processes)
    }

    pub async fn account_games(&self) -> Result<Vec<AccountGame>, InstallError> {
        let resp: AccountGamesResponse = self
            .get("/account/games", PING_TIMEOUT)
            .await?
            .json()
            .await?;
        Ok(resp.games)
    }

    pub async fn register(
        base_url: &str,
        username: &str,
        password: &str,
    ) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/register", base_url.trim_end_matches('/')))
            .timeout(PING_TIMEOUT)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Registration failed ({}): {}", status, body);
        }
        Ok(())
    }

    /// Upload a packaged zip with its config. The config field is sent first;
    /// the server requires it before the archive.
    pub async fn upload(&self, config_text: String, zip_path: &Path) -> anyhow::Result<()> {
        let file = tokio::fs::File::open(zip_path).await?;
        let len = file.metadata().await?.len();
        let file_name = zip_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data.zip".to_string());

        let part = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(ReaderStream::new(file)),
            len,
        )
        .file_name(file_name)
        .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new()
            .text("config", config_text)
            .part("file", part);

        let resp = self
            .client
            .post(format!("{}/upload", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Upload failed ({}): {}", status, body);
        }
        Ok(())
    }

    /// Queue a server-side download job; the config embeds the source url.
    pub async fn request_download(&self, config_text: String) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(format!("{}/download", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .form(&[("config", config_text)])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Request failed ({}): {}", status, body);
        }
        Ok(())
    }

    pub async fn delete_game(&self, game_id: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(format!("{}/games/{game_id}", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(PING_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Delete failed ({}): {}", status, body);
        }
        Ok(())
    }

    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(format!("{}/account/password", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(PING_TIMEOUT)
            .json(&serde_json::json!({
                "current_password": current_password,
                "new_password": new_password,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Password change failed ({}): {}", status, body);
        }
        Ok(())
    }

    pub async fn delete_account(&self, current_password: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(format!("{}/account/delete", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(PING_TIMEOUT)
            .json(&serde_json::json!({ "current_password": current_password }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Account deletion failed ({}): {}", status, body);
        }
        Ok(())
    }
}
