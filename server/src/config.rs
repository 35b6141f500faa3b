use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    /// Root of the server's on-disk state: `games/`, `processes/`,
    /// `users.yaml`.
    pub data_dir: PathBuf,
    pub rest_port: u16,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            data_dir: PathBuf::from(
                std::env::var("DEPOT_DATA_PATH").unwrap_or_else(|_| "./data".to_string()),
            ),
            rest_port: std::env::var("REST_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()?,
        })
    }

    pub fn games_dir(&self) -> PathBuf {
        self.data_dir.join("games")
    }

    pub fn processes_dir(&self) -> PathBuf {
        self.data_dir.join("processes")
    }

    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join("users.yaml")
    }
}
