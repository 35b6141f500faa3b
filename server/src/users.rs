//! User store backed by `users.yaml`.
//!
//! A flat `{users: {name: {api_key}}}` document. Every mutation rewrites the
//! file under the store lock; readers get copies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub api_key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: BTreeMap<String, UserRecord>,
}

pub struct UserStore {
    path: PathBuf,
    users: Mutex<BTreeMap<String, UserRecord>>,
}

impl UserStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let users = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            serde_yaml::from_str::<UsersFile>(&text)?.users
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            users: Mutex::new(users),
        })
    }

    /// Returns `false` when the username is already taken.
    pub fn register(&self, username: &str, api_key: &str) -> anyhow::Result<bool> {
        let mut users = self.users.lock().unwrap();
        if users.contains_key(username) {
            return Ok(false);
        }
        users.insert(
            username.to_string(),
            UserRecord {
                api_key: api_key.to_string(),
            },
        );
        self.persist(&users)?;
        Ok(true)
    }

    pub fn user_for_key(&self, api_key: &str) -> Option<String> {
        let users = self.users.lock().unwrap();
        users
            .iter()
            .find(|(_, record)| record.api_key == api_key)
            .map(|(name, _)| name.clone())
    }

    /// Returns `false` when the current key does not match.
    pub fn rotate_key(
        &self,
        username: &str,
        current: &str,
        new_key: &str,
    ) -> anyhow::Result<bool> {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(username) {
            Some(record) if record.api_key == current => {
                record.api_key = new_key.to_string();
            }
            _ => return Ok(false),
        }
        self.persist(&users)?;
        Ok(true)
    }

    /// Returns `false` when the current key does not match.
    pub fn remove(&self, username: &str, current: &str) -> anyhow::Result<bool> {
        let mut users = self.users.lock().unwrap();
        match users.get(username) {
            Some(record) if record.api_key == current => {}
            _ => return Ok(false),
        }
        users.remove(username);
        self.persist(&users)?;
        Ok(true)
    }

    pub fn usernames(&self) -> Vec<String> {
        self.users.lock().unwrap().keys().cloned().collect()
    }

    fn persist(&self, users: &BTreeMap<String, UserRecord>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = UsersFile {
            users: users.clone(),
        };
        std::fs::write(&self.path, serde_yaml::to_string(&file)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_persists_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.yaml");

        let store = UserStore::open(&path).unwrap();
        assert!(store.register("alice", "key-a").unwrap());
        assert!(!store.register("alice", "other").unwrap());

        let reloaded = UserStore::open(&path).unwrap();
        assert_eq!(reloaded.user_for_key("key-a").as_deref(), Some("alice"));
        assert_eq!(reloaded.user_for_key("nope"), None);
    }

    #[test]
    fn rotate_requires_current_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open(&dir.path().join("users.yaml")).unwrap();
        store.register("bob", "old").unwrap();

        assert!(!store.rotate_key("bob", "wrong", "new").unwrap());
        assert!(store.rotate_key("bob", "old", "new").unwrap());
        assert_eq!(store.user_for_key("new").as_deref(), Some("bob"));
    }

    #[test]
    fn remove_requires_current_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open(&dir.path().join("users.yaml")).unwrap();
        store.register("carol", "key").unwrap();

        assert!(!store.remove("carol", "wrong").unwrap());
        assert!(store.remove("carol", "key").unwrap());
        assert!(store.usernames().is_empty());
    }
}
