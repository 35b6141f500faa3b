pub mod rest;

use crate::config::Config;
use crate::queue::JobQueue;
use crate::users::UserStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<UserStore>,
    pub queue: Arc<JobQueue>,
    pub config: Config,
}

impl AppState {
    pub fn new(users: UserStore, queue: JobQueue, config: Config) -> Self {
        Self {
            users: Arc::new(users),
            queue: Arc::new(queue),
            config,
        }
    }
}
