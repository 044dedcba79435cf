use std::sync::Arc;

use crate::config::Config;
use crate::manager::DownloadManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<DownloadManager>,
}

impl AppState {
    pub fn new(config: Config, manager: Arc<DownloadManager>) -> Self {
        Self {
            config: Arc::new(config),
            manager,
        }
    }
}
