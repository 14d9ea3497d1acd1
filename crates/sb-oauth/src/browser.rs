//! Browser launching for the authorization flow
//!
//! The system browser is an external collaborator; tests substitute a
//! recorder so flows run headless.

use sb_types::{BrokerError, BrokerResult};
use tracing::info;

/// Opens the user's browser at an authorization URL
pub trait Browser: Send + Sync {
    fn open(&self, url: &str) -> BrokerResult<()>;
}

/// Default implementation using the OS handler
pub struct SystemBrowser;

impl Browser for SystemBrowser {
    fn open(&self, url: &str) -> BrokerResult<()> {
        info!("opening browser for authorization");
        open::that(url).map_err(|e| {
            BrokerError::OAuthConfiguration(format!("failed to open browser: {}", e))
        })
    }
}

/// Test double that records the URLs it was asked to open
#[derive(Default)]
pub struct RecordingBrowser {
    pub opened: parking_lot::Mutex<Vec<String>>,
}

impl Browser for RecordingBrowser {
    fn open(&self, url: &str) -> BrokerResult<()> {
        self.opened.lock().push(url.to_string());
        Ok(())
    }
}
