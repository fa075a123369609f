//! Label description source configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EoeError, EoeResult};

/// Where label descriptions are read from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescriptionConfig {
    /// Tab-separated description file, one line per label index.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl DescriptionConfig {
    /// Validate description configuration.
    pub fn validate(&self) -> EoeResult<()> {
        if let Some(file) = &self.file {
            if file.as_os_str().is_empty() {
                return Err(EoeError::ConfigError {
                    message: "file cannot be an empty path".to_string(),
                });
            }
        }
        Ok(())
    }
}
