/// Configuration loading from a JSON session file
use crate::config::types::{EchrootError, Result, SessionConfig};
use std::path::Path;

impl SessionConfig {
    /// Load a session description from a JSON file.
    ///
    /// Missing keys take their defaults, so `{"root": "/srv/jail"}` is a
    /// complete file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EchrootError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        Self::from_json(&content)
            .map_err(|e| EchrootError::Config(format!("{} ({})", e, path.display())))
    }

    /// Parse a session description from JSON text
    pub fn from_json(content: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(content)
            .map_err(|e| EchrootError::Config(format!("Failed to parse config JSON: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Reject configurations no session could run with
    pub fn check(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(EchrootError::Config("command must not be empty".to_string()));
        }
        if self.probe_candidates.is_empty() {
            return Err(EchrootError::Config(
                "probe_candidates must name at least one executable".to_string(),
            ));
        }
        if !self.emulator.install_dir.is_absolute() {
            return Err(EchrootError::Config(format!(
                "emulator.install_dir must be absolute: {}",
                self.emulator.install_dir.display()
            )));
        }
        Ok(())
    }
}
