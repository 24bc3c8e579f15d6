//! Recognized configuration options (spec §6.5). Parsing a config *file*
//! is explicitly out of scope for this crate (see `SPEC_FULL.md` §1.3) —
//! this is just the typed struct every component is built from.

use crate::{ImgcatError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service_port: u16,
    pub hash_length: usize,
    pub image_folder: PathBuf,
    pub cache_folder: PathBuf,
    pub log_folder: PathBuf,
    pub extensions: Vec<String>,
    pub tag_regex: String,
    pub trace_debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_port: 14400,
            hash_length: 256,
            image_folder: PathBuf::from("."),
            cache_folder: PathBuf::from(".imgcat/cache"),
            log_folder: PathBuf::from(".imgcat/log"),
            extensions: vec![
                ".jpg".to_string(),
                ".jpeg".to_string(),
                ".png".to_string(),
            ],
            tag_regex: r"[!-)+-9;-~]+".to_string(),
            trace_debug: false,
        }
    }
}

impl Config {
    /// Rejects configurations that cannot construct a working `Core`:
    /// an empty extension list, or a `tag_regex` that does not compile.
    pub fn validate(&self) -> Result<()> {
        if self.extensions.is_empty() {
            return Err(ImgcatError::UserError {
                message: "extensions list must not be empty".to_string(),
            });
        }
        regex::Regex::new(&self.tag_regex).map_err(|e| ImgcatError::UserError {
            message: format!("invalid tag_regex: {e}"),
        })?;
        if self.hash_length == 0 || !self.hash_length.is_multiple_of(8) {
            return Err(ImgcatError::UserError {
                message: "hash_length must be a positive multiple of 8".to_string(),
            });
        }
        Ok(())
    }

    /// `true` if `path`'s extension (case-insensitive) is recognized.
    pub fn is_recognized_extension(&self, path: &std::path::Path) -> bool {
        let Some(ext) = path.extension() else {
            return false;
        };
        let with_dot = format!(".{}", ext.to_string_lossy().to_lowercase());
        self.extensions.iter().any(|e| e.to_lowercase() == with_dot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_empty_extensions() {
        let mut c = Config::default();
        c.extensions.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_bad_regex() {
        let mut c = Config::default();
        c.tag_regex = "(".to_string();
        assert!(c.validate().is_err());
    }

    #[test]
    fn extension_recognition_is_case_insensitive() {
        let c = Config::default();
        assert!(c.is_recognized_extension(std::path::Path::new("a.JPG")));
        assert!(!c.is_recognized_extension(std::path::Path::new("a.txt")));
    }
}
