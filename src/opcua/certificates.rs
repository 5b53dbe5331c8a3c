//! PKI directory layout for the OPC UA client stack's own certificate
//! handling (`async-opcua`'s `ClientBuilder::pki_dir`).
//!
//! Trust decisions for server certificates are handled by `async-opcua`
//! itself at connect time; this only makes sure the directories it
//! expects (`own/`, `private/`, `trusted/certs/`, `rejected/certs/`)
//! exist before the client is built.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct CertificateManager {
    pki_dir: PathBuf,
}

impl CertificateManager {
    pub fn new() -> Result<Self> {
        let exe_dir = std::env::current_exe()
            .context("Failed to get executable path")?
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            pki_dir: exe_dir.join("pki"),
        })
    }

    pub fn pki_directory(&self) -> &Path {
        &self.pki_dir
    }

    pub fn ensure_pki_structure(&self) -> Result<()> {
        let dirs = [
            self.pki_dir.join("own"),
            self.pki_dir.join("private"),
            self.pki_dir.join("trusted").join("certs"),
            self.pki_dir.join("rejected").join("certs"),
        ];

        for dir in &dirs {
            if !dir.exists() {
                fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {:?}", dir))?;
                tracing::info!("Created PKI directory: {:?}", dir);
            }
        }

        Ok(())
    }
}

impl Default for CertificateManager {
    fn default() -> Self {
        Self::new().expect("Failed to create CertificateManager")
    }
}
