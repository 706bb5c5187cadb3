//! Database file provisioning.
//!
//! A [`Provisioner`] turns a database name into a path that is guaranteed to
//! be openable. Connections never touch the file system themselves.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::error::{AccessError, Result};

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, name: &str) -> Result<PathBuf>;
}

/// Always hands out the same path.
#[derive(Debug, Clone)]
pub struct FixedPath(pub PathBuf);

#[async_trait]
impl Provisioner for FixedPath {
    async fn provision(&self, _name: &str) -> Result<PathBuf> {
        Ok(self.0.clone())
    }
}

/// Keeps writable databases in `data_dir`, seeding each from a bundled
/// template in `template_dir` the first time it is requested.
///
/// Without a template the engine creates an empty database on open.
#[derive(Debug, Clone)]
pub struct TemplateProvisioner {
    template_dir: PathBuf,
    data_dir: PathBuf,
}

impl TemplateProvisioner {
    pub fn new(template_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    fn provision_sync(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        let target = self.data_dir.join(name);
        if target.exists() {
            return Ok(target);
        }

        fs::create_dir_all(&self.data_dir).map_err(|err| {
            AccessError::ProvisioningFailed(format!(
                "cannot create {}: {err}",
                self.data_dir.display()
            ))
        })?;

        let template = self.template_dir.join(name);
        if template.is_file() {
            fs::copy(&template, &target).map_err(|err| {
                AccessError::ProvisioningFailed(format!(
                    "cannot copy {} to {}: {err}",
                    template.display(),
                    target.display()
                ))
            })?;
            info!(template = %template.display(), target = %target.display(), "copied bundled database");
        }
        Ok(target)
    }
}

#[async_trait]
impl Provisioner for TemplateProvisioner {
    async fn provision(&self, name: &str) -> Result<PathBuf> {
        self.provision_sync(name)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let plain = !name.is_empty()
        && path.components().count() == 1
        && path.file_name().map(|f| f == path.as_os_str()).unwrap_or(false);
    if plain {
        Ok(())
    } else {
        Err(AccessError::ProvisioningFailed(format!(
            "invalid database name {name:?}"
        )))
    }
}
