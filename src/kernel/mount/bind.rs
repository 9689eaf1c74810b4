/// Lifecycle of one host directory bound into the root
use super::{MountOps, MountOptions};
use crate::config::types::{BindSpec, EchrootError, Result};
use crate::fs::paths::{make_dirs, remove_dirs, resolve_in_root};
use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct BindMount {
    source: PathBuf,
    target: PathBuf,
    options: MountOptions,
    /// Directories created for the target; removed again on unbind
    created: Vec<PathBuf>,
    mounts: Arc<dyn MountOps>,
}

impl BindMount {
    /// `target` is a host path. Fails if `source` is not a directory or if
    /// `target` exists and is not a directory.
    pub fn new(
        source: &Path,
        target: &Path,
        options: MountOptions,
        mounts: Arc<dyn MountOps>,
    ) -> Result<Self> {
        let error = |reason: &str| EchrootError::Binding {
            host_dir: source.to_path_buf(),
            target: target.to_path_buf(),
            reason: reason.to_string(),
        };

        if !source.is_dir() {
            return Err(error("source is not a directory"));
        }
        if fs::symlink_metadata(target).is_ok() && !target.is_dir() {
            return Err(error("target exists and is not a directory"));
        }

        Ok(BindMount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            options,
            created: Vec::new(),
            mounts,
        })
    }

    /// Build from a configured spec, resolving the target inside `root`
    pub fn from_spec(root: &Path, spec: &BindSpec, mounts: Arc<dyn MountOps>) -> Result<Self> {
        let target = resolve_in_root(root, &spec.target).map_err(|e| EchrootError::Binding {
            host_dir: spec.source.clone(),
            target: spec.target.clone(),
            reason: format!("cannot resolve target in root: {}", e),
        })?;
        let options = MountOptions::parse(&spec.options)?;
        Self::new(&spec.source, &target, options, mounts)
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    fn error(&self, reason: String) -> EchrootError {
        EchrootError::Binding {
            host_dir: self.source.clone(),
            target: self.target.clone(),
            reason,
        }
    }

    /// Consult the live mount table
    pub fn is_bound(&self) -> bool {
        match self.mounts.is_mounted(&self.target) {
            Ok(bound) => bound,
            Err(e) => {
                warn!("Cannot read mount table for {}: {}", self.target.display(), e);
                false
            }
        }
    }

    /// Mount the source on the target. A no-op if already bound.
    pub fn bind(&mut self) -> Result<()> {
        if self.is_bound() {
            debug!("{} already bound", self.target.display());
            return Ok(());
        }

        self.created = make_dirs(&self.target)
            .map_err(|e| self.error(format!("cannot create target: {}", e)))?;

        if let Err(e) = self.mounts.bind(&self.source, &self.target, &self.options) {
            remove_dirs(&self.created);
            self.created.clear();
            return Err(self.error(format!("mount failed: {}", e)));
        }

        info!("Bound {} to {}", self.source.display(), self.target.display());
        Ok(())
    }

    /// Unmount the target. A no-op if not bound.
    pub fn unbind(&mut self) -> Result<()> {
        if !self.is_bound() {
            debug!("{} not bound, nothing to unmount", self.target.display());
            return Ok(());
        }

        self.mounts
            .unmount(&self.target, self.options.recursive)
            .map_err(|e| self.error(format!("unmount failed: {}", e)))?;

        if !remove_dirs(&self.created) {
            debug!("Kept created directories under {}", self.target.display());
        }
        self.created.clear();
        info!("Unbound {}", self.target.display());
        Ok(())
    }
}

impl fmt::Debug for BindMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindMount")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("options", &self.options)
            .field("created", &self.created)
            .finish()
    }
}

impl fmt::Display for BindMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.is_bound() { "====" } else { "!=!=" };
        write!(f, "{} {} {}", self.source.display(), label, self.target.display())
    }
}
