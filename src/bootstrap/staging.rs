//! Temporary copy of the cluster descriptor inside the upload directory.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::{debug, warn};

use super::BootstrapError;

/// File name the descriptor is staged under.
pub const STAGED_DESCRIPTOR_NAME: &str = "cluster-descriptor.toml";

/// Copy of the descriptor that lives as long as the installs need it.
///
/// The copy is removed when the guard drops. A file the operator already
/// placed under the staged name is used as is and left in place.
#[derive(Debug)]
pub struct StagedDescriptor {
    dir: Dir,
    path: Utf8PathBuf,
    owned: bool,
}

impl StagedDescriptor {
    /// Copies `source` into `upload_dir` as [`STAGED_DESCRIPTOR_NAME`].
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Stage`] when either directory cannot be
    /// opened, the source cannot be read, or the copy cannot be written.
    pub fn stage(upload_dir: &Utf8Path, source: &Utf8Path) -> Result<Self, BootstrapError> {
        let dir = Dir::open_ambient_dir(upload_dir, ambient_authority())
            .map_err(|err| stage_error(upload_dir, &err))?;
        let path = upload_dir.join(STAGED_DESCRIPTOR_NAME);

        if dir.exists(STAGED_DESCRIPTOR_NAME) {
            debug!(path = %path, "using descriptor already present in the upload directory");
            return Ok(Self {
                dir,
                path,
                owned: false,
            });
        }

        let contents = read_source(source)?;
        dir.write(STAGED_DESCRIPTOR_NAME, contents)
            .map_err(|err| stage_error(&path, &err))?;
        debug!(path = %path, "staged cluster descriptor");
        Ok(Self {
            dir,
            path,
            owned: true,
        })
    }

    /// Location of the staged copy.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for StagedDescriptor {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if let Err(err) = self.dir.remove_file(STAGED_DESCRIPTOR_NAME) {
            warn!(path = %self.path, error = %err, "failed to remove staged cluster descriptor");
        }
    }
}

fn read_source(source: &Utf8Path) -> Result<String, BootstrapError> {
    let parent = source
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = source.file_name().ok_or_else(|| BootstrapError::Stage {
        path: source.to_path_buf(),
        message: String::from("descriptor path is missing a file name"),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| stage_error(parent, &err))?;
    dir.read_to_string(file_name)
        .map_err(|err| stage_error(source, &err))
}

fn stage_error(path: &Utf8Path, err: &std::io::Error) -> BootstrapError {
    BootstrapError::Stage {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
