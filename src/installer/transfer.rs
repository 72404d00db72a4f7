//! Planning of the SFTP upload.
//!
//! The remote directory is listed first so unchanged files are skipped. A
//! file is uploaded when it is missing remotely or its size differs.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use shell_escape::unix::escape;

use super::env::remote_join;

/// A regular file found under the local bootstrap directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalFile {
    /// Path relative to the local root, `/` separated.
    pub relative: String,
    /// Size in bytes.
    pub size: u64,
}

/// Files and directories an upload must create.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransferPlan {
    /// Remote directories to create, parents first.
    pub directories: Vec<String>,
    /// Relative paths of the files to upload.
    pub files: Vec<String>,
}

impl TransferPlan {
    /// Returns `true` when nothing needs uploading.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Recursively lists the regular files under `root`.
///
/// `skip` names a path, relative to `root`, left out of the walk.
///
/// # Errors
///
/// Returns any I/O error raised while opening or reading directories.
pub fn walk_local(root: &Utf8Path, skip: Option<&str>) -> io::Result<Vec<LocalFile>> {
    let dir = Dir::open_ambient_dir(root, ambient_authority())?;
    let mut files = Vec::new();
    walk_dir(&dir, "", skip, &mut files)?;
    files.sort_by(|lhs, rhs| lhs.relative.cmp(&rhs.relative));
    Ok(files)
}

fn walk_dir(dir: &Dir, prefix: &str, skip: Option<&str>, files: &mut Vec<LocalFile>) -> io::Result<()> {
    for item in dir.entries()? {
        let entry = item?;
        let name = entry.file_name()?;
        let relative = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        if skip == Some(relative.as_str()) {
            continue;
        }

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let child = dir.open_dir(&name)?;
            walk_dir(&child, &relative, skip, files)?;
        } else if file_type.is_file() {
            let size = entry.metadata()?.len();
            files.push(LocalFile { relative, size });
        }
    }
    Ok(())
}

/// Parses the `%P\t%s` listing produced by the remote `find`.
#[must_use]
pub fn parse_remote_listing(listing: &str) -> BTreeMap<String, u64> {
    listing
        .lines()
        .filter_map(|line| {
            let (path, size) = line.rsplit_once('\t')?;
            let parsed = size.trim().parse().ok()?;
            (!path.is_empty()).then(|| (path.to_owned(), parsed))
        })
        .collect()
}

/// Decides which local files must be uploaded.
///
/// An exclusion matches either a file name or a full relative path.
#[must_use]
pub fn plan_transfer(
    local: &[LocalFile],
    remote: &BTreeMap<String, u64>,
    exclusions: &BTreeSet<String>,
) -> TransferPlan {
    let files: Vec<String> = local
        .iter()
        .filter(|file| !is_excluded(&file.relative, exclusions))
        .filter(|file| remote.get(&file.relative) != Some(&file.size))
        .map(|file| file.relative.clone())
        .collect();

    let directories: BTreeSet<String> = files
        .iter()
        .flat_map(|path| parent_directories(path))
        .collect();

    TransferPlan {
        directories: directories.into_iter().collect(),
        files,
    }
}

fn is_excluded(relative: &str, exclusions: &BTreeSet<String>) -> bool {
    let name = relative.rsplit('/').next().unwrap_or(relative);
    exclusions.contains(relative) || exclusions.contains(name)
}

fn parent_directories(path: &str) -> Vec<String> {
    let mut parents = Vec::new();
    let mut current = path;
    while let Some((parent, _)) = current.rsplit_once('/') {
        parents.push(parent.to_owned());
        current = parent;
    }
    parents
}

/// Renders an `sftp -b` batch script for `plan`.
///
/// The descriptor, when given, is always uploaded into the remote root.
#[must_use]
pub fn batch_script(
    local_root: &Utf8Path,
    remote_root: &str,
    plan: &TransferPlan,
    descriptor: Option<&Utf8PathBuf>,
) -> String {
    let mut script = format!("-mkdir {}\n", quote(remote_root));
    for directory in &plan.directories {
        script.push_str("-mkdir ");
        script.push_str(&quote(&remote_join(remote_root, directory)));
        script.push('\n');
    }
    for file in &plan.files {
        let local = local_root.join(file);
        script.push_str("put ");
        script.push_str(&quote(local.as_str()));
        script.push(' ');
        script.push_str(&quote(&remote_join(remote_root, file)));
        script.push('\n');
    }
    if let Some(path) = descriptor
        && let Some(name) = path.file_name()
    {
        script.push_str("put ");
        script.push_str(&quote(path.as_str()));
        script.push(' ');
        script.push_str(&quote(&remote_join(remote_root, name)));
        script.push('\n');
    }
    script
}

fn quote(value: &str) -> String {
    escape(Cow::from(value)).into_owned()
}
