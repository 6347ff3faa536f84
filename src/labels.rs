use std::{
    collections::BTreeMap,
    fs::{self, Permissions},
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use tempfile::Builder;
use thiserror::Error;
use tracing::{debug, trace};

// Every label emitted by the daemon lives under this namespace
pub const LABEL_PREFIX: &str = "nvidia.com/";

// Name of the scratch directory created next to the output file
const TMP_DIR_NAME: &str = "gfd-tmp";
const TMP_FILE_PREFIX: &str = "gfd-";
const OUTPUT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Error)]
pub enum LabelsError {
    #[error("failed to retrieve absolute path of output file '{path}': {source}")]
    AbsolutePath { path: PathBuf, source: io::Error },
    #[error("failed to create temporary directory '{path}': {source}")]
    TmpDir { path: PathBuf, source: io::Error },
    #[error("error writing temporary file for '{path}': {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("error moving temporary file to '{path}': {source}")]
    Persist { path: PathBuf, source: io::Error },
    #[error("error setting permissions on '{path}': {source}")]
    Permissions { path: PathBuf, source: io::Error },
    #[error("failed to remove '{path}': {source}")]
    Remove { path: PathBuf, source: io::Error },
    #[error("failed to write labels to stdout: {0}")]
    Stdout(#[source] io::Error),
}

// Build a fully qualified label key from its short name,
// e.g. "gpu.count" becomes "nvidia.com/gpu.count"
pub fn key(name: &str) -> String {
    format!("{LABEL_PREFIX}{name}")
}

/// A set of node labels.
///
/// Keys are unique, so the order in which they are serialized carries no
/// meaning. A `BTreeMap` is used anyway so the output file is stable
/// between passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
    labels: BTreeMap<String, String>,
}

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    // Insert or overwrite a label
    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.labels.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.labels.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    // Copy every label of `other` into this set,
    // overwriting the labels sharing the same key
    pub fn extend_from(&mut self, other: &Labels) {
        for (key, value) in other.labels.iter() {
            self.labels.insert(key.clone(), value.clone());
        }
    }

    /// Merge several label sets into a new one.
    ///
    /// Sources are applied in order, a later source always overrides the
    /// value an earlier source set for the same key. `None` sources are
    /// skipped.
    pub fn merge<'a, I>(sources: I) -> Labels
    where
        I: IntoIterator<Item = Option<&'a Labels>>,
    {
        let mut merged = Labels::new();

        for source in sources.into_iter().flatten() {
            merged.extend_from(source);
        }

        merged
    }

    // Serialize the labels as "key=value" lines
    pub fn write_to<W: Write>(&self, output: &mut W) -> io::Result<usize> {
        let mut total = 0;

        for (key, value) in self.iter() {
            let line = format!("{key}={value}\n");
            output.write_all(line.as_bytes())?;
            total += line.len();
        }

        Ok(total)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut output = Vec::new();

        // Writing to a Vec never fails
        let _ = self.write_to(&mut output);

        output
    }

    // Write the labels to the given path. The file is replaced atomically.
    // An empty path writes the labels to stdout instead.
    pub fn write_to_file(&self, path: &Path) -> Result<(), LabelsError> {
        if path.as_os_str().is_empty() {
            let mut stdout = io::stdout().lock();
            self.write_to(&mut stdout).map_err(LabelsError::Stdout)?;

            return Ok(());
        }

        write_file_atomically(path, &self.to_bytes())
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Labels {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut labels = Labels::new();

        for (key, value) in iter {
            labels.insert(key, value);
        }

        labels
    }
}

// Write the content to a temporary file next to the
// destination then move it over the destination path
fn write_file_atomically(path: &Path, contents: &[u8]) -> Result<(), LabelsError> {
    let abs_path = std::path::absolute(path).map_err(|source| {
        LabelsError::AbsolutePath { path: path.to_path_buf(), source }
    })?;

    let tmp_dir = tmp_dir_for(&abs_path);

    fs::create_dir_all(&tmp_dir).map_err(|source| LabelsError::TmpDir {
        path: tmp_dir.clone(),
        source,
    })?;

    // The temporary file is deleted on drop if anything below fails
    let mut tmp_file = Builder::new()
        .prefix(TMP_FILE_PREFIX)
        .tempfile_in(&tmp_dir)
        .map_err(|source| LabelsError::Write {
            path: abs_path.clone(),
            source,
        })?;

    trace!("Writing labels to temporary file {:?}", tmp_file.path());

    tmp_file
        .write_all(contents)
        .and_then(|_| tmp_file.as_file().sync_all())
        .map_err(|source| LabelsError::Write {
            path: abs_path.clone(),
            source,
        })?;

    let file = tmp_file.persist(&abs_path).map_err(|err| {
        LabelsError::Persist {
            path: abs_path.clone(),
            source: err.error,
        }
    })?;

    file.set_permissions(Permissions::from_mode(OUTPUT_FILE_MODE))
        .map_err(|source| LabelsError::Permissions {
            path: abs_path.clone(),
            source,
        })?;

    debug!("Labels written to {:?}", abs_path);

    Ok(())
}

// Remove the output file and the temporary directory next to it
pub fn remove_output_file(path: &Path) -> Result<(), LabelsError> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }

    let abs_path = std::path::absolute(path).map_err(|source| {
        LabelsError::AbsolutePath { path: path.to_path_buf(), source }
    })?;

    let tmp_dir = tmp_dir_for(&abs_path);

    match fs::remove_dir_all(&tmp_dir) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            return Err(LabelsError::Remove { path: tmp_dir, source: err });
        }
        _ => {}
    }

    fs::remove_file(&abs_path).map_err(|source| LabelsError::Remove {
        path: abs_path.clone(),
        source,
    })
}

fn tmp_dir_for(abs_path: &Path) -> PathBuf {
    abs_path
        .parent()
        .map(|dir| dir.join(TMP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(TMP_DIR_NAME))
}
