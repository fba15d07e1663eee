//! Temporary file management.
//!
//! Every sort invocation owns a private temporary directory. Chunk and merge files are allocated inside it and
//! are tracked by [`tempfile::TempPath`] guards, so a file is removed as soon as its guard is dropped and the
//! whole directory is removed when the store goes away, whichever way the sort ends.

use std::fs;
use std::io;
use std::path::Path;

use log;
use tempfile;

const TMP_DIR_PREFIX: &str = ".ext-sort-";

/// Temporary file store of a single sort invocation.
pub struct TempStore {
    dir: tempfile::TempDir,
    rw_buf_size: Option<usize>,
}

impl TempStore {
    /// Creates a store in a new uniquely named directory inside `base`.
    pub fn new(base: &Path, rw_buf_size: Option<usize>) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(TMP_DIR_PREFIX).tempdir_in(base)?;
        log::debug!("using {} as a temporary directory", dir.path().display());

        return Ok(TempStore { dir, rw_buf_size });
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Allocates a new empty temporary file. The returned guard deletes the file when dropped.
    pub fn create(&self, prefix: &str) -> io::Result<(fs::File, tempfile::TempPath)> {
        let file = tempfile::Builder::new().prefix(prefix).tempfile_in(self.dir.path())?;
        return Ok(file.into_parts());
    }

    /// Wraps a file into a buffered writer using the configured buffer size.
    pub fn writer(&self, file: fs::File) -> io::BufWriter<fs::File> {
        match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        }
    }

    /// Wraps a file into a buffered reader using the configured buffer size.
    pub fn reader<R: io::Read>(&self, file: R) -> io::BufReader<R> {
        match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        }
    }

    /// Atomically moves a temporary file onto `output`, replacing any existing file there.
    ///
    /// When a plain rename is impossible (for instance when the store lives on another filesystem) the data is
    /// first copied next to `output` and then renamed into place, so `output` never holds a partial result.
    pub fn finalize(&self, result: tempfile::TempPath, output: &Path) -> io::Result<()> {
        let err = match result.persist(output) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        log::debug!(
            "renaming {} to {} failed ({}), copying instead",
            err.path.display(),
            output.display(),
            err.error
        );

        let mut staged = tempfile::Builder::new()
            .prefix(TMP_DIR_PREFIX)
            .tempfile_in(output_dir(output))?;
        io::copy(&mut fs::File::open(&err.path)?, staged.as_file_mut())?;
        staged.as_file().sync_all()?;
        staged.persist(output).map_err(|err| err.error)?;

        return Ok(());
    }

    /// Atomically replaces `output` with an empty file.
    pub fn finalize_empty(&self, output: &Path) -> io::Result<()> {
        let (file, path) = self.create("empty-")?;
        drop(file);

        self.finalize(path, output)
    }
}

/// Returns the directory a file at `output` is created in.
pub(crate) fn output_dir(output: &Path) -> &Path {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
