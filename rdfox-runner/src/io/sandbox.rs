//! Staged working directory for one run.
//!
//! Inputs are copied (filesystem sources) or drained (stream sources) into a
//! fresh temporary directory. Outputs are read back from disk on every call,
//! since the process may still be writing them.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::error::{CleanupError, OutputError, StagingError};

/// Where a staged file's content comes from.
pub enum Source {
    /// Copy a file, or a directory recursively.
    Path(PathBuf),
    /// Drain once. `None` after the stream has been consumed.
    Reader(Option<Box<dyn Read + Send>>),
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Source::Reader(Some(_)) => f.write_str("Reader(<pending>)"),
            Source::Reader(None) => f.write_str("Reader(<consumed>)"),
        }
    }
}

/// One file to stage: a path relative to the sandbox root and its content.
#[derive(Debug)]
pub struct InputSpec {
    pub target: PathBuf,
    pub source: Source,
}

impl InputSpec {
    pub fn path(target: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            source: Source::Path(source.into()),
        }
    }

    pub fn reader(target: impl Into<PathBuf>, reader: impl Read + Send + 'static) -> Self {
        Self {
            target: target.into(),
            source: Source::Reader(Some(Box::new(reader))),
        }
    }

    /// In-memory content, staged through a stream source.
    pub fn text(target: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self::reader(target, io::Cursor::new(content.into().into_bytes()))
    }

    pub fn is_consumed(&self) -> bool {
        matches!(self.source, Source::Reader(None))
    }
}

/// The working directory of exactly one run.
///
/// Usually a temporary directory owned by the sandbox. A caller-supplied
/// directory (see [`Sandbox::in_dir`]) is never removed.
#[derive(Debug)]
pub struct Sandbox {
    root: PathBuf,
    dir: Option<TempDir>,
    keep: bool,
    destroyed: bool,
}

impl Sandbox {
    /// Create an empty sandbox. With `keep`, the directory survives `destroy`.
    pub fn create(keep: bool) -> Result<Self, StagingError> {
        let dir = tempfile::Builder::new()
            .prefix("rdfox-runner-")
            .tempdir()
            .map_err(StagingError::CreateDir)?;
        let root = dir.path().to_path_buf();
        debug!(root = %root.display(), "created temporary working directory");
        Ok(Self {
            root,
            dir: Some(dir),
            keep,
            destroyed: false,
        })
    }

    /// Use the caller's directory, creating it if missing. It outlives the
    /// sandbox: `destroy` leaves it and its content in place.
    pub fn in_dir(root: impl AsRef<Path>) -> Result<Self, StagingError> {
        let root = std::path::absolute(root.as_ref()).map_err(StagingError::CreateDir)?;
        fs::create_dir_all(&root).map_err(StagingError::CreateDir)?;
        let has_entries = fs::read_dir(&root)
            .map_err(StagingError::CreateDir)?
            .next()
            .is_some();
        if has_entries {
            warn!(root = %root.display(), "working directory is not empty");
        }
        debug!(root = %root.display(), "using caller's working directory");
        Ok(Self {
            root,
            dir: None,
            keep: true,
            destroyed: false,
        })
    }

    /// Create a sandbox and stage `specs` into it.
    ///
    /// On failure the partially staged directory is removed before returning.
    pub fn staged(specs: &mut [InputSpec], keep: bool) -> Result<Self, StagingError> {
        Self::create(keep)?.with_inputs(specs)
    }

    /// Stage `specs`, destroying the sandbox if that fails.
    pub fn with_inputs(mut self, specs: &mut [InputSpec]) -> Result<Self, StagingError> {
        if let Err(err) = self.stage(specs) {
            if let Err(cleanup) = self.destroy() {
                warn!(err = %cleanup, "failed to remove partially staged sandbox");
            }
            return Err(err);
        }
        Ok(self)
    }

    /// Write every spec into the sandbox, creating parent directories.
    ///
    /// Stops at the first failure; earlier writes stay on disk.
    #[instrument(skip_all, fields(root = %self.root.display(), inputs = specs.len()))]
    pub fn stage(&mut self, specs: &mut [InputSpec]) -> Result<(), StagingError> {
        info!("setting up working directory");
        let mut seen = HashSet::new();
        for spec in specs.iter_mut() {
            let dst = resolve(&self.root, &spec.target)
                .ok_or_else(|| StagingError::PathEscapes(spec.target.clone()))?;
            if !seen.insert(dst.clone()) {
                return Err(StagingError::DuplicatePath(spec.target.clone()));
            }
            stage_one(&mut spec.source, &spec.target, &dst)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Absolute path of `relative` inside the sandbox.
    pub fn path(&self, relative: impl AsRef<Path>) -> Result<PathBuf, OutputError> {
        if self.is_destroyed() && !self.keep {
            return Err(OutputError::Destroyed);
        }
        let relative = relative.as_ref();
        resolve(&self.root, relative).ok_or_else(|| OutputError::PathEscapes(relative.into()))
    }

    /// Current on-disk content of `relative`.
    pub fn read_output(&self, relative: impl AsRef<Path>) -> Result<Vec<u8>, OutputError> {
        let path = self.path(relative.as_ref())?;
        fs::read(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => OutputError::NotFound {
                path: relative.as_ref().to_path_buf(),
                source,
            },
            _ => OutputError::Read { path, source },
        })
    }

    pub fn read_output_string(&self, relative: impl AsRef<Path>) -> Result<String, OutputError> {
        let bytes = self.read_output(relative.as_ref())?;
        String::from_utf8(bytes).map_err(|err| OutputError::Read {
            path: relative.as_ref().to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, err),
        })
    }

    /// Remove the directory tree. Safe to call repeatedly.
    pub fn destroy(&mut self) -> Result<(), CleanupError> {
        if std::mem::replace(&mut self.destroyed, true) {
            return Ok(());
        }
        let Some(dir) = self.dir.take() else {
            debug!(root = %self.root.display(), "leaving caller's working directory");
            return Ok(());
        };
        if self.keep {
            let path = dir.keep();
            info!(path = %path.display(), "keeping working directory");
            return Ok(());
        }
        match dir.close() {
            Ok(()) => {
                debug!(root = %self.root.display(), "removed temporary working directory");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CleanupError::Remove {
                path: self.root.clone(),
                source,
            }),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            warn!(err = %err, "failed to remove sandbox on drop");
        }
    }
}

/// Join `relative` onto `root`, refusing anything that would leave `root`.
fn resolve(root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth.checked_sub(1)?;
                out.pop();
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (depth > 0).then_some(out)
}

fn stage_one(source: &mut Source, target: &Path, dst: &Path) -> Result<(), StagingError> {
    let io_err = |source| StagingError::Io {
        path: target.to_path_buf(),
        source,
    };
    match source {
        Source::Path(src) => {
            if !src.exists() {
                return Err(StagingError::MissingSource(src.clone()));
            }
            if src.is_dir() {
                debug!(src = %src.display(), dst = %dst.display(), "copying directory");
                copy_dir(src, dst).map_err(io_err)
            } else {
                debug!(src = %src.display(), dst = %dst.display(), "copying file");
                create_parent(dst).map_err(io_err)?;
                fs::copy(src, dst).map(|_| ()).map_err(io_err)
            }
        }
        Source::Reader(reader) => {
            let mut reader = reader
                .take()
                .ok_or_else(|| StagingError::SourceConsumed(target.to_path_buf()))?;
            debug!(dst = %dst.display(), "writing data");
            create_parent(dst).map_err(io_err)?;
            let mut file = fs::File::create(dst).map_err(io_err)?;
            io::copy(&mut reader, &mut file).map(|_| ()).map_err(io_err)
        }
    }
}

fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

/// Copy a directory tree, replacing `dst` if it already exists.
fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    if dst.exists() {
        fs::remove_dir_all(dst)?;
    }
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            create_parent(&target)?;
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_files() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("source_subdir/nested")).expect("mkdir");
        fs::write(temp.path().join("source_subdir/a.txt"), "a").expect("write a");
        fs::write(temp.path().join("source_subdir/b.txt"), "b").expect("write b");
        fs::write(temp.path().join("source_subdir/nested/c.txt"), "c").expect("write c");
        temp
    }

    #[test]
    fn stages_files_and_streams_with_exact_content() {
        let src = source_files();
        let mut specs = vec![
            InputSpec::path("a.txt", src.path().join("source_subdir/a.txt")),
            InputSpec::path("target_subdir/b.txt", src.path().join("source_subdir/b.txt")),
            InputSpec::text("subdir/deeper/hello.txt", "hello"),
        ];
        let sandbox = Sandbox::staged(&mut specs, false).expect("stage");

        assert_eq!(sandbox.read_output_string("a.txt").expect("a"), "a");
        assert_eq!(sandbox.read_output_string("target_subdir/b.txt").expect("b"), "b");
        assert_eq!(
            sandbox.read_output_string("subdir/deeper/hello.txt").expect("hello"),
            "hello"
        );
        assert!(specs[2].is_consumed());
    }

    #[test]
    fn copies_directories_recursively() {
        let src = source_files();
        let mut specs = vec![InputSpec::path("data", src.path().join("source_subdir"))];
        let sandbox = Sandbox::staged(&mut specs, false).expect("stage");
        assert_eq!(sandbox.read_output_string("data/nested/c.txt").expect("c"), "c");
    }

    #[test]
    fn rejects_paths_outside_root() {
        for target in ["../escape.txt", "a/../../escape.txt", "/etc/passwd", "."] {
            let mut specs = vec![InputSpec::text(target, "x")];
            let err = Sandbox::staged(&mut specs, false).unwrap_err();
            assert!(
                matches!(err, StagingError::PathEscapes(_)),
                "{target}: {err:?}"
            );
        }
    }

    #[test]
    fn dotdot_inside_root_is_allowed() {
        let mut specs = vec![InputSpec::text("a/../b.txt", "b")];
        let sandbox = Sandbox::staged(&mut specs, false).expect("stage");
        assert_eq!(sandbox.read_output_string("b.txt").expect("b"), "b");
    }

    #[test]
    fn missing_source_fails_staging() {
        let mut specs = vec![InputSpec::path("a.txt", "/definitely/not/here.txt")];
        let err = Sandbox::staged(&mut specs, false).unwrap_err();
        assert!(matches!(err, StagingError::MissingSource(_)));
    }

    #[test]
    fn restaging_a_consumed_stream_is_an_error() {
        let mut specs = vec![InputSpec::text("a.txt", "once")];
        let _first = Sandbox::staged(&mut specs, false).expect("first stage");
        let err = Sandbox::staged(&mut specs, false).unwrap_err();
        assert!(matches!(err, StagingError::SourceConsumed(_)));
    }

    #[test]
    fn duplicate_targets_are_rejected() {
        let mut specs = vec![InputSpec::text("a.txt", "1"), InputSpec::text("./a.txt", "2")];
        let err = Sandbox::staged(&mut specs, false).unwrap_err();
        assert!(matches!(err, StagingError::DuplicatePath(_)));
    }

    #[test]
    fn destroy_removes_partially_staged_files() {
        let mut sandbox = Sandbox::create(false).expect("create");
        let root = sandbox.root().to_path_buf();
        let mut specs = vec![
            InputSpec::text("ok.txt", "fine"),
            InputSpec::path("bad.txt", "/definitely/not/here.txt"),
        ];
        assert!(sandbox.stage(&mut specs).is_err());
        assert!(root.join("ok.txt").exists());

        sandbox.destroy().expect("destroy");
        assert!(!root.exists());
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut sandbox = Sandbox::create(false).expect("create");
        let root = sandbox.root().to_path_buf();
        sandbox.destroy().expect("first destroy");
        sandbox.destroy().expect("second destroy");
        assert!(!root.exists());
        assert!(matches!(
            sandbox.read_output("a.txt"),
            Err(OutputError::Destroyed)
        ));
    }

    #[test]
    fn destroy_tolerates_externally_removed_directory() {
        let mut sandbox = Sandbox::create(false).expect("create");
        fs::remove_dir_all(sandbox.root()).expect("remove");
        sandbox.destroy().expect("destroy");
    }

    #[test]
    fn keep_retains_directory() {
        let mut sandbox = Sandbox::create(true).expect("create");
        let root = sandbox.root().to_path_buf();
        sandbox.destroy().expect("destroy");
        assert!(root.exists());
        fs::remove_dir_all(&root).expect("cleanup");
    }

    #[test]
    fn caller_directory_is_created_and_never_removed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("work/run-1");
        let mut specs = vec![InputSpec::text("in.txt", "input")];
        let mut sandbox = Sandbox::in_dir(&root)
            .expect("in_dir")
            .with_inputs(&mut specs)
            .expect("stage");
        assert_eq!(sandbox.root(), root.as_path());
        fs::write(root.join("out.txt"), "output").expect("write");

        sandbox.destroy().expect("destroy");
        assert!(sandbox.is_destroyed());
        assert_eq!(fs::read_to_string(root.join("in.txt")).expect("in"), "input");
        assert_eq!(sandbox.read_output_string("out.txt").expect("out"), "output");
        drop(sandbox);
        assert!(root.join("out.txt").exists());
    }

    #[test]
    fn caller_directory_may_already_have_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("old.txt"), "old").expect("write");
        let mut sandbox = Sandbox::in_dir(temp.path()).expect("in_dir");
        sandbox.stage(&mut [InputSpec::text("new.txt", "new")]).expect("stage");
        sandbox.destroy().expect("destroy");
        assert!(temp.path().join("old.txt").exists());
        assert!(temp.path().join("new.txt").exists());
    }

    #[test]
    fn read_output_reflects_later_writes() {
        let sandbox = Sandbox::create(false).expect("create");
        let err = sandbox.read_output("result.txt").unwrap_err();
        assert!(matches!(err, OutputError::NotFound { .. }));

        fs::write(sandbox.root().join("result.txt"), "v1").expect("write");
        assert_eq!(sandbox.read_output("result.txt").expect("read"), b"v1");
        fs::write(sandbox.root().join("result.txt"), "v2").expect("write");
        assert_eq!(sandbox.read_output("result.txt").expect("read"), b"v2");
    }
}
