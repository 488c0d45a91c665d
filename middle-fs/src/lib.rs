//! Capability-based file helpers for the middle storage layer.
//!
//! Every path is resolved through an ambient `cap-std` directory handle so
//! the overflow cache never touches files outside the directory it was
//! pointed at.
#![forbid(unsafe_code)]

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs::OpenOptions, fs_utf8};
use std::io;

/// File handle returned by the helpers in this crate.
pub use cap_std::fs_utf8::File as Utf8File;

/// Wrap an already-open standard library file, such as an anonymous
/// temporary file, in the capability-based handle used by this crate.
pub fn from_std(file: std::fs::File) -> Utf8File {
    Utf8File::from_std(file)
}

/// Open the ambient directory holding `path` and return it with the file name.
fn open_dir_and_file(path: &Utf8Path) -> io::Result<(fs_utf8::Dir, String)> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::other(format!("{path} does not name a file")))?
        .to_owned();
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let dir = fs_utf8::Dir::open_ambient_dir(parent, ambient_authority())?;
    Ok((dir, file_name))
}

/// Split `dir` into the root it hangs off (a drive prefix, `/`, or the
/// current directory) and the remainder relative to that root.
fn anchor(dir: &Utf8Path) -> (Utf8PathBuf, Utf8PathBuf) {
    let mut root = Utf8PathBuf::new();
    let mut relative = Utf8PathBuf::new();
    for component in dir.components() {
        match component {
            Utf8Component::Prefix(_) | Utf8Component::RootDir if relative.as_str().is_empty() => {
                root.push(component);
            }
            other => relative.push(other),
        }
    }
    if root.as_str().is_empty() {
        root.push(".");
    }
    (root, relative)
}

/// Open `path` for reading and writing, creating it (and its parent
/// directories) when missing. Existing contents are preserved.
pub fn open_read_write(path: &Utf8Path) -> io::Result<Utf8File> {
    ensure_parent_dir(path)?;
    let (dir, name) = open_dir_and_file(path)?;
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    dir.open_with(name.as_str(), &options)
}

/// Remove the file at `path`. A missing file or directory is not an error.
pub fn remove_file_if_exists(path: &Utf8Path) -> io::Result<()> {
    let removed = open_dir_and_file(path).and_then(|(dir, name)| dir.remove_file(name.as_str()));
    match removed {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Create every missing directory above `path`.
pub fn ensure_parent_dir(path: &Utf8Path) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let (root, relative) = anchor(parent);
    if relative.as_str().is_empty() {
        return Ok(());
    }
    fs_utf8::Dir::open_ambient_dir(&root, ambient_authority())?.create_dir_all(&relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::io::{Read, Seek, SeekFrom, Write};
    use tempfile::TempDir;

    #[fixture]
    fn temp_dir() -> TempDir {
        TempDir::new().expect("create temp dir")
    }

    fn utf8(dir: &TempDir, relative: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join(relative)).expect("utf-8 path")
    }

    #[rstest]
    fn open_read_write_creates_nested_file(temp_dir: TempDir) {
        let path = utf8(&temp_dir, "nested/cache/nodes.bin");

        let mut file = open_read_write(&path).expect("open nested file");
        file.write_all(b"abc").expect("write bytes");

        assert!(path.is_file());
    }

    #[rstest]
    fn open_read_write_preserves_contents(temp_dir: TempDir) {
        let path = utf8(&temp_dir, "nodes.bin");
        {
            let mut file = open_read_write(&path).expect("create file");
            file.write_all(b"keep").expect("write bytes");
        }

        let mut file = open_read_write(&path).expect("reopen file");
        file.seek(SeekFrom::Start(0)).expect("rewind");
        let mut contents = String::new();
        file.read_to_string(&mut contents).expect("read back");
        assert_eq!(contents, "keep");
    }

    #[rstest]
    #[case("/var/cache/middle", "/", "var/cache/middle")]
    #[case("cache/middle", ".", "cache/middle")]
    #[case("/", "/", "")]
    fn anchors_split_root_from_relative_part(
        #[case] dir: &str,
        #[case] root: &str,
        #[case] relative: &str,
    ) {
        let (actual_root, actual_relative) = anchor(Utf8Path::new(dir));
        assert_eq!(actual_root, Utf8PathBuf::from(root));
        assert_eq!(actual_relative, Utf8PathBuf::from(relative));
    }

    #[rstest]
    fn removing_a_missing_file_succeeds(temp_dir: TempDir) {
        let path = utf8(&temp_dir, "absent.bin");
        remove_file_if_exists(&path).expect("missing file is fine");
        assert!(!path.exists());
    }

    #[rstest]
    fn removing_an_existing_file_deletes_it(temp_dir: TempDir) {
        let path = utf8(&temp_dir, "nodes.bin");
        open_read_write(&path).expect("create file");

        remove_file_if_exists(&path).expect("remove file");
        assert!(!path.exists());
    }
}
