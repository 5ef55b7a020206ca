//! Path helpers shared by the client and server front-ends.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("cannot relativize unrelated paths {parent:?} and {path:?}")]
    Unrelated { parent: PathBuf, path: PathBuf },
}

/// Lexically normalizes a path: collapses repeated separators, removes
/// `.` components, and resolves `..` against preceding components.
/// Leading `..` components of a relative path are preserved, and `..`
/// never escapes the root of an absolute path.
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => normalized.push(".."),
            },
            Component::Normal(part) => normalized.push(part),
        }
    }

    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }

    normalized
}

/// Returns `path` relative to `parent`. Both paths are normalized first;
/// a `path` that does not live under `parent` is an error.
pub fn relativize(parent: &Path, path: &Path) -> Result<PathBuf, PathError> {
    let parent = normalize(parent);
    let path = normalize(path);

    match path.strip_prefix(&parent) {
        Ok(relative) => Ok(relative.to_path_buf()),
        Err(_) => Err(PathError::Unrelated { parent, path }),
    }
}

/// Makes a path absolute against the current working directory, then
/// normalizes it.
pub fn absolutize(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(normalize(path));
    }

    Ok(normalize(&std::env::current_dir()?.join(path)))
}

/// Extracts the command name from an `argv[0]` value: the basename with
/// any `.exe` suffix stripped.
pub fn command_basename(program: &str) -> String {
    let basename = match Path::new(program).file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => program.to_string(),
    };

    match basename.strip_suffix(".exe") {
        Some(stripped) => stripped.to_string(),
        None => basename,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_absolute_paths() {
        assert_eq!(normalize(Path::new("/")), PathBuf::from("/"));
        assert_eq!(normalize(Path::new("/../../../")), PathBuf::from("/"));
        assert_eq!(normalize(Path::new("/../../..")), PathBuf::from("/"));
        assert_eq!(
            normalize(Path::new("/../blah/../blah2/../blah3")),
            PathBuf::from("/blah3")
        );
    }

    #[test]
    fn normalize_relative_paths() {
        assert_eq!(normalize(Path::new("../blah/../../")), PathBuf::from("../.."));
        assert_eq!(
            normalize(Path::new("blah2//blah3/./blah4/..")),
            PathBuf::from("blah2/blah3")
        );
        assert_eq!(normalize(Path::new("blah/..")), PathBuf::from("."));
    }

    #[test]
    fn relativize_related_paths() {
        assert_eq!(
            relativize(Path::new("/blah//blah2//"), Path::new("/blah/blah2/blah3")).unwrap(),
            PathBuf::from("blah3")
        );
        assert_eq!(
            relativize(Path::new("/blah/./blah2/."), Path::new("/./blah/blah2/blah3")).unwrap(),
            PathBuf::from("blah3")
        );
        assert_eq!(
            relativize(Path::new("/blah"), Path::new("/blah")).unwrap(),
            PathBuf::new()
        );
    }

    #[test]
    fn relativize_unrelated_paths() {
        assert!(relativize(Path::new("/blah//blah2"), Path::new("/blah/blah2_blah3")).is_err());
        assert!(relativize(Path::new("/blah//blah2_blah3"), Path::new("/blah/blah2")).is_err());
    }

    #[test]
    fn command_basenames() {
        assert_eq!(command_basename("./bin/k8psh"), "k8psh");
        assert_eq!(command_basename("/usr/local/bin/k8pshd"), "k8pshd");
        assert_eq!(command_basename("k8psh.exe"), "k8psh");
        assert_eq!(command_basename("some-command"), "some-command");
    }
}
