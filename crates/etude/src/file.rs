// src/file.rs
use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::config::MAX_PATH_LEN;
use crate::http::Status;

/// A regular file mapped read-only for the lifetime of one response.
#[derive(Debug)]
pub struct MappedFile {
    map: Option<Mmap>,
    len: usize,
    content_type: &'static str,
}

impl MappedFile {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

/// Resolve `url` under `doc_root` and map the file it names.
///
/// Errors map straight to the response status: missing → 404, not
/// world-readable or escaping the root → 403, a directory → 400, an
/// over-long path or a failed mapping → 500.
pub fn resolve(doc_root: &Path, url: &str) -> Result<MappedFile, Status> {
    let url = url.split_once('?').map_or(url, |(path, _)| path);
    if url.split('/').any(|segment| segment == "..") {
        return Err(Status::Forbidden);
    }

    let root = doc_root.as_os_str().len();
    if root + url.len() > MAX_PATH_LEN {
        return Err(Status::InternalError);
    }
    let mut path = PathBuf::from(doc_root);
    path.as_mut_os_string().push(url);

    let meta = std::fs::metadata(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => Status::NotFound,
        io::ErrorKind::PermissionDenied => Status::Forbidden,
        _ => Status::InternalError,
    })?;

    if meta.permissions().mode() & 0o004 == 0 {
        return Err(Status::Forbidden);
    }
    if meta.is_dir() {
        return Err(Status::BadRequest);
    }
    if !meta.is_file() {
        return Err(Status::Forbidden);
    }

    let file = File::open(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Status::NotFound,
        io::ErrorKind::PermissionDenied => Status::Forbidden,
        _ => Status::InternalError,
    })?;

    let content_type = mime_guess::from_path(&path)
        .first_raw()
        .unwrap_or("application/octet-stream");

    let len = meta.len() as usize;
    if len == 0 {
        return Ok(MappedFile {
            map: None,
            len,
            content_type,
        });
    }

    // SAFETY: the mapping is read-only and dropped once the response is
    // flushed. A file truncated underneath us can still SIGBUS, as with
    // any mmap-based server.
    let map = unsafe { Mmap::map(&file) }.map_err(|_| Status::InternalError)?;
    Ok(MappedFile {
        len: map.len(),
        map: Some(map),
        content_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn root_with(files: &[(&str, &[u8])]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, bytes) in files {
            let path = dir.path().join(name.trim_start_matches('/'));
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, bytes).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        }
        dir
    }

    #[test]
    fn maps_regular_file() {
        let dir = root_with(&[("index.html", b"<h1>hi</h1>")]);
        let file = resolve(dir.path(), "/index.html").unwrap();
        assert_eq!(file.bytes(), b"<h1>hi</h1>");
        assert_eq!(file.len(), 11);
        assert_eq!(file.content_type(), "text/html");
    }

    #[test]
    fn query_string_is_ignored() {
        let dir = root_with(&[("a.txt", b"abc")]);
        assert_eq!(resolve(dir.path(), "/a.txt?v=2").unwrap().bytes(), b"abc");
    }

    #[test]
    fn empty_file_needs_no_mapping() {
        let dir = root_with(&[("empty.txt", b"")]);
        let file = resolve(dir.path(), "/empty.txt").unwrap();
        assert!(file.is_empty());
        assert_eq!(file.bytes(), b"");
    }

    #[test]
    fn status_for_failures() {
        let dir = root_with(&[("secret.txt", b"x"), ("sub/a.txt", b"y")]);
        fs::set_permissions(
            dir.path().join("secret.txt"),
            fs::Permissions::from_mode(0o600),
        )
        .unwrap();
        fs::set_permissions(dir.path().join("sub"), fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(resolve(dir.path(), "/missing.html").unwrap_err(), Status::NotFound);
        assert_eq!(resolve(dir.path(), "/secret.txt").unwrap_err(), Status::Forbidden);
        assert_eq!(resolve(dir.path(), "/sub").unwrap_err(), Status::BadRequest);
        assert_eq!(
            resolve(dir.path(), "/sub/../secret.txt").unwrap_err(),
            Status::Forbidden
        );

        let long = format!("/{}", "a".repeat(MAX_PATH_LEN));
        assert_eq!(resolve(dir.path(), &long).unwrap_err(), Status::InternalError);
    }
}
