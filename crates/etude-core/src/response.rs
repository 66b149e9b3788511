// src/response.rs
use crate::buffer::Buffer;
use crate::http::Request;
use crate::syscalls;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::ptr::NonNull;
use std::time::SystemTime;
use tracing::{debug, warn};

/// What the connection needs back from a [`Responder`]: the header block has
/// already been appended to the outbound buffer, `file` is the optional
/// second write segment.
#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    /// `false` when the requested resource did not exist.
    pub found: bool,
    pub file: Option<MappedFile>,
}

/// Builds replies. Runs on worker threads.
pub trait Responder: Send + Sync {
    fn respond(&self, req: &Request, keep_alive: bool, out: &mut Buffer) -> Reply;

    /// Reply for a request that could not be parsed. The connection closes
    /// after it is flushed.
    fn reject(&self, status: u16, out: &mut Buffer) -> Reply;
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Read-only private mapping of a whole file, unmapped on drop.
pub struct MappedFile {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is immutable and owned by exactly one value.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| io::Error::other("file too large to map"))?;
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }
        let ptr = syscalls::mmap_readonly(file.as_raw_fd(), len)?;
        Ok(Self { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping (or a dangling pointer with
        // len 0) for as long as self exists.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe { syscalls::munmap(self.ptr, self.len) };
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile").field("len", &self.len).finish()
    }
}

/// Serves files out of one directory.
///
/// Missing files and directories are 404, files without the world-read bit
/// are 403, and any path with a `..` component is 403. Error statuses serve
/// `/<code>.html` from the same directory when it exists.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let rel = Path::new(path.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        Some(self.root.join(rel))
    }

    fn classify(&self, path: &str) -> u16 {
        let Some(full) = self.resolve(path) else {
            return 403;
        };
        match fs::metadata(&full) {
            Ok(meta) if meta.is_dir() => 404,
            Ok(meta) if meta.permissions().mode() & 0o004 == 0 => 403,
            Ok(_) => 200,
            Err(_) => 404,
        }
    }

    fn build(&self, status: u16, path: &str, keep_alive: bool, out: &mut Buffer) -> Reply {
        let serve = if status == 200 {
            path.to_string()
        } else {
            format!("/{}.html", status)
        };
        let target = self
            .resolve(&serve)
            .filter(|full| status == 200 || full.is_file());

        let _ = write!(out, "HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
        if keep_alive {
            out.append(b"Connection: keep-alive\r\n");
            out.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            out.append(b"Connection: close\r\n");
        }
        let mime = match target {
            Some(_) => mime_guess::from_path(&serve).first_raw().unwrap_or("text/plain"),
            None => "text/html",
        };
        let _ = write!(out, "Content-type: {}\r\n", mime);
        let _ = write!(out, "Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now()));

        match target.map(|full| MappedFile::open(&full)) {
            Some(Ok(file)) => {
                let _ = write!(out, "Content-length: {}\r\n\r\n", file.len());
                debug!(status, path = %serve, bytes = file.len(), "serving file");
                Reply {
                    status,
                    found: status != 404,
                    file: Some(file),
                }
            }
            other => {
                if let Some(Err(e)) = other {
                    warn!(path = %serve, error = %e, "failed to map file");
                }
                let body = error_page(status, "File NotFound!");
                let _ = write!(out, "Content-length: {}\r\n\r\n", body.len());
                out.append(body.as_bytes());
                Reply {
                    status,
                    found: false,
                    file: None,
                }
            }
        }
    }
}

impl Responder for StaticFiles {
    fn respond(&self, req: &Request, keep_alive: bool, out: &mut Buffer) -> Reply {
        let status = self.classify(&req.path);
        self.build(status, &req.path, keep_alive, out)
    }

    fn reject(&self, status: u16, out: &mut Buffer) -> Reply {
        let path = format!("/{}.html", status);
        self.build(status, &path, false, out)
    }
}

fn error_page(status: u16, message: &str) -> String {
    format!(
        "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>etude</em></body></html>",
        status,
        reason_phrase(status),
        message
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;
    use tempfile::TempDir;

    fn site() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        fs::write(dir.path().join("404.html"), "<h1>missing</h1>").unwrap();
        fs::write(dir.path().join("secret.txt"), "top secret").unwrap();
        fs::set_permissions(
            dir.path().join("secret.txt"),
            Permissions::from_mode(0o600),
        )
        .unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        dir
    }

    fn get(path: &str) -> Request {
        Request {
            path: path.to_string(),
            version: "1.1".to_string(),
            ..Request::default()
        }
    }

    fn head_of(out: &mut Buffer) -> String {
        out.retrieve_all_as_string()
    }

    #[test]
    fn serves_existing_file_with_mapping() {
        let dir = site();
        let files = StaticFiles::new(dir.path());
        let mut out = Buffer::new();
        let reply = files.respond(&get("/index.html"), true, &mut out);

        assert_eq!(reply.status, 200);
        assert!(reply.found);
        assert_eq!(reply.file.as_ref().unwrap().as_slice(), b"<h1>home</h1>");

        let head = head_of(&mut out);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.contains("Date: "));
        assert!(head.ends_with("Content-length: 13\r\n\r\n"));
    }

    #[test]
    fn missing_file_serves_error_page() {
        let dir = site();
        let files = StaticFiles::new(dir.path());
        let mut out = Buffer::new();
        let reply = files.respond(&get("/nope.html"), false, &mut out);

        assert_eq!(reply.status, 404);
        assert!(!reply.found);
        assert_eq!(reply.file.as_ref().unwrap().as_slice(), b"<h1>missing</h1>");
        let head = head_of(&mut out);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
    }

    #[test]
    fn directory_is_not_found() {
        let dir = site();
        let files = StaticFiles::new(dir.path());
        let reply = files.respond(&get("/sub"), false, &mut Buffer::new());
        assert_eq!(reply.status, 404);
    }

    #[test]
    fn unreadable_and_traversal_are_forbidden() {
        let dir = site();
        let files = StaticFiles::new(dir.path());
        let mut out = Buffer::new();

        let reply = files.respond(&get("/secret.txt"), false, &mut out);
        assert_eq!(reply.status, 403);
        // no 403.html on disk, so the inline page is used
        assert!(reply.file.is_none());
        let text = head_of(&mut out);
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("File NotFound!"));
        assert!(!text.contains("top secret"));

        let reply = files.respond(&get("/../etc/passwd"), false, &mut out);
        assert_eq!(reply.status, 403);
    }

    #[test]
    fn reject_closes_with_inline_page() {
        let dir = site();
        let files = StaticFiles::new(dir.path());
        let mut out = Buffer::new();
        let reply = files.reject(400, &mut out);
        assert_eq!(reply.status, 400);
        assert!(reply.file.is_none());

        let text = head_of(&mut out);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        let len: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(len, body.len());
    }

    #[test]
    fn empty_file_maps_to_empty_slice() {
        let dir = site();
        fs::write(dir.path().join("empty.txt"), "").unwrap();
        let file = MappedFile::open(&dir.path().join("empty.txt")).unwrap();
        assert!(file.is_empty());
        assert_eq!(file.as_slice(), b"");
    }
}
