//! File-backed response handling: safe path resolution, the content
//! cache on the hot path, and directory listings.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};

use crate::cache::{CacheStats, LruCache};
use crate::response::{mime_type, Response, Status};

/// Files at or above this size are refused outright.
const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;
/// Only bodies below this size enter the cache.
const CACHEABLE_LIMIT: u64 = 1024 * 1024;

pub struct FileResponder {
    document_root: PathBuf,
    default_file: String,
    max_file_size: u64,
    cache: Option<LruCache>,
}

impl FileResponder {
    /// `cache_size_bytes` of zero disables caching entirely.
    pub fn new(document_root: impl Into<PathBuf>, default_file: &str, cache_size_bytes: usize, cache_ttl_seconds: i64) -> Self {
        let document_root = document_root.into();
        if let Err(e) = fs::create_dir_all(&document_root) {
            tracing::warn!(
                root = %document_root.display(),
                error = %e,
                "could not create document root"
            );
        }

        let cache = if cache_size_bytes > 0 {
            Some(LruCache::new(cache_size_bytes, cache_ttl_seconds))
        } else {
            None
        };

        Self {
            document_root,
            default_file: default_file.to_string(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            cache,
        }
    }

    /// Override the refusal threshold (tests use a tiny one).
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn document_root(&self) -> &Path {
        &self.document_root
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.as_ref().map(|c| c.stats()).unwrap_or_default()
    }

    pub fn cache_hit_ratio(&self) -> f64 {
        self.cache.as_ref().map(|c| c.hit_ratio()).unwrap_or(0.0)
    }

    /// Serve one already-decoded request path.
    pub fn handle(&self, request_path: &str) -> Response {
        // Lexical containment first: `..` climbing above the root is a
        // policy violation even when nothing exists at the target.
        let Some(relative) = normalize_request_path(request_path) else {
            return Response::error(Status::Forbidden, "Access denied");
        };

        let mut resolved = if relative.as_os_str().is_empty() {
            self.document_root.join(&self.default_file)
        } else {
            self.document_root.join(&relative)
        };

        // Symlink containment: the real path must stay under the real root.
        let canonical_root = match fs::canonicalize(&self.document_root) {
            Ok(root) => root,
            Err(e) => {
                tracing::error!(root = %self.document_root.display(), error = %e, "cannot canonicalize document root");
                return Response::error(Status::InternalServerError, "Internal server error");
            }
        };
        match fs::canonicalize(&resolved) {
            Ok(real) => {
                if !real.starts_with(&canonical_root) {
                    return Response::error(Status::Forbidden, "Access denied");
                }
                resolved = real;
            }
            Err(_) => {
                return Response::error(Status::NotFound, "File not found");
            }
        }

        let mut metadata = match fs::metadata(&resolved) {
            Ok(metadata) => metadata,
            Err(_) => return Response::error(Status::NotFound, "File not found"),
        };

        if metadata.is_dir() {
            let default_path = resolved.join(&self.default_file);
            match fs::metadata(&default_path) {
                Ok(m) if m.is_file() => {
                    resolved = default_path;
                    metadata = m;
                }
                _ => return self.directory_listing(&resolved, request_path),
            }
        }

        if !metadata.is_file() {
            return Response::error(Status::Forbidden, "Not a regular file");
        }

        if metadata.len() > self.max_file_size {
            return Response::error(Status::Forbidden, "File too large");
        }

        self.serve_file(&resolved, metadata.len())
    }

    fn serve_file(&self, path: &Path, len: u64) -> Response {
        let key = path.to_string_lossy().into_owned();

        if let Some(cache) = &self.cache {
            if let Some(entry) = cache.get(&key) {
                let mut response = Response::content(entry.data.to_vec(), &entry.content_type);
                response.set_header("X-Cache", "HIT");
                return response;
            }
        }

        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "file read failed");
                return Response::error(Status::InternalServerError, "Could not read file");
            }
        };

        let extension = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let content_type = mime_type(&extension);

        if let Some(cache) = &self.cache {
            if len < CACHEABLE_LIMIT {
                cache.put(&key, contents.clone(), content_type);
            }
        }

        let mut response = Response::content(contents, content_type);
        response.set_header("X-Cache", "MISS");
        response
    }

    fn directory_listing(&self, dir: &Path, request_path: &str) -> Response {
        let entries = match fs::read_dir(dir) {
            Ok(iter) => {
                let mut entries: Vec<_> = iter.filter_map(|e| e.ok()).collect();
                entries.sort_by_key(|e| {
                    let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
                    (!is_dir, e.file_name())
                });
                entries
            }
            Err(e) => {
                tracing::error!(path = %dir.display(), error = %e, "directory listing failed");
                return Response::error(Status::InternalServerError, "Could not list directory");
            }
        };

        let mut body = String::new();
        body.push_str("<!DOCTYPE html>\n");
        body.push_str(&format!(
            "<html><head><title>Directory listing for {path}</title>\
             <style>\nbody {{ font-family: Arial, sans-serif; margin: 40px; }}\n\
             table {{ border-collapse: collapse; width: 100%; }}\n\
             th, td {{ border: 1px solid #ddd; padding: 8px; text-align: left; }}\n\
             th {{ background-color: #f2f2f2; }}\n\
             a {{ text-decoration: none; color: #0066cc; }}\n\
             </style></head>\n<body>\n<h1>Directory listing for {path}</h1>\n",
            path = request_path
        ));
        body.push_str("<table>\n<tr><th>Name</th><th>Size</th><th>Last Modified</th></tr>\n");

        if request_path != "/" && !request_path.is_empty() {
            let trimmed = request_path.trim_end_matches('/');
            let parent = match trimmed.rfind('/') {
                Some(pos) => &trimmed[..pos + 1],
                None => "/",
            };
            body.push_str(&format!(
                "<tr><td><a href=\"{}\">..</a></td><td>-</td><td>-</td></tr>\n",
                parent
            ));
        }

        for entry in entries {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            let mut link = String::from(request_path.trim_end_matches('/'));
            link.push('/');
            link.push_str(&name);

            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                name.push('/');
                link.push('/');
            }

            let size = if is_dir {
                "-".to_string()
            } else {
                entry
                    .metadata()
                    .map(|m| human_size(m.len()))
                    .unwrap_or_else(|_| "-".to_string())
            };
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(format_modified)
                .unwrap_or_else(|| "-".to_string());

            body.push_str(&format!(
                "<tr><td><a href=\"{link}\">{name}</a></td><td>{size}</td><td>{modified}</td></tr>\n"
            ));
        }

        body.push_str(&format!(
            "</table>\n<hr>\n<p><em>{}</em></p>\n</body></html>\n",
            crate::response::SERVER_NAME
        ));

        let mut response = Response::content(body.into_bytes(), "text/html; charset=utf-8");
        // Listings are regenerated every time, never cached.
        response.set_header("X-Cache", "NONE");
        response
    }
}

/// Normalize a request path into a root-relative path, resolving `.` and
/// `..` lexically. Returns `None` when the path climbs above the root.
fn normalize_request_path(request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.iter().copied().collect())
}

fn human_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

fn format_modified(time: SystemTime) -> String {
    let datetime: DateTime<Local> = time.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn responder_with(files: &[(&str, &str)]) -> (tempfile::TempDir, FileResponder) {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            let mut file = File::create(path).unwrap();
            file.write_all(contents.as_bytes()).unwrap();
        }
        let responder = FileResponder::new(dir.path(), "index.html", 8 * 1024 * 1024, 300);
        (dir, responder)
    }

    fn body_of(response: &Response) -> String {
        let wire = response.to_bytes();
        let text = String::from_utf8_lossy(&wire).into_owned();
        let pos = text.find("\r\n\r\n").unwrap();
        text[pos + 4..].to_string()
    }

    #[test]
    fn serves_an_existing_file() {
        let (_dir, responder) = responder_with(&[("a.txt", "hello")]);
        let response = responder.handle("/a.txt");
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.header("X-Cache"), Some("MISS"));
        assert_eq!(
            response.header("Content-Type"),
            Some("text/plain; charset=utf-8")
        );
        assert_eq!(body_of(&response), "hello");
    }

    #[test]
    fn second_read_hits_the_cache() {
        let (_dir, responder) = responder_with(&[("a.txt", "hello")]);
        responder.handle("/a.txt");
        let response = responder.handle("/a.txt");
        assert_eq!(response.header("X-Cache"), Some("HIT"));
        assert_eq!(body_of(&response), "hello");

        let stats = responder.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn missing_file_is_404() {
        let (_dir, responder) = responder_with(&[]);
        let response = responder.handle("/nope.html");
        assert_eq!(response.status, Status::NotFound);
    }

    #[test]
    fn traversal_is_403() {
        let (_dir, responder) = responder_with(&[("a.txt", "x")]);
        for path in ["/../etc/passwd", "/../../secret", "/a/../../../etc/hosts"] {
            let response = responder.handle(path);
            assert_eq!(response.status, Status::Forbidden, "path {}", path);
            assert_eq!(
                response.header("Content-Type"),
                Some("text/html; charset=utf-8")
            );
        }
    }

    #[test]
    fn dot_segments_inside_root_are_fine() {
        let (_dir, responder) = responder_with(&[("sub/a.txt", "inner")]);
        let response = responder.handle("/sub/../sub/./a.txt");
        assert_eq!(response.status, Status::Ok);
        assert_eq!(body_of(&response), "inner");
    }

    #[test]
    fn symlink_escaping_root_is_403() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "top secret").unwrap();

        let (dir, responder) = responder_with(&[]);
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("link.txt"),
        )
        .unwrap();

        let response = responder.handle("/link.txt");
        assert_eq!(response.status, Status::Forbidden);
    }

    #[test]
    fn empty_path_serves_default_file() {
        let (_dir, responder) = responder_with(&[("index.html", "<h1>home</h1>")]);
        let response = responder.handle("/");
        assert_eq!(response.status, Status::Ok);
        assert_eq!(body_of(&response), "<h1>home</h1>");
    }

    #[test]
    fn directory_with_default_file_serves_it() {
        let (_dir, responder) = responder_with(&[("sub/index.html", "sub home")]);
        let response = responder.handle("/sub");
        assert_eq!(response.status, Status::Ok);
        assert_eq!(body_of(&response), "sub home");
    }

    #[test]
    fn directory_without_default_file_lists_entries() {
        let (_dir, responder) = responder_with(&[("sub/one.txt", "1"), ("sub/two.txt", "22")]);
        let response = responder.handle("/sub");
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.header("X-Cache"), Some("NONE"));
        let body = body_of(&response);
        assert!(body.contains("one.txt"));
        assert!(body.contains("two.txt"));
        assert!(body.contains("Directory listing for /sub"));
    }

    #[test]
    fn oversize_file_is_403() {
        let (dir, _) = responder_with(&[("big.bin", "0123456789abcdef")]);
        let responder = FileResponder::new(dir.path(), "index.html", 1024, 300)
            .with_max_file_size(8);
        let response = responder.handle("/big.bin");
        assert_eq!(response.status, Status::Forbidden);
    }

    #[test]
    fn disabled_cache_reports_zero_stats() {
        let (_dir, responder) = responder_with(&[("a.txt", "hello")]);
        let no_cache = FileResponder::new(responder.document_root(), "index.html", 0, 300);
        no_cache.handle("/a.txt");
        no_cache.handle("/a.txt");
        assert_eq!(no_cache.cache_stats(), CacheStats::default());
    }

    #[test]
    fn human_sizes_scale() {
        assert_eq!(human_size(512), "512.0 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0 MB");
    }
}
