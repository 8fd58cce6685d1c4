use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use url::Url;

/// Characters that file systems commonly refuse in file names.
const RESERVED: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Map a URL (plus the server-declared content type) to its on-disk location
/// under `output_root`. The mapping is total and deterministic: the same
/// inputs always produce the same path.
///
/// Layout: `output_root/<host>/<path dirs>/<name><ext>`, where extension-less
/// and trailing-slash paths become `index.<ext>` and a non-empty query string
/// appends `__<hash>` to the file name so distinct queries land in distinct
/// files.
pub fn output_path(output_root: &Path, url: &Url, content_type: Option<&str>) -> PathBuf {
    let host = match url.host_str() {
        Some(h) if !h.trim().is_empty() => h.to_string(),
        _ => "unknown-host".to_string(),
    };

    let raw_path = url.path();
    let segs: Vec<&str> = raw_path.split('/').filter(|s| !s.is_empty()).collect();
    let trailing = raw_path.ends_with('/');

    // Decide which segments are directories and what the bare file name is.
    let (dir_segs, bare, url_ext): (&[&str], String, Option<String>) = if segs.is_empty() {
        (&[], "index".to_string(), None)
    } else if trailing {
        (&segs[..], "index".to_string(), None)
    } else {
        let last = segs[segs.len() - 1];
        match last.rfind('.') {
            Some(idx) => {
                let ext = &last[idx..];
                let ext = if ext == "." { ".html" } else { ext };
                (
                    &segs[..segs.len() - 1],
                    sanitize_segment(&last[..idx]),
                    Some(ext.to_string()),
                )
            }
            None => (&segs[..], "index".to_string(), None),
        }
    };

    let extension = match url_ext {
        Some(ext) => ext,
        None => extension_for_content_type(content_type).to_string(),
    };

    let mut name = bare;
    if let Some(query) = url.query() {
        if !query.is_empty() {
            name.push_str("__");
            name.push_str(&query_hash(query));
        }
    }

    let mut path = output_root.join(host);
    for seg in dir_segs {
        path.push(sanitize_segment(seg));
    }
    path.push(format!("{name}{extension}"));
    path
}

/// Replace file-system-reserved characters with `_`. A segment that ends up
/// empty or all-whitespace collapses to a single `_`.
fn sanitize_segment(seg: &str) -> String {
    let cleaned: String = seg
        .chars()
        .map(|c| {
            if RESERVED.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    if cleaned.trim().is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// File extension for a server-declared content type. Parameters after `;`
/// (charset and friends) are ignored; unknown types fall back to `.bin` and a
/// missing header is treated as HTML.
fn extension_for_content_type(content_type: Option<&str>) -> &'static str {
    let Some(raw) = content_type else {
        return ".html";
    };
    let essence = raw.split(';').next().unwrap_or("").trim().to_lowercase();
    match essence.as_str() {
        "text/html" => ".html",
        "application/json" => ".json",
        "application/xml" | "text/xml" => ".xml",
        "text/plain" => ".txt",
        _ => ".bin",
    }
}

/// First 8 bytes of SHA-256 over the raw query string, as lowercase hex.
fn query_hash(query: &str) -> String {
    let digest = Sha256::digest(query.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
