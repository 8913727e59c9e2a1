//! Output naming for downloaded files.
//!
//! A transfer picks its name in this order: whatever the server said in
//! Content-Disposition, else an `Author_Title.ext` template from the
//! candidate metadata, else the last URL segment. Everything funnels
//! through [`safe_filename`] and [`unique_path`] before touching disk.

use std::path::{Path, PathBuf};

/// Substitute name when sanitization leaves nothing usable.
const FALLBACK_NAME: &str = "download.bin";

/// Pulls the filename out of a Content-Disposition header, if any.
///
/// Both parameter forms are understood, with the RFC 5987 extended form
/// taking precedence over the plain one when a header carries both:
///
/// ```text
/// attachment; filename="plain.epub"
/// attachment; filename*=UTF-8''percent%20encoded.epub
/// ```
#[must_use]
pub fn disposition_filename(header: &str) -> Option<String> {
    let mut plain: Option<String> = None;

    for param in header.split(';').skip(1) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key.trim() {
            k if k.eq_ignore_ascii_case("filename*") => {
                // charset'language'percent-encoded; only the payload after
                // the second apostrophe matters
                let payload = value.trim().rsplit('\'').next().unwrap_or_default();
                if let Ok(decoded) = urlencoding::decode(payload) {
                    let name = decoded.trim().trim_matches('"');
                    if !name.is_empty() {
                        return Some(name.to_string());
                    }
                }
            }
            k if k.eq_ignore_ascii_case("filename") => {
                let name = value.trim().trim_matches('"').trim();
                if !name.is_empty() {
                    plain = Some(name.to_string());
                }
            }
            _ => {}
        }
    }

    plain
}

/// Reduces one metadata field to filename-safe words joined by `_`.
///
/// Anything that is not alphanumeric, `-`, or `.` acts as a word break,
/// so runs of punctuation collapse and nothing dangles at the edges.
#[must_use]
pub fn clean_component(value: &str) -> String {
    let words = value
        .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '.'))
        .filter(|word| !word.is_empty());

    let mut cleaned = String::with_capacity(value.len());
    for word in words {
        if !cleaned.is_empty() {
            cleaned.push('_');
        }
        cleaned.push_str(word);
    }
    cleaned
}

/// Makes a full filename safe for the local filesystem.
///
/// Path separators, shell-hostile punctuation, and control characters
/// become `_`; a name that sanitizes away entirely falls back to
/// `download.bin`.
#[must_use]
pub fn safe_filename(name: &str) -> String {
    const BANNED: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_control() || BANNED.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    let meaningful = cleaned.trim_matches(|c: char| matches!(c, '_' | '.' | ' '));
    if meaningful.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned
    }
}

/// Builds the `Author_Title.ext` template filename for a candidate.
///
/// Missing pieces shrink the name; an empty result falls back to
/// `download.<ext>`.
#[must_use]
pub fn template_filename(title: &str, authors: Option<&str>, extension: Option<&str>) -> String {
    let ext = extension
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| "bin".to_string());

    let author = authors
        .and_then(|a| a.split(";;").next())
        .map(clean_component)
        .filter(|a| !a.is_empty());

    let title: String = clean_component(title).chars().take(80).collect();

    match (author, title.is_empty()) {
        (Some(author), false) => format!("{author}_{title}.{ext}"),
        (None, false) => format!("{title}.{ext}"),
        (Some(author), true) => format!("{author}.{ext}"),
        (None, true) => format!("download.{ext}"),
    }
}

/// Joins `dir` and a sanitized `filename`, suffixing `_1`, `_2`, ... past
/// names that already exist on disk.
#[must_use]
pub fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let name = safe_filename(filename);
    let first_choice = dir.join(&name);
    if !first_choice.exists() {
        return first_choice;
    }

    let (stem, ext) = match name.rfind('.') {
        Some(dot) => name.split_at(dot),
        None => (name.as_str(), ""),
    };

    (1..=999)
        .map(|n| dir.join(format!("{stem}_{n}{ext}")))
        .find(|candidate| !candidate.exists())
        // 999 collisions in one directory: disambiguate by process id
        .unwrap_or_else(|| dir.join(format!("{stem}_{}{ext}", std::process::id())))
}
