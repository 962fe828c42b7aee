//! Binary-file heuristics for the assistant handler.
//!
//! Assisted conflict resolution only makes sense for text. A file counts as
//! binary when its extension is in a fixed set, or when a sample of its
//! content contains a NUL byte or is dominated by control characters.

use std::collections::HashSet;

use once_cell::sync::Lazy;

/// How many leading bytes of a file are sampled by [`is_binary_content`].
const SAMPLE_LEN: usize = 4096;

static BINARY_EXTENSIONS: &[&str] = &[
    // Images
    "png", "jpg", "jpeg", "gif", "bmp", "tiff", "tif", "webp", "ico", "icns",
    // Audio
    "mp3", "wav", "flac", "aac", "ogg", "m4a", "wma",
    // Video
    "mp4", "avi", "mkv", "mov", "wmv", "flv", "webm", "m4v",
    // Archives
    "zip", "rar", "7z", "tar", "gz", "bz2", "xz", "lz4", "lzma",
    // Executables and libraries
    "exe", "dll", "so", "dylib", "bin", "app", "deb", "rpm", "dmg", "pkg",
    // Office blobs
    "doc", "docx", "xls", "xlsx", "ppt", "pptx", "pdf", "odt", "ods", "odp",
    // Databases
    "db", "sqlite", "sqlite3", "mdb", "accdb",
    // Fonts
    "ttf", "otf", "woff", "woff2", "eot",
    // Compiled artifacts
    "pyc", "class", "jar", "war", "ear", "o", "obj", "lib", "a",
];

static BINARY_EXTENSIONS_SET: Lazy<HashSet<&'static str>> =
    Lazy::new(|| BINARY_EXTENSIONS.iter().copied().collect());

/// Whether the path's extension marks it as binary. The extension is the
/// segment after the last `.`, compared case-insensitively; a name without
/// a dot has no extension.
pub fn is_binary_extension(path: &str) -> bool {
    let ext = match path.rsplit_once('.') {
        Some((_, ext)) => ext.to_lowercase(),
        None => return false,
    };
    BINARY_EXTENSIONS_SET.contains(ext.as_str())
}

/// Whether the leading bytes look like binary data.
///
/// Samples at most [`SAMPLE_LEN`] bytes: any NUL byte means binary, and so
/// does a control-character share above 30%. Tab, LF, VT, FF, and CR do not
/// count as control characters. An empty sample is not binary.
pub fn is_binary_content(bytes: &[u8]) -> bool {
    let sample = &bytes[..bytes.len().min(SAMPLE_LEN)];
    if sample.is_empty() {
        return false;
    }
    if sample.contains(&0) {
        return true;
    }
    let control = sample
        .iter()
        .filter(|&&b| b < 9 || (13 < b && b < 32))
        .count();
    control * 10 > sample.len() * 3
}

/// Combined gate: extension or content says binary.
pub fn is_binary_file(path: &str, content: &[u8]) -> bool {
    is_binary_extension(path) || is_binary_content(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_detection() {
        assert!(is_binary_extension("test.png"));
        assert!(is_binary_extension("archive.tar.gz"));
        assert!(is_binary_extension("program.exe"));
        assert!(is_binary_extension("spreadsheet.xlsx"));

        assert!(!is_binary_extension("code.rs"));
        assert!(!is_binary_extension("text.txt"));
        assert!(!is_binary_extension("config.json"));
        assert!(!is_binary_extension(""));
        assert!(!is_binary_extension("no_extension"));
        assert!(!is_binary_extension("multiple.dots.txt"));
    }

    #[test]
    fn test_dotless_name_matching_an_extension_is_not_binary() {
        // A file named exactly like a binary extension has no extension.
        assert!(!is_binary_extension("zip"));
        assert!(!is_binary_extension("png"));
        assert!(!is_binary_extension("exe"));
        assert!(!is_binary_file("zip", b"plain text\n"));
    }

    #[test]
    fn test_extension_case_insensitive() {
        assert!(is_binary_extension("IMAGE.PNG"));
        assert!(is_binary_extension("Document.PDF"));
        assert!(is_binary_extension("Video.Mp4"));
    }

    #[test]
    fn test_extension_list_consistency() {
        for ext in BINARY_EXTENSIONS {
            let name = format!("test.{}", ext);
            assert!(
                is_binary_extension(&name),
                "extension {} should be detected as binary",
                ext
            );
        }
    }

    #[test]
    fn test_content_text_is_not_binary() {
        assert!(!is_binary_content(b"Hello, world!\nThis is a text file.\n"));
        assert!(!is_binary_content(b""));
        // Whitespace control characters are fine.
        assert!(!is_binary_content(b"col1\tcol2\r\nrow\x0b\x0c"));
        // A full sample of printable bytes is still text.
        let printable = vec![b'A'; SAMPLE_LEN];
        assert!(!is_binary_content(&printable));
    }

    #[test]
    fn test_content_nul_means_binary() {
        assert!(is_binary_content(b"Hello\x00World"));
        let mut text = b"mostly text".to_vec();
        text.push(0);
        assert!(is_binary_content(&text));
    }

    #[test]
    fn test_content_nul_past_sample_is_ignored() {
        let mut bytes = vec![b'A'; SAMPLE_LEN];
        bytes.push(0);
        assert!(!is_binary_content(&bytes));
    }

    #[test]
    fn test_content_control_ratio_boundary() {
        // Exactly 30% control bytes: still text.
        let mut bytes = vec![b'A'; 7];
        bytes.extend(std::iter::repeat(1u8).take(3));
        assert_eq!(bytes.len(), 10);
        assert!(!is_binary_content(&bytes));

        // Above 30%: binary.
        let mut bytes = vec![b'A'; 6];
        bytes.extend(std::iter::repeat(1u8).take(4));
        assert!(is_binary_content(&bytes));
    }

    #[test]
    fn test_combined_gate() {
        assert!(is_binary_file("logo.png", b"plain text"));
        assert!(is_binary_file("data.txt", b"\x00\x01\x02"));
        assert!(!is_binary_file("main.rs", b"fn main() {}\n"));
    }
}
