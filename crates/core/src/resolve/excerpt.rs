//! Conflict-marker scanning and excerpt rendering.
//!
//! The assistant never receives whole files; it gets the conflicted regions
//! with a few lines of surrounding context. Regions are delimited by the
//! standard `<<<<<<<` / `>>>>>>>` marker lines; whatever sits between them
//! (including a diff3 `|||||||` base) is carried verbatim.

/// Lines of context included around each conflict region.
const CONTEXT_LINES: usize = 8;

/// One marker-delimited conflict region, as zero-based line indices of the
/// opening and closing marker lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRegion {
    pub start_line: usize,
    pub end_line: usize,
}

/// Scan for conflict regions. An opening marker without its closing
/// counterpart is dropped rather than treated as a region to the end of
/// the file.
pub fn conflict_regions(text: &str) -> Vec<ConflictRegion> {
    let mut regions = Vec::new();
    let mut open: Option<usize> = None;

    for (idx, line) in text.lines().enumerate() {
        if line.starts_with("<<<<<<<") && open.is_none() {
            open = Some(idx);
        } else if line.starts_with(">>>>>>>") {
            if let Some(start_line) = open.take() {
                regions.push(ConflictRegion {
                    start_line,
                    end_line: idx,
                });
            }
        }
    }
    regions
}

/// Render the excerpt handed to the assistant: every conflict region with
/// context, headed by the file name. `None` when the text has no regions.
pub fn build_excerpt(path: &str, content: &str) -> Option<String> {
    let regions = conflict_regions(content);
    if regions.is_empty() {
        return None;
    }

    let lines: Vec<&str> = content.lines().collect();
    let windows = merge_windows(&regions, lines.len());

    let mut excerpt = format!("File: {}\n", path);
    for (start, end) in windows {
        excerpt.push('\n');
        excerpt.push_str(&format!("@@ lines {}-{} @@\n", start + 1, end + 1));
        for line in &lines[start..=end] {
            excerpt.push_str(line);
            excerpt.push('\n');
        }
    }
    Some(excerpt)
}

/// Expand each region by the context margin and merge overlaps, yielding
/// inclusive `(start, end)` line windows in order.
fn merge_windows(regions: &[ConflictRegion], line_count: usize) -> Vec<(usize, usize)> {
    let last_line = line_count.saturating_sub(1);
    let mut windows: Vec<(usize, usize)> = Vec::new();

    for region in regions {
        let start = region.start_line.saturating_sub(CONTEXT_LINES);
        let end = (region.end_line + CONTEXT_LINES).min(last_line);
        match windows.last_mut() {
            Some((_, prev_end)) if start <= *prev_end + 1 => {
                *prev_end = (*prev_end).max(end);
            }
            _ => windows.push((start, end)),
        }
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflicted(pad_before: usize, pad_after: usize) -> String {
        let mut text = String::new();
        for i in 0..pad_before {
            text.push_str(&format!("before {}\n", i));
        }
        text.push_str("<<<<<<< HEAD\nours line\n=======\ntheirs line\n>>>>>>> abc1234\n");
        for i in 0..pad_after {
            text.push_str(&format!("after {}\n", i));
        }
        text
    }

    #[test]
    fn test_no_markers_yields_none() {
        assert!(build_excerpt("a.txt", "plain\ntext\n").is_none());
        assert!(conflict_regions("plain\ntext\n").is_empty());
    }

    #[test]
    fn test_single_region() {
        let text = conflicted(20, 20);
        let regions = conflict_regions(&text);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start_line, 20);
        assert_eq!(regions[0].end_line, 24);

        let excerpt = build_excerpt("src/app.c", &text).unwrap();
        assert!(excerpt.starts_with("File: src/app.c\n"));
        // 8 lines of context each side, 1-based header.
        assert!(excerpt.contains("@@ lines 13-33 @@"));
        assert!(excerpt.contains("<<<<<<< HEAD"));
        assert!(excerpt.contains("ours line"));
        assert!(excerpt.contains("theirs line"));
        assert!(excerpt.contains(">>>>>>> abc1234"));
        assert!(!excerpt.contains("before 10"));
        assert!(excerpt.contains("before 12"));
    }

    #[test]
    fn test_region_at_top_of_file() {
        let text = conflicted(0, 3);
        let excerpt = build_excerpt("a.txt", &text).unwrap();
        assert!(excerpt.contains("@@ lines 1-"));
    }

    #[test]
    fn test_diff3_base_is_carried() {
        let text = "<<<<<<< HEAD\nours\n||||||| merged common ancestors\nbase\n=======\ntheirs\n>>>>>>> pick\n";
        let excerpt = build_excerpt("a.txt", text).unwrap();
        assert!(excerpt.contains("||||||| merged common ancestors"));
        assert!(excerpt.contains("base"));
    }

    #[test]
    fn test_adjacent_regions_share_a_window() {
        let mut text = conflicted(0, 2);
        text.push_str("<<<<<<< HEAD\nours2\n=======\ntheirs2\n>>>>>>> def5678\n");
        let excerpt = build_excerpt("a.txt", &text).unwrap();
        assert_eq!(excerpt.matches("@@ lines").count(), 1);
        assert!(excerpt.contains("ours2"));
    }

    #[test]
    fn test_distant_regions_get_separate_windows() {
        let mut text = conflicted(0, 40);
        text.push_str("<<<<<<< HEAD\nours2\n=======\ntheirs2\n>>>>>>> def5678\n");
        let excerpt = build_excerpt("a.txt", &text).unwrap();
        assert_eq!(excerpt.matches("@@ lines").count(), 2);
    }

    #[test]
    fn test_unclosed_region_is_dropped() {
        let text = "<<<<<<< HEAD\nours only\n=======\nno closer\n";
        assert!(conflict_regions(text).is_empty());
        assert!(build_excerpt("a.txt", text).is_none());
    }
}
