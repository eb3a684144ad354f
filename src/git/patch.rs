//! Added-line extraction from `git diff --unified=0` output

/// One line introduced by a diff
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddedLine {
    pub path: String,
    /// 1-based line number in the new file
    pub line_number: u32,
    pub content: Vec<u8>,
}

fn strip_path(raw: &[u8]) -> Option<String> {
    let raw = trim_line_end(raw);
    if raw == b"/dev/null" {
        return None;
    }
    let text = String::from_utf8_lossy(raw);
    let text = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(&text);
    Some(text.strip_prefix("b/").unwrap_or(text).to_string())
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// `@@ -a,b +c,d @@` -> `c`
fn hunk_new_start(header: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(header).ok()?;
    let plus = text.split_whitespace().find(|part| part.starts_with('+'))?;
    let start = plus[1..].split(',').next()?;
    start.parse().ok()
}

/// Lines added in each file of a patch.
///
/// Deleted files, binary files and removed lines contribute nothing.
pub fn added_lines(patch: &[u8]) -> Vec<AddedLine> {
    let mut lines = Vec::new();
    let mut path: Option<String> = None;
    let mut next_line: u32 = 0;
    let mut in_hunk = false;

    for raw in patch.split(|&b| b == b'\n') {
        if raw.starts_with(b"diff --git ") {
            path = None;
            in_hunk = false;
            continue;
        }
        if !in_hunk {
            if let Some(rest) = raw.strip_prefix(b"+++ ") {
                path = strip_path(rest);
            } else if raw.starts_with(b"@@ ") {
                in_hunk = true;
                next_line = hunk_new_start(raw).unwrap_or(1);
            }
            continue;
        }

        match raw.first() {
            Some(b'@') => next_line = hunk_new_start(raw).unwrap_or(next_line),
            Some(b'+') => {
                if let Some(path) = &path {
                    lines.push(AddedLine {
                        path: path.clone(),
                        line_number: next_line,
                        content: trim_line_end(&raw[1..]).to_vec(),
                    });
                }
                next_line += 1;
            }
            Some(b' ') => next_line += 1,
            _ => {}
        }
    }
    lines
}
