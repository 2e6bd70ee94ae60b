//! Centralized UTF-16 / ANSI string conversions.
//!
//! Null-terminated strings round-trip through these helpers without byte
//! loss; every wide-string crossing the FFI boundary is built here.

/// Encode a string as a null-terminated UTF-16 buffer.
#[must_use]
pub fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Encode a string as a null-terminated UTF-16 buffer, or `None` when empty.
///
/// Kernel calls that accept an optional name take a null pointer for "no
/// name"; an empty string maps to that case.
#[must_use]
pub fn to_wide_opt(s: &str) -> Option<Vec<u16>> {
    if s.is_empty() {
        None
    } else {
        Some(to_wide(s))
    }
}

/// Decode a UTF-16 buffer up to (and excluding) the first null terminator.
///
/// Unpaired surrogates are replaced with U+FFFD.
#[must_use]
pub fn from_wide(buf: &[u16]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

/// Decode a null-terminated UTF-16 C string from a raw pointer.
///
/// # Safety
///
/// `ptr` must either be null or point to a valid null-terminated UTF-16
/// sequence.
#[must_use]
pub unsafe fn from_wide_ptr(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0usize;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
}

/// Encode a string as a null-terminated ANSI (single byte) buffer.
///
/// Callers are expected to pass ASCII; non-ASCII characters are dropped to
/// their low byte, matching the narrow-character kernel entry points.
#[must_use]
pub fn to_ansi(s: &str) -> Vec<u8> {
    s.bytes().chain(std::iter::once(0)).collect()
}

/// Build a double-null-terminated UTF-16 environment block from `KEY=VALUE`
/// pairs. Returns `None` for an empty list, which tells process creation to
/// inherit the parent environment.
#[must_use]
pub fn environment_block(vars: &[String]) -> Option<Vec<u16>> {
    if vars.is_empty() {
        return None;
    }
    let mut block: Vec<u16> = Vec::new();
    for var in vars {
        block.extend(var.encode_utf16());
        block.push(0);
    }
    block.push(0);
    Some(block)
}

/// Decode a double-null-terminated UTF-16 environment block into its
/// `KEY=VALUE` entries.
///
/// # Safety
///
/// `block` must either be null or point to a valid environment block: a
/// sequence of null-terminated UTF-16 strings closed by an empty string.
#[must_use]
pub unsafe fn environment_block_entries(block: *const u16) -> Vec<String> {
    let mut entries = Vec::new();
    if block.is_null() {
        return entries;
    }
    let mut cursor = block;
    loop {
        let mut len = 0usize;
        while *cursor.add(len) != 0 {
            len += 1;
        }
        if len == 0 {
            return entries;
        }
        entries.push(String::from_utf16_lossy(std::slice::from_raw_parts(
            cursor, len,
        )));
        cursor = cursor.add(len + 1);
    }
}

/// Join a program and its arguments into a single command line using the
/// quoting convention the Microsoft C runtime parses back.
///
/// Arguments containing spaces, tabs, or quotes are wrapped in double quotes;
/// embedded quotes and the backslashes preceding them are escaped.
#[must_use]
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = String::new();
    quote_arg(&mut line, program);
    for arg in args {
        line.push(' ');
        quote_arg(&mut line, arg);
    }
    line
}

fn quote_arg(out: &mut String, arg: &str) {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '\u{b}', '"']) {
        out.push_str(arg);
        return;
    }
    out.push('"');
    let mut backslashes = 0usize;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                // double the run of backslashes, then escape the quote
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                backslashes = 0;
                out.push('"');
                continue;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                backslashes = 0;
            }
        }
        if ch != '\\' {
            out.push(ch);
        }
    }
    // backslashes before the closing quote must be doubled
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_round_trip() {
        for s in ["", "damon", "C:\\Tasks\\job", "snowman \u{2603}", "\u{1F600}"] {
            let wide = to_wide(s);
            assert_eq!(*wide.last().unwrap(), 0);
            assert_eq!(from_wide(&wide), s);
        }
    }

    #[test]
    fn test_from_wide_stops_at_null() {
        let mut buf = to_wide("abc");
        buf.extend_from_slice(&to_wide("junk"));
        assert_eq!(from_wide(&buf), "abc");
    }

    #[test]
    fn test_to_wide_opt_empty_is_none() {
        assert!(to_wide_opt("").is_none());
        assert!(to_wide_opt("x").is_some());
    }

    #[test]
    fn test_from_wide_ptr() {
        let wide = to_wide("registry value");
        let s = unsafe { from_wide_ptr(wide.as_ptr()) };
        assert_eq!(s, "registry value");
        assert_eq!(unsafe { from_wide_ptr(std::ptr::null()) }, "");
    }

    #[test]
    fn test_environment_block_layout() {
        let block = environment_block(&["A=1".to_string(), "B=2".to_string()]).unwrap();
        // entries split on single nulls, block closed by a second null
        assert_eq!(block[3], 0);
        assert_eq!(*block.last().unwrap(), 0);
        assert_eq!(block[block.len() - 2], 0);
        assert!(environment_block(&[]).is_none());
    }

    #[test]
    fn test_environment_block_round_trip() {
        let vars = vec![
            "PATH=C:\\Windows".to_string(),
            "DAMON_TASK=web \u{2603}".to_string(),
        ];
        let block = environment_block(&vars).unwrap();
        let entries = unsafe { environment_block_entries(block.as_ptr()) };
        assert_eq!(entries, vars);
        assert!(unsafe { environment_block_entries(std::ptr::null()) }.is_empty());
    }

    #[test]
    fn test_command_line_plain() {
        let args = vec!["-a".to_string(), "value".to_string()];
        assert_eq!(command_line("worker.exe", &args), "worker.exe -a value");
    }

    #[test]
    fn test_command_line_quoting() {
        let args = vec![
            "C:\\Program Files\\x".to_string(),
            String::new(),
            "say \"hi\"".to_string(),
            "trailing\\".to_string(),
        ];
        assert_eq!(
            command_line("w.exe", &args),
            r#"w.exe "C:\Program Files\x" "" "say \"hi\"" trailing\"#
        );
    }

    #[test]
    fn test_command_line_backslashes_before_quote() {
        let args = vec!["a\\\"b".to_string(), "end\\".to_string()];
        // run of backslashes doubles only when a quote follows
        assert_eq!(command_line("x", &args), r#"x "a\\\"b" end\"#);
    }

    #[test]
    fn test_ansi_null_terminated() {
        assert_eq!(to_ansi("hi"), vec![b'h', b'i', 0]);
        assert_eq!(to_ansi(""), vec![0]);
    }
}
