// Slice-based STOMP frame parser (produces owned Vecs from input slices)

/// A frame split into its raw parts, before command lookup and header
/// unescaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
    /// Number of input bytes the frame occupied, including the NUL and an
    /// optional trailing LF.
    pub consumed: usize,
}

type ParseResult = Result<Option<RawFrame>, String>;

/// Extract the optional content-length header value from a header list.
///
/// Returns:
/// - Ok(Some(n)) when a valid content-length header is present and parsed.
/// - Ok(None) when no content-length header is present.
/// - Err(String) when content-length is present but not a valid unsigned integer.
fn get_content_length(headers: &[(Vec<u8>, Vec<u8>)]) -> Result<Option<usize>, String> {
    let Some((_, v)) = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(&b"content-length"[..]))
    else {
        return Ok(None);
    };
    let s = std::str::from_utf8(v).map_err(|e| format!("content-length not utf8: {}", e))?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err("empty content-length".to_string());
    }
    trimmed
        .parse::<usize>()
        .map(Some)
        .map_err(|e| format!("invalid content-length '{}': {}", trimmed, e))
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

/// Parse a single STOMP frame from the start of `input`.
///
/// Returns `Ok(Some(frame))` when a complete frame was found, `Ok(None)` when
/// `input` ends before the frame does, and `Err` on a protocol error (a header
/// line without a colon, a bad `content-length`, a missing NUL after a
/// length-delimited body).
///
/// Leading LFs (heart-beats) are skipped and counted in `consumed`; callers
/// that care about heart-beats must check for them first.
pub fn parse_frame_slice(input: &[u8]) -> ParseResult {
    let len = input.len();
    let mut pos = 0usize;

    while pos < len && (input[pos] == b'\n' || input[pos] == b'\r') {
        pos += 1;
    }
    if pos == len {
        return Ok(None);
    }

    // command line
    let Some(cmd_end_rel) = input[pos..].iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let command = strip_cr(&input[pos..pos + cmd_end_rel]).to_vec();
    pos += cmd_end_rel + 1;

    // headers until an empty line
    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    loop {
        if pos >= len {
            return Ok(None);
        }
        if input[pos] == b'\n' {
            pos += 1;
            break;
        }
        if input[pos] == b'\r' && pos + 1 < len && input[pos + 1] == b'\n' {
            pos += 2;
            break;
        }
        let Some(line_end_rel) = input[pos..].iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = strip_cr(&input[pos..pos + line_end_rel]);
        // escaped colons travel as `\c`, so the first raw colon is the separator
        match line.iter().position(|&b| b == b':') {
            Some(colon) => headers.push((line[..colon].to_vec(), line[colon + 1..].to_vec())),
            None => {
                return Err(format!(
                    "malformed header line: {:?}",
                    String::from_utf8_lossy(line)
                ));
            }
        }
        pos += line_end_rel + 1;
    }

    let body = match get_content_length(&headers)? {
        Some(content_len) => {
            if content_len >= len - pos {
                return Ok(None);
            }
            let body = input[pos..pos + content_len].to_vec();
            pos += content_len;
            if input[pos] != 0 {
                return Err("missing NUL terminator after content-length body".to_string());
            }
            pos += 1;
            body
        }
        None => {
            let Some(nul_rel) = input[pos..].iter().position(|&b| b == 0) else {
                return Ok(None);
            };
            let body = input[pos..pos + nul_rel].to_vec();
            pos += nul_rel + 1;
            body
        }
    };

    // optional trailing EOL
    if pos < len && input[pos] == b'\n' {
        pos += 1;
    } else if pos + 1 < len && input[pos] == b'\r' && input[pos + 1] == b'\n' {
        pos += 2;
    }

    Ok(Some(RawFrame {
        command,
        headers,
        body,
        consumed: pos,
    }))
}

/// Undo STOMP 1.2 header escaping.
///
/// `\\` → backslash, `\n` → LF, `\r` → CR, `\c` → colon. Any other escape,
/// or a trailing lone backslash, is an error.
pub fn unescape_header_value(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b'c') => out.push(b':'),
            Some(&other) => {
                return Err(format!("invalid escape sequence '\\{}'", other as char));
            }
            None => return Err("trailing backslash in header".to_string()),
        }
    }
    Ok(out)
}
