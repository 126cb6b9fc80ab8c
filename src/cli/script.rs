//! Splitting scripts into commands.
//!
//! Commands are separated by `;` or newlines. Separators inside `{...}`
//! groups or double quotes do not split. Lines starting with `#` are comments.
//! The data group of a `set` is opaque, so string payloads may hold any
//! braces or quotes.

use super::error::DispatchError;

pub fn split_commands(script: &str) -> Result<Vec<&str>, DispatchError> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;
    let mut start = 0;
    let mut skip_to = set_data_end(script).unwrap_or(0);

    for (i, c) in script.char_indices() {
        if i < skip_to {
            continue;
        }
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' if depth == 0 => in_quote = !in_quote,
            '{' if !in_quote => depth += 1,
            '}' if !in_quote => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| DispatchError::Parse("unbalanced `}`".to_string()))?;
            }
            ';' | '\n' if depth == 0 && !in_quote => {
                push_command(&mut out, &script[start..i]);
                start = i + 1;
                skip_to = set_data_end(&script[start..]).map_or(0, |end| start + end);
            }
            _ => {}
        }
    }

    if in_quote {
        return Err(DispatchError::Parse("unterminated quote".to_string()));
    }
    if depth != 0 {
        return Err(DispatchError::Parse("missing `}`".to_string()));
    }
    push_command(&mut out, &script[start..]);
    Ok(out)
}

/// Offset just past the `{data}` group when `cmd` starts with a `set`.
///
/// The declared length locates the closing brace. When it does not line up
/// the data ends at the first `}` followed by `;` or the end of the line.
fn set_data_end(cmd: &str) -> Option<usize> {
    let line = &cmd[..cmd.find('\n').unwrap_or(cmd.len())];
    let mut rest = line.trim_start().strip_prefix("set")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let mut len = "";
    for _ in 0..4 {
        let field = rest.trim_start();
        let end = field.find(char::is_whitespace)?;
        len = &field[..end];
        rest = &field[end..];
    }
    let body = rest.trim_start().strip_prefix('{')?;
    let open = line.len() - body.len();

    if let Some(after) = len.parse::<usize>().ok().and_then(|len| body.get(len..)) {
        if after.starts_with('}') {
            return Some(line.len() - after.len() + 1);
        }
    }
    body.match_indices('}')
        .map(|(close, _)| close)
        .find(|&close| {
            let tail = body[close + 1..].trim_start();
            tail.is_empty() || tail.starts_with(';')
        })
        .map(|close| open + close + 1)
}

fn push_command<'a>(out: &mut Vec<&'a str>, cmd: &'a str) {
    let cmd = cmd.trim();
    if !cmd.is_empty() && !cmd.starts_with('#') {
        out.push(cmd);
    }
}

/// Removes one enclosing `{...}` or `"..."` layer, if it spans the whole text
pub fn strip_group(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        return &s[1..s.len() - 1];
    }
    if s.len() >= 2 && s.starts_with('{') && s.ends_with('}') {
        let mut depth = 0usize;
        for (i, c) in s.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 && i != s.len() - 1 {
                        // the first group closes early: `{a} {b}`
                        return s;
                    }
                }
                _ => {}
            }
        }
        return &s[1..s.len() - 1];
    }
    s
}
