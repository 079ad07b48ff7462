//! Parsers for environment dumps written at the end of a step.
//!
//! Unix shells dump `env` as `KEY=VALUE` lines. PowerShell dumps
//! `Get-ChildItem env:` as a UTF-16 table with a `Name Value` header and a
//! dash ruler, so the Windows parser decodes, drops the table chrome and
//! splits at the first whitespace run.

use flowci_types::VariableStore;

/// Parses `KEY=VALUE` lines, splitting at the first `=`.
pub fn parse_unix_env(content: &str) -> VariableStore {
    let mut vars = VariableStore::new();
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        let Some((key, value)) = line.split_once('=') else { continue };
        if key.is_empty() || key.contains(char::is_whitespace) {
            continue;
        }
        let _ = vars.set(key, value);
    }
    vars
}

/// Parses a PowerShell environment table.
pub fn parse_windows_env(bytes: &[u8]) -> VariableStore {
    let text = decode_utf16(bytes);
    let lines: Vec<&str> = text.lines().map(|line| line.trim_end_matches('\r')).collect();

    let header = lines.iter().position(|line| is_ruler(line)).and_then(|ruler| ruler.checked_sub(1));
    let mut vars = VariableStore::new();
    for (index, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() || is_ruler(line) || Some(index) == header {
            continue;
        }
        let Some((key, value)) = line.split_once(char::is_whitespace) else { continue };
        let _ = vars.set(key, value.trim());
    }
    vars
}

fn is_ruler(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && trimmed.chars().all(|c| c == '-' || c == ' ')
}

fn decode_utf16(bytes: &[u8]) -> String {
    let (body, big_endian) = match bytes {
        [0xFE, 0xFF, rest @ ..] => (rest, true),
        [0xFF, 0xFE, rest @ ..] => (rest, false),
        [0x00, _, ..] => (bytes, true),
        [_, 0x00, ..] => (bytes, false),
        _ => return String::from_utf8_lossy(bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes)).into_owned(),
    };
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| {
            if big_endian {
                u16::from_be_bytes([pair[0], pair[1]])
            } else {
                u16::from_le_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16_be_with_bom(text: &str) -> Vec<u8> {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn unix_splits_at_first_equals() {
        let vars = parse_unix_env("FLOW_A=a=b\nPLAIN\n=nokey\nFLOW_B=\n");
        assert_eq!(vars.get("FLOW_A"), Some("a=b"));
        assert_eq!(vars.get("FLOW_B"), Some(""));
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn windows_strips_bom_header_and_ruler() {
        let table = "\r\nName                           Value\r\n----                           -----\r\nFLOW_VVV                       flowci\r\nPath                           C:\\Windows;C:\\bin\r\n";
        let vars = parse_windows_env(&utf16_be_with_bom(table));
        assert_eq!(vars.get("FLOW_VVV"), Some("flowci"));
        assert_eq!(vars.get("Path"), Some("C:\\Windows;C:\\bin"));
        assert!(vars.get("Name").is_none());
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn windows_accepts_utf8_fallback() {
        let vars = parse_windows_env(b"FLOW_X   1\n");
        assert_eq!(vars.get("FLOW_X"), Some("1"));
    }
}
