//! Percent-encoding shared by the session log and the Docker query strings.

fn encode(value: &str, space_as_plus: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' if space_as_plus => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn percent_encode(value: &str) -> String {
    encode(value, false)
}

/// Form-encode `value`: like [`percent_encode`], but spaces become `+`.
pub fn form_encode(value: &str) -> String {
    encode(value, true)
}
