//! Common utilities shared by the harness and the CLI

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};

/// Render captured bytes for humans, truncating very long captures
///
/// Keeps the last `limit` bytes, which is where failures usually show up.
pub fn lossy_tail(bytes: &[u8], limit: usize) -> String {
    if bytes.len() <= limit {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let start = bytes.len() - limit;
    format!(
        "...[{} bytes omitted]...{}",
        start,
        String::from_utf8_lossy(&bytes[start..])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lossy_tail() {
        assert_eq!(lossy_tail(b"short", 10), "short");
        assert_eq!(lossy_tail(b"0123456789", 4), "...[6 bytes omitted]...6789");
    }
}
