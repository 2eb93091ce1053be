pub mod rdns;

pub use rdns::*;

/// Sanitize a string for safe terminal display by removing control characters.
///
/// Reverse DNS answers are remote-controlled text and could otherwise carry
/// terminal escape sequences.
pub(crate) fn sanitize_display(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_display_strips_escapes() {
        assert_eq!(sanitize_display("host\x1b[31m.example"), "host[31m.example");
        assert_eq!(sanitize_display("plain.example.net"), "plain.example.net");
    }
}
