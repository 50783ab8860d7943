/// Renders arbitrary bytes as printable ASCII, escaping anything else.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input.escape_ascii().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_control_bytes() {
        assert_eq!(bytes_to_human_str(b"put 1 2\r\n"), "put 1 2\\r\\n");
        assert_eq!(bytes_to_human_str(&[0xff]), "\\xff");
    }
}
