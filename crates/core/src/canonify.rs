//! Identifier canonification.

/// Maps every byte that is not ASCII alphanumeric to `_`, yielding a string
/// safe for lock identifiers, class names, and database keys.
pub fn canonify(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::canonify;

    #[test]
    fn test_canonify() {
        assert_eq!(canonify("/usr/bin/true"), "_usr_bin_true");
        assert_eq!(canonify("host-1.example.com"), "host_1_example_com");
        assert_eq!(canonify("plain"), "plain");
        assert_eq!(canonify(""), "");
    }
}
