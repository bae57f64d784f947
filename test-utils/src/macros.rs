//! Test macros for common assertion patterns

/// Assert a `Result` is an error whose display text mentions `$expected`
#[macro_export]
macro_rules! assert_error_contains {
    ($result:expr, $expected:expr) => {{
        match $result {
            Ok(_) => panic!("expected an error mentioning '{}', got Ok", $expected),
            Err(err) => {
                let text = err.to_string();
                assert!(
                    text.contains($expected),
                    "error '{}' does not mention '{}'",
                    text,
                    $expected
                );
            }
        }
    }};
}

/// Assert the sequence of wire commands sent to a peer, e.g.
/// `assert_commands!(transport, peer, ["getheaders", "getdata"])`.
#[macro_export]
macro_rules! assert_commands {
    ($transport:expr, $peer:expr, [$($command:expr),* $(,)?]) => {{
        let actual: Vec<&str> = $transport.commands_to($peer).into_iter().collect();
        let expected: Vec<&str> = vec![$($command),*];
        assert_eq!(actual, expected, "Unexpected commands sent to peer {}", $peer);
    }};
}

#[cfg(test)]
mod tests {
    struct Recorder(Vec<(u8, &'static str)>);

    impl Recorder {
        fn commands_to(&self, peer: u8) -> Vec<&'static str> {
            self.0.iter().filter(|(to, _)| *to == peer).map(|(_, c)| *c).collect()
        }
    }

    #[test]
    fn test_error_contains_macro() {
        let result: Result<(), String> = Err("peer 7 is not registered".to_string());
        assert_error_contains!(result, "not registered");
    }

    #[test]
    #[should_panic(expected = "expected an error")]
    fn test_error_contains_macro_with_ok() {
        let result: Result<i32, String> = Ok(42);
        assert_error_contains!(result, "anything");
    }

    #[test]
    fn test_commands_macro() {
        let recorder = Recorder(vec![(1, "getheaders"), (2, "inv"), (1, "getdata")]);
        assert_commands!(recorder, 1, ["getheaders", "getdata"]);
        assert_commands!(recorder, 3, []);
    }
}
