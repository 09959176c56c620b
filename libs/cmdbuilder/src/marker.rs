//! `exit code: N` marker scanning.
//!
//! podman-compose does not propagate the exit code of the commands it runs,
//! but prints `exit code: N` lines. Only the last parsable marker counts.

use crate::CmdError;

const MARKER: &str = "exit code: ";

/// The value of the last parsable `exit code: N` marker in `output`.
pub fn last_exit_code(output: &str) -> Option<i64> {
    output
        .lines()
        .filter_map(|line| {
            let (_, value) = line.split_once(MARKER)?;
            value.trim().parse::<i64>().ok()
        })
        .last()
}

/// Fails iff the last marker carries a non-zero code. No marker is success.
pub fn check_exit_code_marker(output: &str) -> Result<(), CmdError> {
    match last_exit_code(output) {
        Some(code) if code != 0 => Err(CmdError::ExitCode(code)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", None)]
    #[case("nothing to see here\n", None)]
    #[case("exit code: 1\n", Some(1))]
    #[case("exit code: 125\nexit code: 0\n", Some(0))]
    #[case("exit code: 0\npodman start -a app\nexit code: 125\n", Some(125))]
    #[case("exit code: 3\nexit code: not-a-number\n", Some(3))]
    #[case("  prefix text exit code:  7  \n", Some(7))]
    fn test_last_exit_code(#[case] output: &str, #[case] expected: Option<i64>) {
        assert_eq!(last_exit_code(output), expected);
    }

    #[test]
    fn test_later_success_overrides_earlier_failure() {
        let output = "podman create app\nexit code: 125\npodman start app\nexit code: 0\n";
        assert!(check_exit_code_marker(output).is_ok());
    }

    #[test]
    fn test_last_failure_is_reported() {
        let output = "exit code: 0\nexit code: 125\n";
        match check_exit_code_marker(output) {
            Err(CmdError::ExitCode(code)) => assert_eq!(code, 125),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_no_marker_is_success() {
        assert!(check_exit_code_marker("Container app Started\n").is_ok());
    }
}
