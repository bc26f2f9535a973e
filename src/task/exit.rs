//! Exit status encoding

use crate::error::CtlError;
use crate::runtime::ExitRecord;

/// Shell-style exit code: the status, or 128+signum for signal deaths
pub fn exit_code(exit: &ExitRecord) -> i32 {
    match exit.signal {
        Some(signal) => 128 + signal,
        None => (exit.status & 0xff) as i32,
    }
}

/// Map a start failure reported by the runtime to 126/127 where the message
/// says the command could not be executed
pub fn classify_start_error(err: CtlError, command: &str) -> CtlError {
    let CtlError::Runtime { message, .. } = &err else {
        return err;
    };
    let lower = message.to_ascii_lowercase();
    if lower.contains("executable file not found") || lower.contains("no such file or directory") {
        CtlError::CommandNotFound(command.to_string())
    } else if lower.contains("permission denied") || lower.contains("is a directory") {
        CtlError::CommandNotExecutable(command.to_string())
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcCode;
    use chrono::Utc;

    #[test]
    fn test_exit_code() {
        let exit = |status, signal| ExitRecord {
            status,
            signal,
            exited_at: Utc::now(),
        };
        assert_eq!(exit_code(&exit(123, None)), 123);
        assert_eq!(exit_code(&exit(137, Some(9))), 137);
        assert_eq!(exit_code(&exit(0, Some(15))), 143);
    }

    #[test]
    fn test_classify_start_error() {
        let err = CtlError::runtime(
            RpcCode::Internal,
            "exec: \"nope\": executable file not found in $PATH",
        );
        assert_eq!(classify_start_error(err, "nope").exit_code(), 127);
        let err = CtlError::runtime(RpcCode::Internal, "exec: \"/etc\": permission denied");
        assert_eq!(classify_start_error(err, "/etc").exit_code(), 126);
        let err = CtlError::runtime(RpcCode::Unavailable, "daemon down");
        assert_eq!(classify_start_error(err, "x").exit_code(), 125);
    }
}
