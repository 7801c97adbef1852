use std::process::Command;

use tracing::trace;

/// Combined stdout+stderr and exit status of a finished child process.
///
/// `tc` routinely prints diagnostics to a non-zero exit ("object already
/// exists" is success for an idempotent add), so the gateway never turns a
/// non-zero status into an error itself -- callers inspect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: String,
    pub status: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// The single substitutable seam for everything that shells out.
#[cfg_attr(any(test, feature = "test-support"), mockall::automock)]
pub trait Exec {
    fn run(&self, program: &str, args: &[&str]) -> ExecOutput;
}

/// Runs real child processes via [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RealExec;

impl Exec for RealExec {
    fn run(&self, program: &str, args: &[&str]) -> ExecOutput {
        let result = Command::new(program).args(args).output();

        match result {
            Ok(out) => {
                let mut combined = out.stdout;
                combined.extend_from_slice(&out.stderr);
                ExecOutput {
                    output: String::from_utf8_lossy(&combined).into_owned(),
                    status: out.status.code().unwrap_or(-1),
                }
            }
            Err(err) => ExecOutput {
                output: err.to_string(),
                status: -1,
            },
        }
    }
}

/// Runs a command and logs its invocation and output at trace level. Call
/// sites that only care whether it succeeded can ignore the returned
/// [`ExecOutput`] and check [`ExecOutput::success`].
pub fn run_logged(exec: &dyn Exec, program: &str, args: &[&str]) -> ExecOutput {
    trace!(program, args = %args.join(" "), "running");
    let out = exec.run(program, args);
    trace!(status = out.status, output = %out.output, "finished");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_exec_runs_true_and_false() {
        let exec = RealExec;
        assert!(exec.run("true", &[]).success());
        assert!(!exec.run("false", &[]).success());
    }

    #[test]
    fn real_exec_missing_binary_reports_nonzero_without_panicking() {
        let exec = RealExec;
        let out = exec.run("this-binary-does-not-exist-xyz", &[]);
        assert!(!out.success());
    }
}
