use thiserror::Error;

pub type TcResult<T> = Result<T, TcError>;

/// Error kinds produced by the traffic-control reconciler.
///
/// Mirrors the error kinds enumerated in the design: each variant is raised
/// by exactly one unrecoverable anomaly, never by the [`crate::exec::Exec`]
/// gateway itself (it never fails on its own, see its doc comment).
#[derive(Debug, Error)]
pub enum TcError {
    #[error("invalid CIDR: {0}")]
    BadCidr(String),

    #[error("`{program} {args}` failed with status {status}: {output}")]
    ExecFailed {
        program: String,
        args: String,
        status: i32,
        output: String,
    },

    #[error("unexpected output from tc, expected {expected} tokens, got {got}: {line}")]
    UnexpectedOutput {
        expected: String,
        got: usize,
        line: String,
    },

    #[error("exhausted class space on {0}, please try again")]
    ClassSpaceExhausted(String),

    #[error("cidr {cidr} not found on mirror device {mirror}")]
    NotFound { cidr: String, mirror: String },

    #[error("failed to initialize mirror devices: {0}")]
    DeviceInitFailed(String),

    #[error("mirror device teardown incomplete: {0}")]
    TeardownIncomplete(String),

    #[error("no chaos family set in impairment spec")]
    NoChaosSet,

    #[error("invalid impairment spec: {0}")]
    BadImpairmentSpec(String),

    #[error("failed to add impairment qdisc on {mirror} parent {class}: {reason}")]
    QdiscAddFailed {
        mirror: String,
        class: String,
        reason: String,
    },
}

impl TcError {
    pub fn exec_failed(program: &str, args: &[&str], status: i32, output: impl Into<String>) -> Self {
        TcError::ExecFailed {
            program: program.to_string(),
            args: args.join(" "),
            status,
            output: output.into(),
        }
    }
}
