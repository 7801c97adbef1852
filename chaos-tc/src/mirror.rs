//! Lifecycle of the two intermediate (`ifb`) mirror devices that absorb,
//! respectively, the egress and ingress traffic of shaped workloads.

use tracing::{info, warn};

use crate::{
    error::{TcError, TcResult},
    exec::{run_logged, Exec},
};

/// An `ifb<n>` device, named once at boot and threaded everywhere after
/// (never hardcoded at call sites, per the design note against that
/// pattern).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MirrorDevice(pub u8);

impl MirrorDevice {
    pub fn name(&self) -> String {
        format!("ifb{}", self.0)
    }
}

/// Owns the two mirror devices used to shape, respectively, a workload's
/// ingress (device `a`) and egress (device `b`) traffic.
#[derive(Debug, Clone, Copy)]
pub struct MirrorDevices {
    pub a: MirrorDevice,
    pub b: MirrorDevice,
}

const ROOT_TOKENS: [&str; 4] = ["qdisc", "htb", "1:", "root"];

impl MirrorDevices {
    pub fn new(a: u8, b: u8) -> Self {
        MirrorDevices {
            a: MirrorDevice(a),
            b: MirrorDevice(b),
        }
    }

    /// Loads the `ifb` kernel module, brings both devices up, and ensures
    /// each has a root `htb` qdisc at handle `1:` with default class `0`.
    pub fn init(&self, exec: &dyn Exec) -> TcResult<()> {
        run_logged(exec, "modprobe", &["ifb"]);

        run_logged(exec, "ip", &["link", "set", "dev", &self.a.name(), "up"]);
        run_logged(exec, "ip", &["link", "set", "dev", &self.b.name(), "up"]);

        self.init_one(exec, &self.a.name())?;
        self.init_one(exec, &self.b.name())?;

        Ok(())
    }

    fn init_one(&self, exec: &dyn Exec, ifb: &str) -> TcResult<()> {
        let listing = exec.run("tc", &["qdisc", "show", "dev", ifb]);
        if root_htb_present(&listing.output) {
            info!(ifb, "root htb already present, leaving alone");
            return Ok(());
        }

        // Best-effort delete of whatever exists before re-adding.
        run_logged(exec, "tc", &["qdisc", "del", "dev", ifb, "root"]);

        let add = exec.run(
            "tc",
            &["qdisc", "add", "dev", ifb, "root", "handle", "1:", "htb", "default", "0"],
        );
        if !add.success() {
            return Err(TcError::DeviceInitFailed(format!(
                "failed to add root htb on {ifb}: {}",
                add.output
            )));
        }

        Ok(())
    }

    /// Brings both devices down and deletes their root qdisc. Failures
    /// aggregate into [`TcError::TeardownIncomplete`] but every step still
    /// runs.
    pub fn teardown(&self, exec: &dyn Exec) -> TcResult<()> {
        let mut failures = Vec::new();

        for ifb in [self.a.name(), self.b.name()] {
            let down = exec.run("ip", &["link", "set", "dev", &ifb, "down"]);
            if !down.success() {
                failures.push(format!("{ifb}: failed to bring down ({})", down.output));
            }

            let del = exec.run("tc", &["qdisc", "del", "dev", &ifb, "root"]);
            if !del.success() {
                failures.push(format!("{ifb}: failed to delete root qdisc ({})", del.output));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            warn!(failures = failures.join("; "), "mirror device teardown incomplete");
            Err(TcError::TeardownIncomplete(failures.join("; ")))
        }
    }
}

fn root_htb_present(listing: &str) -> bool {
    for line in listing.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() >= ROOT_TOKENS.len() && tokens[..ROOT_TOKENS.len()] == ROOT_TOKENS {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;
    use crate::exec::MockExec;

    #[test]
    fn init_detects_existing_root_and_does_not_readd() {
        let mut mock = MockExec::new();
        mock.expect_run().with(eq("modprobe"), eq(["ifb"].as_slice())).returning(|_, _| {
            crate::exec::ExecOutput { output: String::new(), status: 0 }
        });
        mock.expect_run()
            .with(eq("ip"), mockall::predicate::always())
            .returning(|_, _| crate::exec::ExecOutput { output: String::new(), status: 0 });
        mock.expect_run()
            .with(eq("tc"), eq(["qdisc", "show", "dev", "ifb0"].as_slice()))
            .returning(|_, _| crate::exec::ExecOutput {
                output: "qdisc htb 1: root refcnt 2 r2q 10 default 0 direct_packets_stat 0".into(),
                status: 0,
            });
        mock.expect_run()
            .with(eq("tc"), eq(["qdisc", "show", "dev", "ifb1"].as_slice()))
            .returning(|_, _| crate::exec::ExecOutput {
                output: "qdisc htb 1: root refcnt 2 r2q 10 default 0 direct_packets_stat 0".into(),
                status: 0,
            });
        // No `add`/`del` expectations set: a call to either would panic
        // since mockall defaults to erroring on unexpected invocations.

        let devices = MirrorDevices::new(0, 1);
        devices.init(&mock).unwrap();
    }

    #[test]
    fn init_rebuilds_when_root_missing() {
        let mut mock = MockExec::new();
        mock.expect_run().returning(|program, args| match (program, args) {
            ("tc", ["qdisc", "show", "dev", _]) => crate::exec::ExecOutput {
                output: "qdisc pfifo_fast 0: root refcnt 2 bands 3".into(),
                status: 0,
            },
            ("tc", ["qdisc", "add", ..]) => crate::exec::ExecOutput { output: String::new(), status: 0 },
            _ => crate::exec::ExecOutput { output: String::new(), status: 0 },
        });

        let devices = MirrorDevices::new(0, 1);
        devices.init(&mock).unwrap();
    }

    #[test]
    fn init_fails_device_init_failed_when_add_fails() {
        let mut mock = MockExec::new();
        mock.expect_run().returning(|program, args| match (program, args) {
            ("tc", ["qdisc", "show", "dev", _]) => crate::exec::ExecOutput { output: String::new(), status: 0 },
            ("tc", ["qdisc", "add", ..]) => crate::exec::ExecOutput { output: "RTNETLINK answers: File exists".into(), status: 2 },
            _ => crate::exec::ExecOutput { output: String::new(), status: 0 },
        });

        let devices = MirrorDevices::new(0, 1);
        assert!(matches!(devices.init(&mock), Err(TcError::DeviceInitFailed(_))));
    }

    #[test]
    fn teardown_aggregates_failures_but_runs_every_step() {
        let mut mock = MockExec::new();
        mock.expect_run().returning(|program, _| match program {
            "ip" => crate::exec::ExecOutput { output: "no such device".into(), status: 1 },
            _ => crate::exec::ExecOutput { output: String::new(), status: 0 },
        });

        let devices = MirrorDevices::new(0, 1);
        let result = devices.teardown(&mock);
        assert!(matches!(result, Err(TcError::TeardownIncomplete(_))));
    }
}
