//! The shaper: for one host-side virtual interface and one workload
//! address, brings the kernel into the state described in `spec.md` §4.4.

use tracing::{info, instrument, warn, Level};

use crate::{
    cidr,
    error::{TcError, TcResult},
    exec::{run_logged, Exec},
    mirror::MirrorDevice,
    spec::ParsedImpairment,
};

/// Which direction of a workload's traffic is being shaped.
///
/// Ingress traffic of the workload is shaped by mirroring the host
/// interface's *egress* onto mirror device `B`; egress traffic of the
/// workload is shaped by mirroring the host interface's *ingress* onto
/// mirror device `A`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

/// Tested highest settable rate on `tc`, used as the class anchor cap.
const ANCHOR_RATE: &str = "4gbps";
/// Tested bounded pfifo queue length on the host interface's catch-all class.
const PFIFO_LIMIT: &str = "1600";

/// Transient, per-(interface, workload address) reconciliation state. Never
/// persisted across ticks -- all truth is re-derived from kernel state each
/// time `ReconcileMirroring` runs.
#[derive(Debug, Clone)]
pub struct Shaper {
    iface: String,
    mirror_a: MirrorDevice,
    mirror_b: MirrorDevice,
    ingress_class: Option<String>,
    egress_class: Option<String>,
}

impl Shaper {
    pub fn new(iface: impl Into<String>, mirror_a: MirrorDevice, mirror_b: MirrorDevice) -> Self {
        Shaper {
            iface: iface.into(),
            mirror_a,
            mirror_b,
            ingress_class: None,
            egress_class: None,
        }
    }

    fn mirror_for(&self, direction: Direction) -> MirrorDevice {
        match direction {
            Direction::Egress => self.mirror_a,
            Direction::Ingress => self.mirror_b,
        }
    }

    fn class_for(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Egress => self.egress_class.as_deref(),
            Direction::Ingress => self.ingress_class.as_deref(),
        }
    }

    fn set_class_for(&mut self, direction: Direction, class: String) {
        match direction {
            Direction::Egress => self.egress_class = Some(class),
            Direction::Ingress => self.ingress_class = Some(class),
        }
    }

    /// 4.4.1 ReconcileMirroring: ensures the host interface mirrors traffic
    /// in `direction` onto the corresponding mirror device, and that a
    /// unique class on that mirror device is allocated for `cidr`.
    #[instrument(level = Level::DEBUG, skip(self, exec), fields(iface = %self.iface, mirror = %self.mirror_for(direction).name()), err)]
    pub fn reconcile_mirroring(&mut self, exec: &dyn Exec, direction: Direction, cidr: &str) -> TcResult<()> {
        let mirror = self.mirror_for(direction).name();

        let (class, _handle, found) = find_cidr_class(exec, cidr, &mirror)?;

        let exists = if found {
            let exists = class_exists(exec, &class, &mirror)?;
            if !exists {
                info!(mirror, "deleting orphan classifier with no backing class");
                run_logged(exec, "tc", &["filter", "del", "dev", &mirror, "parent", "1:"]);
            }
            exists
        } else {
            false
        };

        if found && exists {
            info!(mirror, class, "mirroring already wired for this address");
            self.set_class_for(direction, class);
            return Ok(());
        }

        self.build_host_mirroring(exec, direction)?;

        let class_id = next_class_id(exec, &mirror)?;
        let classid = format!("1:{class_id}");

        let match_dir = match direction {
            Direction::Egress => "src",
            Direction::Ingress => "dst",
        };

        let filter_add = exec.run(
            "tc",
            &[
                "filter", "add", "dev", &mirror, "parent", "1:0", "protocol", "ip", "prio", "1", "u32", "match", "ip",
                match_dir, cidr, "flowid", &classid,
            ],
        );
        if !filter_add.success() {
            return Err(TcError::exec_failed("tc", &["filter", "add"], filter_add.status, filter_add.output));
        }

        let class_add = exec.run(
            "tc",
            &["class", "add", "dev", &mirror, "parent", "1:", "classid", &classid, "htb", "rate", ANCHOR_RATE],
        );
        if !class_add.success() {
            return Err(TcError::exec_failed("tc", &["class", "add"], class_add.status, class_add.output));
        }

        self.set_class_for(direction, classid);
        Ok(())
    }

    fn build_host_mirroring(&self, exec: &dyn Exec, direction: Direction) -> TcResult<()> {
        let mirror = self.mirror_for(direction).name();

        match direction {
            Direction::Ingress => {
                // Egress of the host interface mirrors the workload's ingress onto B.
                run_logged(exec, "tc", &["qdisc", "del", "dev", &self.iface, "root"]);

                let add_root = exec.run("tc", &["qdisc", "add", "dev", &self.iface, "root", "handle", "1:", "htb", "default", "1"]);
                if !add_root.success() {
                    return Err(TcError::exec_failed("tc", &["qdisc", "add", "root"], add_root.status, add_root.output));
                }

                let add_class = exec.run(
                    "tc",
                    &["class", "add", "dev", &self.iface, "parent", "1:", "classid", "1:1", "htb", "rate", ANCHOR_RATE],
                );
                if !add_class.success() {
                    return Err(TcError::exec_failed("tc", &["class", "add", "1:1"], add_class.status, add_class.output));
                }

                let add_pfifo = exec.run(
                    "tc",
                    &["qdisc", "add", "dev", &self.iface, "parent", "1:1", "handle", "2:1", "pfifo", "limit", PFIFO_LIMIT],
                );
                if !add_pfifo.success() {
                    return Err(TcError::exec_failed("tc", &["qdisc", "add", "pfifo"], add_pfifo.status, add_pfifo.output));
                }

                let add_filter = exec.run(
                    "tc",
                    &[
                        "filter", "add", "dev", &self.iface, "parent", "1:", "protocol", "ip", "prio", "1", "u32", "match", "u32",
                        "0", "0", "flowid", "1:1", "action", "mirred", "egress", "redirect", "dev", &mirror,
                    ],
                );
                if !add_filter.success() {
                    return Err(TcError::exec_failed("tc", &["filter", "add", "mirred"], add_filter.status, add_filter.output));
                }
            }
            Direction::Egress => {
                // Ingress of the host interface mirrors the workload's egress onto A.
                let listing = exec.run("tc", &["qdisc", "show", "dev", &self.iface]);
                let already_has_ingress = listing.output.lines().any(|line| {
                    line.split_whitespace().nth(1) == Some("ingress")
                });

                if !already_has_ingress {
                    let add_ingress = exec.run("tc", &["qdisc", "add", "dev", &self.iface, "ingress"]);
                    if !add_ingress.success() {
                        return Err(TcError::exec_failed("tc", &["qdisc", "add", "ingress"], add_ingress.status, add_ingress.output));
                    }
                }

                let add_filter = exec.run(
                    "tc",
                    &[
                        "filter", "add", "dev", &self.iface, "parent", "ffff:", "protocol", "ip", "prio", "1", "u32", "match",
                        "u32", "0", "0", "flowid", "1:1", "action", "mirred", "egress", "redirect", "dev", &mirror,
                    ],
                );
                if !add_filter.success() {
                    return Err(TcError::exec_failed("tc", &["filter", "add", "mirred"], add_filter.status, add_filter.output));
                }
            }
        }

        Ok(())
    }

    /// 4.4.2 ReconcileInterface: adds the impairment qdisc as a child of the
    /// allocated class on the chosen mirror.
    #[instrument(level = Level::DEBUG, skip(self, exec), err)]
    pub fn reconcile_interface(&self, exec: &dyn Exec, direction: Direction) -> TcResult<()> {
        let mirror = self.mirror_for(direction).name();
        let class = self
            .class_for(direction)
            .ok_or_else(|| TcError::NotFound { cidr: String::new(), mirror: mirror.clone() })?
            .to_string();

        let add = exec.run("tc", &["qdisc", "add", "dev", &mirror, "parent", &class, "netem"]);
        if !add.success() {
            return Err(TcError::QdiscAddFailed { mirror, class, reason: add.output });
        }

        Ok(())
    }

    /// 4.4.3 ReconcileCIDR: contract operation, no kernel mutation.
    pub fn reconcile_cidr(&self, direction: Direction, cidr: &str, impairment: &ParsedImpairment) {
        info!(?direction, cidr, rate = impairment.rate(), "reconciled cidr association");
    }

    /// 4.4.4 ExecTcChaos: changes the class rate, then the impairment in
    /// priority order delay -> loss -> duplicate -> reorder -> corrupt.
    #[instrument(level = Level::DEBUG, skip(self, exec, impairment), err)]
    pub fn exec_tc_chaos(&self, exec: &dyn Exec, direction: Direction, impairment: &ParsedImpairment) -> TcResult<()> {
        let mirror = self.mirror_for(direction).name();
        let class = self
            .class_for(direction)
            .ok_or_else(|| TcError::NotFound { cidr: String::new(), mirror: mirror.clone() })?
            .to_string();

        let rate = if impairment.rate().is_empty() { ANCHOR_RATE } else { impairment.rate() };
        run_logged(exec, "tc", &["class", "change", "dev", &mirror, "parent", "1:", "classid", &class, "htb", "rate", rate]);

        let netem_args = impairment.netem_args()?;
        let mut cmd: Vec<&str> = vec!["qdisc", "change", "dev", &mirror, "parent", &class, "netem"];
        cmd.extend(netem_args.iter().map(String::as_str));

        let result = exec.run("tc", &cmd);
        if !result.success() {
            return Err(TcError::exec_failed("tc", &cmd, result.status, result.output));
        }

        Ok(())
    }

    /// 4.4.5 ClearInterface: deletes the impairment qdisc. Idempotent --
    /// ignores errors.
    pub fn clear_interface(&self, exec: &dyn Exec, direction: Direction) {
        let mirror = self.mirror_for(direction).name();
        if let Some(class) = self.class_for(direction) {
            run_logged(exec, "tc", &["qdisc", "del", "dev", &mirror, "parent", class]);
        }
    }

    /// 4.4.5 ClearMirroring: removes the mirroring wiring on the host
    /// interface.
    pub fn clear_mirroring(exec: &dyn Exec, iface: &str, direction: Direction) {
        match direction {
            Direction::Ingress => {
                let out = exec.run("tc", &["qdisc", "del", "dev", iface, "root"]);
                if !out.success() {
                    warn!(iface, output = %out.output, "failed to clear ingress mirroring root qdisc");
                }
            }
            Direction::Egress => {
                let out = exec.run("tc", &["qdisc", "del", "dev", iface, "ingress"]);
                if !out.success() {
                    warn!(iface, output = %out.output, "failed to clear egress mirroring ingress qdisc");
                }
            }
        }
    }
}

/// 4.4.6 nextClassID.
pub fn next_class_id(exec: &dyn Exec, mirror: &str) -> TcResult<u32> {
    let listing = exec.run("tc", &["class", "show", "dev", mirror]);
    let mut used = std::collections::HashSet::new();

    for line in listing.output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split(' ').collect();
        if tokens.len() != 14 && tokens.len() != 16 {
            return Err(TcError::UnexpectedOutput { expected: "14 or 16".into(), got: tokens.len(), line: line.to_string() });
        }
        used.insert(tokens[2].to_string());
    }

    for candidate in 1..10000u32 {
        if !used.contains(&format!("1:{candidate}")) {
            return Ok(candidate);
        }
    }

    Err(TcError::ClassSpaceExhausted(mirror.to_string()))
}

fn class_exists(exec: &dyn Exec, classid: &str, mirror: &str) -> TcResult<bool> {
    let listing = exec.run("tc", &["class", "show", "dev", mirror]);
    for line in listing.output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split(' ').collect();
        if let Some(&id) = tokens.get(2) {
            if id == classid {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// 4.4.7 findCIDRClass.
pub fn find_cidr_class(exec: &dyn Exec, cidr: &str, mirror: &str) -> TcResult<(String, String, bool)> {
    let listing = exec.run("tc", &["filter", "show", "dev", mirror]);
    let hex = cidr::to_hex(cidr)?;
    let spec = format!("match {hex}");

    let mut header = String::new();
    for line in listing.output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("filter") {
            header = line.to_string();
            continue;
        }
        if line.contains(&spec) {
            let tokens: Vec<&str> = header.split(' ').collect();
            if tokens.len() != 19 {
                return Err(TcError::UnexpectedOutput { expected: "19".into(), got: tokens.len(), line: header });
            }
            return Ok((tokens[18].to_string(), tokens[9].to_string(), true));
        }
    }

    Ok((String::new(), String::new(), false))
}

/// Lists every workload address currently backed by a classifier on
/// `mirror`, used by the fleet reconciler's garbage-collection pass.
pub fn list_cidrs(exec: &dyn Exec, mirror: &str) -> TcResult<Vec<String>> {
    let listing = exec.run("tc", &["filter", "show", "dev", mirror]);
    let mut cidrs = Vec::new();

    for line in listing.output.lines() {
        let line = line.trim();
        if !line.starts_with("match ") {
            continue;
        }

        let tokens: Vec<&str> = line.split(' ').collect();
        if tokens.len() != 4 {
            return Err(TcError::UnexpectedOutput { expected: "4".into(), got: tokens.len(), line: line.to_string() });
        }

        cidrs.push(cidr::to_ascii(tokens[1])?);
    }

    Ok(cidrs)
}

/// 4.4.8 Reset: removes the classifier and class backing `cidr` on `mirror`.
#[instrument(level = Level::DEBUG, skip(exec), err)]
pub fn reset(exec: &dyn Exec, cidr: &str, mirror: &str) -> TcResult<()> {
    let (class, handle, found) = find_cidr_class(exec, cidr, mirror)?;
    if !found {
        return Err(TcError::NotFound { cidr: cidr.to_string(), mirror: mirror.to_string() });
    }

    let del_filter = exec.run("tc", &["filter", "del", "dev", mirror, "parent", "1:", "proto", "ip", "prio", "1", "handle", &handle, "u32"]);
    if !del_filter.success() {
        return Err(TcError::exec_failed("tc", &["filter", "del"], del_filter.status, del_filter.output));
    }

    let del_class = exec.run("tc", &["class", "del", "dev", mirror, "parent", "1:", "classid", &class]);
    if !del_class.success() {
        return Err(TcError::exec_failed("tc", &["class", "del"], del_class.status, del_class.output));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use mockall::predicate::*;

    use super::*;
    use crate::exec::{ExecOutput, MockExec};

    fn ok(output: &str) -> ExecOutput {
        ExecOutput { output: output.to_string(), status: 0 }
    }

    #[test]
    fn next_class_id_skips_used_classes() {
        let mut mock = MockExec::new();
        mock.expect_run().with(eq("tc"), eq(["class", "show", "dev", "ifb0"].as_slice())).returning(|_, _| {
            ok("class htb 1:1 root leaf 8001: prio 0 rate 4000000Kbit ceil 4000000Kbit burst 1600b cburst 1600b\nclass htb 1:2 root leaf 8002: prio 0 rate 4000000Kbit ceil 4000000Kbit burst 1600b cburst 1600b")
        });

        let id = next_class_id(&mock, "ifb0").unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn next_class_id_rejects_unexpected_token_count() {
        let mut mock = MockExec::new();
        mock.expect_run().returning(|_, _| ok("class htb weird line with too few tokens"));

        assert!(matches!(next_class_id(&mock, "ifb0"), Err(TcError::UnexpectedOutput { .. })));
    }

    #[test]
    fn find_cidr_class_parses_header_and_match_pair() {
        let mut mock = MockExec::new();
        mock.expect_run().returning(|_, _| {
            ok("filter parent 1: protocol ip pref 1 u32 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1:7\n  match 0a000005/ffffffff at 16")
        });

        let (class, handle, found) = find_cidr_class(&mock, "10.0.0.5/32", "ifb0").unwrap();
        assert!(found);
        assert_eq!(class, "1:7");
        assert_eq!(handle, "800::800");
    }

    #[test]
    fn find_cidr_class_not_found_returns_false() {
        let mut mock = MockExec::new();
        mock.expect_run().returning(|_, _| ok(""));

        let (_, _, found) = find_cidr_class(&mock, "10.0.0.5/32", "ifb0").unwrap();
        assert!(!found);
    }

    #[test]
    fn reset_deletes_filter_then_class() {
        let mut mock = MockExec::new();
        mock.expect_run()
            .with(eq("tc"), eq(["filter", "show", "dev", "ifb0"].as_slice()))
            .returning(|_, _| ok("filter parent 1: protocol ip pref 1 u32 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1:7\n  match 0a000005/ffffffff at 16"));
        mock.expect_run()
            .with(eq("tc"), function(|args: &[&str]| args.first() == Some(&"filter") && args.get(1) == Some(&"del")))
            .returning(|_, _| ok(""));
        mock.expect_run()
            .with(eq("tc"), function(|args: &[&str]| args.first() == Some(&"class") && args.get(1) == Some(&"del")))
            .returning(|_, _| ok(""));

        reset(&mock, "10.0.0.5/32", "ifb0").unwrap();
    }

    #[test]
    fn reset_not_found_fails() {
        let mut mock = MockExec::new();
        mock.expect_run().returning(|_, _| ok(""));

        assert!(matches!(reset(&mock, "10.0.0.5/32", "ifb0"), Err(TcError::NotFound { .. })));
    }

    #[test]
    fn list_cidrs_collects_every_match_line() {
        let mut mock = MockExec::new();
        mock.expect_run().returning(|_, _| {
            ok("filter parent 1: protocol ip pref 1 u32 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1:7\n  match 0a000005/ffffffff at 16\nfilter parent 1: protocol ip pref 1 u32 fh 800::801 order 2049 key ht 800 bkt 0 flowid 1:8\n  match 0a000006/ffffffff at 16")
        });

        let cidrs = list_cidrs(&mock, "ifb0").unwrap();
        assert_eq!(cidrs, vec!["10.0.0.5/32", "10.0.0.6/32"]);
    }

    #[test]
    fn list_cidrs_rejects_unexpected_token_count() {
        let mut mock = MockExec::new();
        mock.expect_run().returning(|_, _| {
            ok("filter parent 1: protocol ip pref 1 u32 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1:7\n  match 0a000005/ffffffff extra at 16")
        });

        assert!(matches!(list_cidrs(&mock, "ifb0"), Err(TcError::UnexpectedOutput { .. })));
    }

    #[test]
    fn exec_tc_chaos_rate_defaults_when_empty() {
        let mut mock = MockExec::new();
        mock.expect_run()
            .with(eq("tc"), function(|args: &[&str]| args.contains(&"4gbps")))
            .times(1)
            .returning(|_, _| ok(""));
        mock.expect_run()
            .with(eq("tc"), function(|args: &[&str]| args.contains(&"netem")))
            .returning(|_, _| ok(""));

        let mut shaper = Shaper::new("cali1234", MirrorDevice(0), MirrorDevice(1));
        shaper.set_class_for(Direction::Egress, "1:3".to_string());

        let impairment = ParsedImpairment::parse(",delay,100ms,10ms").unwrap();
        shaper.exec_tc_chaos(&mock, Direction::Egress, &impairment).unwrap();
    }
}
