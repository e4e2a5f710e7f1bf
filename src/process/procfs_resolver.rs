use super::resolver::{select_candidate, Candidate, ProcessResolver, TargetProcess, TargetSelector};
use crate::{Result, TracerError};
use procfs::process::{all_processes, Process};
use tracing::debug;

/// Bound on the parent walk, in case `/proc` hands us a cycle.
const MAX_ANCESTORS: usize = 64;

/// Resolves targets by scanning `/proc`.
pub struct ProcfsResolver {
    /// Our PID followed by our ancestors, nearest first.
    excluded_pids: Vec<u32>,
    own_command: Option<String>,
}

impl ProcfsResolver {
    pub fn new() -> Self {
        let own_command = Process::myself()
            .and_then(|p| p.stat())
            .map(|stat| stat.comm)
            .ok();
        Self {
            excluded_pids: lineage(std::process::id()),
            own_command,
        }
    }

    fn resolve_pid(&self, pid: u32) -> Result<TargetProcess> {
        let stat = Process::new(pid as i32)
            .and_then(|p| p.stat())
            .map_err(|e| TracerError::ProcessNotFound(format!("pid {}: {}", pid, e)))?;

        if stat.state == 'Z' {
            return Err(TracerError::ProcessNotFound(format!("pid {} is a zombie", pid)));
        }
        Ok(TargetProcess::new(pid, stat.comm, stat.starttime))
    }

    fn resolve_name(&self, pattern: &str) -> Result<TargetProcess> {
        let processes = all_processes()
            .map_err(|e| TracerError::ProcessNotFound(format!("cannot list processes: {}", e)))?;

        let candidates = processes.filter_map(|process| {
            // Processes exit mid-scan; skip whatever we can no longer read
            let process = process.ok()?;
            let stat = process.stat().ok()?;
            if stat.state == 'Z' {
                return None;
            }
            let cmdline = process.cmdline().ok()?.join(" ");
            Some(Candidate {
                pid: process.pid as u32,
                command_name: stat.comm,
                cmdline,
                start_time: stat.starttime,
            })
        });

        let picked = select_candidate(
            candidates,
            pattern,
            &self.excluded_pids,
            self.own_command.as_deref(),
        )
        .ok_or_else(|| TracerError::ProcessNotFound(format!("no process matching '{}'", pattern)))?;

        debug!(pid = picked.pid, command = %picked.command_name, "matched target");
        Ok(TargetProcess::new(
            picked.pid,
            picked.command_name,
            picked.start_time,
        ))
    }
}

/// `pid` and every ancestor up to (not including) init.
fn lineage(pid: u32) -> Vec<u32> {
    let mut pids = vec![pid];
    let mut current = pid;
    while pids.len() < MAX_ANCESTORS {
        let parent = match Process::new(current as i32).and_then(|p| p.stat()) {
            Ok(stat) => stat.ppid,
            Err(e) => {
                debug!(pid = current, error = %e, "stopped walking process ancestry");
                break;
            }
        };
        if parent <= 1 || pids.contains(&(parent as u32)) {
            break;
        }
        current = parent as u32;
        pids.push(current);
    }
    pids
}

impl Default for ProcfsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessResolver for ProcfsResolver {
    fn resolve(&self, selector: &TargetSelector) -> Result<TargetProcess> {
        match selector {
            TargetSelector::Pid(pid) => self.resolve_pid(*pid),
            TargetSelector::Name(pattern) => self.resolve_name(pattern),
        }
    }

    fn is_alive(&self, target: &TargetProcess) -> bool {
        match Process::new(target.pid as i32).and_then(|p| p.stat()) {
            Ok(stat) => stat.state != 'Z' && stat.starttime == target.start_time,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_resolve_own_pid() {
        let resolver = ProcfsResolver::new();
        let target = resolver
            .resolve(&TargetSelector::Pid(std::process::id()))
            .unwrap();
        assert_eq!(target.pid, std::process::id());
        assert!(resolver.is_alive(&target));
    }

    #[test]
    fn test_recycled_pid_is_not_alive() {
        let resolver = ProcfsResolver::new();
        let mut target = resolver
            .resolve(&TargetSelector::Pid(std::process::id()))
            .unwrap();
        target.start_time += 1;
        assert!(!resolver.is_alive(&target));
    }

    #[test]
    fn test_resolve_by_name_and_detect_exit() {
        let mut child = Command::new("sleep").arg("31.4159").spawn().unwrap();
        let resolver = ProcfsResolver::new();

        let target = resolver
            .resolve(&TargetSelector::Name("31.4159".into()))
            .unwrap();
        assert_eq!(target.pid, child.id());
        assert_eq!(target.command_name, "sleep");
        assert!(resolver.is_alive(&target));

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!resolver.is_alive(&target));
    }

    #[test]
    fn test_lineage_includes_parent() {
        let parent = std::os::unix::process::parent_id();
        let pids = lineage(std::process::id());
        assert_eq!(pids[0], std::process::id());
        if parent > 1 {
            assert_eq!(pids[1], parent);
        }
        assert!(!pids.contains(&1));
    }

    #[test]
    fn test_launcher_is_never_the_target() {
        // Our own binary path matches our command line and possibly the
        // launcher's; neither may be picked
        let resolver = ProcfsResolver::new();
        let own = std::env::args().next().unwrap();
        match resolver.resolve(&TargetSelector::Name(own)) {
            Ok(target) => assert!(!resolver.excluded_pids.contains(&target.pid)),
            Err(e) => assert!(matches!(e, TracerError::ProcessNotFound(_))),
        }
    }

    #[test]
    fn test_missing_pid() {
        let resolver = ProcfsResolver::new();
        let err = resolver.resolve(&TargetSelector::Pid(u32::MAX / 2)).unwrap_err();
        assert!(matches!(err, TracerError::ProcessNotFound(_)));
    }
}
