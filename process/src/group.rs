//! Process-group control.
//!
//! Tasks are spawned as session leaders so that a signal reaches the tool
//! and everything it forked (cargo runs rustc, build scripts, test binaries).
//! The group id equals the leader's pid.

/// Which signal to deliver to a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    /// Cooperative interrupt (SIGINT), as if Ctrl-C were pressed.
    Interrupt,
    /// Forced termination (SIGKILL).
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    NotRunning,
    Signalled,
}

/// Put the child in its own session so the whole group can be signalled.
#[cfg(unix)]
pub fn set_new_session(cmd: &mut tokio::process::Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.as_std_mut().pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // Linux-only: the child dies with us instead of running on orphaned.
            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Deliver `signal` to the process group led by `pid`.
///
/// A group that has already gone away reports [`KillOutcome::NotRunning`].
#[cfg(unix)]
pub fn signal_process_group(pid: u32, signal: GroupSignal) -> std::io::Result<KillOutcome> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    let signo = match signal {
        GroupSignal::Interrupt => libc::SIGINT,
        GroupSignal::Kill => libc::SIGKILL,
    };
    unsafe {
        if libc::killpg(pgid, signo) == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(KillOutcome::NotRunning);
            }
            return Err(err);
        }
    }
    Ok(KillOutcome::Signalled)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_reaches_session_leader() {
        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("30").kill_on_drop(true);
        set_new_session(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        let outcome = signal_process_group(pid, GroupSignal::Interrupt).unwrap();
        assert_eq!(outcome, KillOutcome::Signalled);

        let status = child.wait().await.unwrap();
        assert!(!status.success());
        assert_eq!(
            signal_process_group(pid, GroupSignal::Kill).unwrap(),
            KillOutcome::NotRunning
        );
    }
}
