use anyhow::{Context, Result};
use std::{
    path::Path,
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{info, warn};

use crate::error::LaunchError;

/// Finds, kills and waits on OS processes by executable name.
pub trait ProcessControl {
    /// Ids of running processes whose executable stem equals `name`,
    /// ignoring ASCII case.
    fn find_by_name(&self, name: &str) -> Result<Vec<u32>>;
    fn terminate(&self, pid: u32) -> Result<()>;
    /// `Ok(true)` once the process is gone, `Ok(false)` if still alive when
    /// `timeout` runs out.
    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> Result<bool>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    pub terminated: Vec<u32>,
    /// Processes that could not be killed or outlived the wait.
    pub failures: Vec<(u32, String)>,
}

/// Kills every process called `name` and waits for each to exit.
///
/// Individual failures are collected rather than returned, the launch goes on
/// without them. Only a failing process listing is an error.
pub fn terminate_all(
    control: &dyn ProcessControl,
    name: &str,
    timeout: Duration,
) -> Result<TerminationReport> {
    let mut report = TerminationReport::default();
    for pid in control.find_by_name(name)? {
        if let Err(err) = control.terminate(pid) {
            warn!(pid, error = %format!("{err:#}"), "terminate failed");
            report.failures.push((pid, format!("{err:#}")));
            continue;
        }
        match control.wait_for_exit(pid, timeout) {
            Ok(true) => {
                info!(pid, process = name, "process terminated");
                report.terminated.push(pid);
            }
            Ok(false) => {
                warn!(pid, ?timeout, "process still running after wait");
                report.failures.push((pid, format!("still running after {timeout:?}")));
            }
            Err(err) => {
                warn!(pid, error = %format!("{err:#}"), "wait for exit failed");
                report.failures.push((pid, format!("{err:#}")));
            }
        }
    }
    Ok(report)
}

/// Starts `exe` without waiting on it, from its own directory.
pub fn start_detached(exe: &Path) -> Result<()> {
    if !exe.is_file() {
        return Err(LaunchError::MissingTarget {
            name: exe
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: exe.to_path_buf(),
        }
        .into());
    }
    let mut cmd = Command::new(exe);
    if let Some(dir) = exe.parent() {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd
        .spawn()
        .with_context(|| format!("start {}", exe.display()))?;
    info!(pid = child.id(), exe = %exe.display(), "process started");
    Ok(())
}

fn stem_matches(candidate: &str, name: &str) -> bool {
    let file = candidate.rsplit(['/', '\\']).next().unwrap_or(candidate);
    let stem = match file.rsplit_once('.') {
        Some((stem, ext)) if ext.eq_ignore_ascii_case("exe") => stem,
        _ => file,
    };
    !stem.is_empty() && stem.eq_ignore_ascii_case(name)
}

/// The real process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

#[cfg(windows)]
mod sys {
    use super::*;
    use std::time::Instant;
    use windows_sys::Win32::{
        Foundation::{CloseHandle, ERROR_INVALID_PARAMETER, HANDLE, INVALID_HANDLE_VALUE},
        System::{
            Diagnostics::ToolHelp::{
                CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
                TH32CS_SNAPPROCESS,
            },
            Threading::{
                OpenProcess, TerminateProcess, WaitForSingleObject, PROCESS_SYNCHRONIZE,
                PROCESS_TERMINATE,
            },
        },
    };

    const WAIT_OBJECT_0: u32 = 0;

    struct OwnedHandle(HANDLE);

    impl Drop for OwnedHandle {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.0) };
        }
    }

    fn wide_to_string(buf: &[u16]) -> String {
        let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        String::from_utf16_lossy(&buf[..len])
    }

    fn open(pid: u32, access: u32) -> Result<OwnedHandle> {
        let handle = unsafe { OpenProcess(access, 0, pid) };
        if handle == 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| format!("open process {pid}"));
        }
        Ok(OwnedHandle(handle))
    }

    /// `OpenProcess` reports a pid that no longer exists as an invalid
    /// parameter. Access denied and the like mean the process is still there.
    pub(super) fn pid_is_unknown(err: &anyhow::Error) -> bool {
        err.downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::raw_os_error)
            .is_some_and(|code| code == ERROR_INVALID_PARAMETER as i32)
    }

    impl ProcessControl for SystemProcesses {
        fn find_by_name(&self, name: &str) -> Result<Vec<u32>> {
            let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
            if snapshot == INVALID_HANDLE_VALUE {
                return Err(std::io::Error::last_os_error()).context("snapshot process list");
            }
            let snapshot = OwnedHandle(snapshot);

            let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
            entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;
            let mut found = Vec::new();
            let mut has_entry = unsafe { Process32FirstW(snapshot.0, &mut entry) } != 0;
            while has_entry {
                if stem_matches(&wide_to_string(&entry.szExeFile), name) {
                    found.push(entry.th32ProcessID);
                }
                has_entry = unsafe { Process32NextW(snapshot.0, &mut entry) } != 0;
            }
            Ok(found)
        }

        fn terminate(&self, pid: u32) -> Result<()> {
            let handle = open(pid, PROCESS_TERMINATE)?;
            if unsafe { TerminateProcess(handle.0, 1) } == 0 {
                return Err(std::io::Error::last_os_error()).with_context(|| format!("terminate {pid}"));
            }
            Ok(())
        }

        fn wait_for_exit(&self, pid: u32, timeout: Duration) -> Result<bool> {
            let started = Instant::now();
            let handle = match open(pid, PROCESS_SYNCHRONIZE) {
                Ok(handle) => handle,
                // Already gone and reaped.
                Err(err) if pid_is_unknown(&err) => return Ok(true),
                Err(err) => return Err(err),
            };
            let remaining = timeout.saturating_sub(started.elapsed());
            let millis = u32::try_from(remaining.as_millis()).unwrap_or(u32::MAX);
            Ok(unsafe { WaitForSingleObject(handle.0, millis) } == WAIT_OBJECT_0)
        }
    }
}

#[cfg(unix)]
mod sys {
    use super::*;
    use nix::{
        errno::Errno,
        sys::signal::{kill, Signal},
        unistd::Pid,
    };
    use std::{fs, thread, time::Instant};

    const POLL: Duration = Duration::from_millis(100);

    /// Names a process goes by: the exe link, `comm`, and the first argv
    /// entry. Wine keeps the Windows path in argv0.
    fn process_names(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(exe) = fs::read_link(dir.join("exe")) {
            names.push(exe.to_string_lossy().to_string());
        }
        if let Ok(comm) = fs::read_to_string(dir.join("comm")) {
            names.push(comm.trim().to_string());
        }
        if let Ok(cmdline) = fs::read(dir.join("cmdline")) {
            if let Some(argv0) = cmdline.split(|&b| b == 0).next() {
                names.push(String::from_utf8_lossy(argv0).to_string());
            }
        }
        names
    }

    fn is_gone(pid: u32) -> bool {
        match fs::read_to_string(format!("/proc/{pid}/stat")) {
            // State follows the parenthesised command name.
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state == 'Z' || state == 'X'),
            Err(_) => true,
        }
    }

    impl ProcessControl for SystemProcesses {
        fn find_by_name(&self, name: &str) -> Result<Vec<u32>> {
            let mut found = Vec::new();
            for entry in fs::read_dir("/proc").context("read_dir /proc")? {
                let Ok(entry) = entry else { continue };
                let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                    continue;
                };
                if process_names(&entry.path()).iter().any(|n| stem_matches(n, name)) {
                    found.push(pid);
                }
            }
            found.sort_unstable();
            Ok(found)
        }

        fn terminate(&self, pid: u32) -> Result<()> {
            let raw = i32::try_from(pid).with_context(|| format!("pid {pid} out of range"))?;
            match kill(Pid::from_raw(raw), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(err) => Err(err).with_context(|| format!("kill {pid}")),
            }
        }

        fn wait_for_exit(&self, pid: u32, timeout: Duration) -> Result<bool> {
            let started = Instant::now();
            loop {
                if is_gone(pid) {
                    return Ok(true);
                }
                if started.elapsed() >= timeout {
                    return Ok(false);
                }
                thread::sleep(POLL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, collections::BTreeMap};

    struct FakeProcesses {
        running: Vec<u32>,
        stubborn: Vec<u32>,
        killed: RefCell<Vec<u32>>,
    }

    impl ProcessControl for FakeProcesses {
        fn find_by_name(&self, name: &str) -> Result<Vec<u32>> {
            assert_eq!(name, "Arknights");
            Ok(self.running.clone())
        }

        fn terminate(&self, pid: u32) -> Result<()> {
            if pid == 13 {
                anyhow::bail!("access denied");
            }
            self.killed.borrow_mut().push(pid);
            Ok(())
        }

        fn wait_for_exit(&self, pid: u32, _timeout: Duration) -> Result<bool> {
            Ok(!self.stubborn.contains(&pid))
        }
    }

    #[test]
    fn stem_matches_ignores_case_extension_and_directories() {
        assert!(stem_matches("Arknights.exe", "Arknights"));
        assert!(stem_matches("ARKNIGHTS.EXE", "arknights"));
        assert!(stem_matches("C:\\Games\\ArknightsGame\\Arknights.exe", "Arknights"));
        assert!(stem_matches("/opt/game/Arknights", "Arknights"));
        assert!(!stem_matches("ArknightsHelper.exe", "Arknights"));
        assert!(!stem_matches("Arknights.dll", "Arknights"));
        assert!(!stem_matches("", "Arknights"));
    }

    #[test]
    fn terminate_all_collects_failures_and_continues() {
        let fake = FakeProcesses {
            running: vec![11, 13, 17],
            stubborn: vec![17],
            killed: RefCell::new(Vec::new()),
        };

        let report = terminate_all(&fake, "Arknights", Duration::from_millis(10)).unwrap();

        assert_eq!(report.terminated, vec![11]);
        let failed: BTreeMap<u32, String> = report.failures.into_iter().collect();
        assert!(failed[&13].contains("access denied"));
        assert!(failed[&17].contains("still running"));
        assert_eq!(*fake.killed.borrow(), vec![11, 17]);
    }

    #[test]
    fn terminate_all_with_nothing_running_is_clean() {
        let fake = FakeProcesses {
            running: Vec::new(),
            stubborn: Vec::new(),
            killed: RefCell::new(Vec::new()),
        };
        assert!(terminate_all(&fake, "Arknights", Duration::ZERO).unwrap().failures.is_empty());
    }

    #[test]
    fn start_detached_missing_exe_names_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = start_detached(&tmp.path().join("Arknights.exe")).unwrap_err();
        match err.downcast_ref::<LaunchError>() {
            Some(LaunchError::MissingTarget { name, .. }) => assert_eq!(name, "Arknights.exe"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn system_processes_finds_nothing_for_unknown_name() {
        let found = SystemProcesses
            .find_by_name("definitely-not-a-running-process-7c1e")
            .unwrap();
        assert!(found.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn system_processes_kills_and_reaps_a_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        SystemProcesses.terminate(pid).unwrap();
        let _ = child.wait();

        assert!(SystemProcesses.wait_for_exit(pid, Duration::from_secs(2)).unwrap());
    }

    #[cfg(windows)]
    #[test]
    fn only_unknown_pid_counts_as_exited() {
        use anyhow::Context;
        let open_error = |code: i32| {
            Err::<(), _>(std::io::Error::from_raw_os_error(code))
                .context("open process 42")
                .unwrap_err()
        };
        assert!(sys::pid_is_unknown(&open_error(87)));
        // ERROR_ACCESS_DENIED
        assert!(!sys::pid_is_unknown(&open_error(5)));
    }
}
