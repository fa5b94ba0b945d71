//! Locating a freshly booted guest init from the host.
//!
//! After the double fork the runtime does not know the global PID of the
//! guest's PID 1. The boot sequence drops an empty `/run/<token>` file into
//! the guest's private `/run`; any process whose `/proc/<pid>/root` shows
//! that file lives inside the new container. Once init has forked there can
//! be several such processes, so the namespace's PID 1 is preferred.

use std::path::Path;
use std::time::{Duration, Instant};

use chamber_common::config::DiscoveryTimings;
use chamber_common::error::{ChamberError, Result};
use chamber_common::types::MarkerToken;
use chamber_core::namespace::pid::is_namespace_init;
use chamber_core::procfs;

/// Process tables smaller than this are scanned on the calling thread.
const PARALLEL_THRESHOLD: usize = 256;

/// Upper bound on scan threads.
const MAX_SCAN_THREADS: usize = 8;

fn carries_marker(proc_root: &Path, pid: i32, marker: &Path) -> bool {
    procfs::path_in_root(proc_root, pid, marker).exists()
}

fn matching(proc_root: &Path, pids: &[i32], marker: &Path) -> Vec<i32> {
    pids.iter()
        .copied()
        .filter(|pid| carries_marker(proc_root, *pid, marker))
        .collect()
}

/// PIDs under `proc_root` whose root contains the token's marker.
#[must_use]
pub fn scan(proc_root: &Path, token: &MarkerToken) -> Vec<i32> {
    let marker = token.run_relative();
    let pids = procfs::list_pids(proc_root);
    if pids.len() < PARALLEL_THRESHOLD {
        return matching(proc_root, &pids, &marker);
    }

    let threads = std::thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .clamp(1, MAX_SCAN_THREADS);
    let chunk = pids.len().div_ceil(threads);
    std::thread::scope(|scope| {
        let workers: Vec<_> = pids
            .chunks(chunk)
            .map(|slice| {
                let marker = marker.as_path();
                scope.spawn(move || matching(proc_root, slice, marker))
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap_or_default())
            .collect()
    })
}

/// Picks the guest init among marker carriers: the PID whose innermost
/// namespace PID is 1, else the lowest.
#[must_use]
pub fn pick_init(proc_root: &Path, candidates: &[i32]) -> Option<i32> {
    let lowest_init = candidates
        .iter()
        .copied()
        .filter(|pid| is_namespace_init(proc_root, *pid))
        .min();
    lowest_init.or_else(|| candidates.iter().copied().min())
}

/// Delay before the next attempt, given the time spent so far.
#[must_use]
pub fn next_delay(timings: &DiscoveryTimings, elapsed: Duration) -> Duration {
    if elapsed < timings.fast_window {
        timings.fast_interval
    } else {
        timings.slow_interval
    }
}

/// Repeatedly scans for the guest init until it is found, `aborted`
/// reports that the boot failed, or the budget runs out.
///
/// # Errors
///
/// Returns [`ChamberError::Boot`] when aborted and
/// [`ChamberError::StartTimeout`] when the budget is exhausted.
pub fn discover(
    proc_root: &Path,
    token: &MarkerToken,
    name: &str,
    timings: &DiscoveryTimings,
    aborted: impl FnMut() -> bool,
) -> Result<i32> {
    discover_ready(proc_root, token, name, timings, |_| true, aborted)
}

/// Like [`discover`], then keeps polling within the same budget until
/// `ready` accepts the found init.
///
/// The token marker appears right after the root switch, well before the
/// guest's identity markers are written and its init is executed.
///
/// # Errors
///
/// Returns [`ChamberError::Boot`] when aborted and
/// [`ChamberError::StartTimeout`] when the budget is exhausted in either
/// phase.
pub fn discover_ready(
    proc_root: &Path,
    token: &MarkerToken,
    name: &str,
    timings: &DiscoveryTimings,
    mut ready: impl FnMut(i32) -> bool,
    mut aborted: impl FnMut() -> bool,
) -> Result<i32> {
    let started = Instant::now();
    let pid = poll(name, timings, started, &mut aborted, || {
        pick_init(proc_root, &scan(proc_root, token))
    })?;
    tracing::info!(name, pid, elapsed = ?started.elapsed(), "guest init found");
    let pid = poll(name, timings, started, &mut aborted, || ready(pid).then_some(pid))?;
    tracing::debug!(name, pid, elapsed = ?started.elapsed(), "guest ready");
    Ok(pid)
}

fn poll<T>(
    name: &str,
    timings: &DiscoveryTimings,
    started: Instant,
    aborted: &mut impl FnMut() -> bool,
    mut probe: impl FnMut() -> Option<T>,
) -> Result<T> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if let Some(found) = probe() {
            return Ok(found);
        }
        if aborted() {
            return Err(ChamberError::Boot {
                stage: "discovery",
                message: "container exited before its init came up".into(),
            });
        }
        let elapsed = started.elapsed();
        if elapsed >= timings.total {
            return Err(ChamberError::StartTimeout {
                name: name.to_string(),
                waited: elapsed,
            });
        }
        let delay = next_delay(timings, elapsed).min(timings.total - elapsed);
        tracing::trace!(attempts, ?delay, "guest not ready yet");
        std::thread::sleep(delay);
    }
}

/// Deletes the in-guest marker and the host-side seed once the init is
/// known. Failures are logged.
pub fn clear_markers(proc_root: &Path, pid: i32, token: &MarkerToken, rootfs: &Path) {
    let marker = procfs::path_in_root(proc_root, pid, &token.run_relative());
    for path in [marker, token.seed_path(rootfs)] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "marker not removed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_process(proc_root: &Path, pid: i32, nspid: &str, marker: Option<&MarkerToken>) {
        let dir = proc_root.join(pid.to_string());
        std::fs::create_dir_all(dir.join("root/run")).expect("mkdir");
        std::fs::write(dir.join("status"), format!("Name:\tx\nNSpid:\t{nspid}\n")).expect("status");
        if let Some(token) = marker {
            std::fs::write(dir.join("root").join(token.run_relative()), b"").expect("marker");
        }
    }

    fn quick() -> DiscoveryTimings {
        DiscoveryTimings {
            fast_interval: Duration::from_millis(5),
            fast_window: Duration::from_millis(20),
            slow_interval: Duration::from_millis(10),
            total: Duration::from_millis(80),
        }
    }

    #[test]
    fn init_wins_over_lower_children() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = MarkerToken::generate();
        add_process(dir.path(), 900, "900\t1", Some(&token));
        add_process(dir.path(), 850, "850\t14", Some(&token));
        add_process(dir.path(), 100, "100", None);

        let mut found = scan(dir.path(), &token);
        found.sort_unstable();
        assert_eq!(found, vec![850, 900]);
        assert_eq!(pick_init(dir.path(), &found), Some(900));
    }

    #[test]
    fn lowest_pid_when_no_namespace_info() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = MarkerToken::generate();
        add_process(dir.path(), 31, "31", Some(&token));
        add_process(dir.path(), 30, "30", Some(&token));
        assert_eq!(pick_init(dir.path(), &scan(dir.path(), &token)), Some(30));
    }

    #[test]
    fn distinct_tokens_find_distinct_containers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = MarkerToken::generate();
        let b = MarkerToken::generate();
        add_process(dir.path(), 500, "500\t1", Some(&a));
        add_process(dir.path(), 600, "600\t1", Some(&b));
        let pa = discover(dir.path(), &a, "a", &quick(), || false).expect("a");
        let pb = discover(dir.path(), &b, "b", &quick(), || false).expect("b");
        assert_eq!((pa, pb), (500, 600));
    }

    #[test]
    fn large_tables_are_scanned_in_parallel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = MarkerToken::generate();
        for pid in 1000..1400 {
            add_process(dir.path(), pid, &pid.to_string(), None);
        }
        add_process(dir.path(), 1377, "1377\t1", Some(&token));
        assert_eq!(scan(dir.path(), &token), vec![1377]);
    }

    #[test]
    fn times_out_with_start_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = MarkerToken::generate();
        let err = discover(dir.path(), &token, "slow", &quick(), || false).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn abort_probe_stops_early() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = MarkerToken::generate();
        let timings = DiscoveryTimings {
            total: Duration::from_secs(30),
            ..quick()
        };
        let started = Instant::now();
        let err = discover(dir.path(), &token, "dead", &timings, || true).unwrap_err();
        assert!(matches!(err, ChamberError::Boot { stage: "discovery", .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn waits_for_readiness_after_the_token_appears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = MarkerToken::generate();
        add_process(dir.path(), 700, "700\t1", Some(&token));
        let identity = dir.path().join("700/root/run/systemd/container");
        let is_ready = |pid: i32| pid == 700 && identity.exists();

        let err = discover_ready(dir.path(), &token, "booting", &quick(), is_ready, || false).unwrap_err();
        assert_eq!(err.exit_code(), 4);

        std::fs::create_dir_all(identity.parent().expect("parent")).expect("mkdir");
        std::fs::write(&identity, b"chamber").expect("identity");
        let pid = discover_ready(dir.path(), &token, "booted", &quick(), is_ready, || false).expect("ready");
        assert_eq!(pid, 700);
    }

    #[test]
    fn abort_while_waiting_for_readiness() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token = MarkerToken::generate();
        add_process(dir.path(), 710, "710\t1", Some(&token));
        let timings = DiscoveryTimings {
            total: Duration::from_secs(30),
            ..quick()
        };
        let mut polls = 0;
        let err = discover_ready(dir.path(), &token, "failed", &timings, |_| false, || {
            polls += 1;
            polls > 2
        })
        .unwrap_err();
        assert!(matches!(err, ChamberError::Boot { stage: "discovery", .. }));
    }

    #[test]
    fn retry_schedule_slows_down() {
        let t = DiscoveryTimings::default();
        assert_eq!(next_delay(&t, Duration::from_millis(300)), Duration::from_millis(100));
        assert_eq!(next_delay(&t, Duration::from_millis(1500)), Duration::from_millis(500));
    }

    #[test]
    fn markers_are_cleared() {
        let proc_dir = tempfile::tempdir().expect("proc");
        let rootfs = tempfile::tempdir().expect("rootfs");
        let token = MarkerToken::generate();
        add_process(proc_dir.path(), 42, "42\t1", Some(&token));
        std::fs::write(token.seed_path(rootfs.path()), token.as_str()).expect("seed");

        clear_markers(proc_dir.path(), 42, &token, rootfs.path());
        assert!(scan(proc_dir.path(), &token).is_empty());
        assert!(!token.seed_path(rootfs.path()).exists());
    }
}
