//! Network-related setup around a container boot.
//!
//! Containers share the host network namespace, so there is nothing to
//! plumb: the host side only enables IPv6 on request and runs an optional
//! hook, and the guest side writes its hostname and resolver files. Every
//! failure here is logged and ignored.

use std::path::{Path, PathBuf};
use std::process::Command;

use chamber_common::config::ContainerConfig;
use chamber_common::error::{ChamberError, Result};

/// sysctl controlling IPv6 on every interface.
const IPV6_SYSCTL: &str = "sys/net/ipv6/conf/all/disable_ipv6";

/// SELinux enforcement switch.
const SELINUX_ENFORCE: &str = "/sys/fs/selinux/enforce";

/// Enables IPv6 on every host interface through `<proc_root>/sys`.
///
/// The sysctl is host-wide and outlives the container.
///
/// # Errors
///
/// Returns an error if the sysctl cannot be written.
pub fn enable_ipv6(proc_root: &Path) -> Result<()> {
    let path = proc_root.join(IPV6_SYSCTL);
    std::fs::write(&path, "0").map_err(|e| ChamberError::io(&path, e))?;
    tracing::info!("ipv6 enabled on the host");
    Ok(())
}

/// Switches SELinux to permissive mode if it is present.
///
/// # Errors
///
/// Returns an error if the enforcement switch exists but cannot be written.
pub fn set_selinux_permissive() -> Result<()> {
    let path = Path::new(SELINUX_ENFORCE);
    if !path.exists() {
        tracing::debug!("selinux not present");
        return Ok(());
    }
    std::fs::write(path, "0").map_err(|e| ChamberError::io(path, e))?;
    tracing::info!("selinux set to permissive");
    Ok(())
}

/// Runs the external network hook with the container's name and rootfs.
///
/// # Errors
///
/// Returns an error if the hook cannot be spawned or exits nonzero.
pub fn run_hook(hook: &Path, name: &str, rootfs: &Path) -> Result<()> {
    let status = Command::new(hook)
        .env("CHAMBER_NAME", name)
        .env("CHAMBER_ROOTFS", rootfs)
        .status()
        .map_err(|e| ChamberError::io(hook, e))?;
    if !status.success() {
        return Err(ChamberError::Config {
            message: format!("network hook {} exited with {status}", hook.display()),
        });
    }
    tracing::info!(hook = %hook.display(), "network hook completed");
    Ok(())
}

/// Host-side network steps. Runs before the root switch.
///
/// The IPv6 sysctl is only written when the container asks for IPv6; the
/// host's setting is otherwise left as found.
pub fn prepare_host(config: &ContainerConfig, proc_root: &Path, hook: Option<&Path>, rootfs: &Path) {
    if config.features.ipv6 {
        if let Err(e) = enable_ipv6(proc_root) {
            tracing::warn!(error = %e, "ipv6 sysctl not applied");
        }
    }
    if let Some(hook) = hook {
        if let Err(e) = run_hook(hook, config.name.as_str(), rootfs) {
            tracing::warn!(error = %e, "network hook failed");
        }
    }
}

/// Renders `resolv.conf` for the given servers.
#[must_use]
pub fn render_resolv_conf(servers: &[String]) -> String {
    servers.iter().fold(String::new(), |mut out, server| {
        out.push_str("nameserver ");
        out.push_str(server);
        out.push('\n');
        out
    })
}

/// Returns `hosts` with loopback entries for `hostname`, unless one is
/// already present.
#[must_use]
pub fn hosts_with_entry(hosts: &str, hostname: &str) -> String {
    let present = hosts.lines().any(|line| {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        fields.next().is_some() && fields.any(|name| name == hostname)
    });
    let mut out = hosts.to_string();
    if present {
        return out;
    }
    if out.is_empty() {
        out.push_str("127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n");
    } else if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("127.0.1.1\t");
    out.push_str(hostname);
    out.push('\n');
    out
}

fn replace_file(path: &Path, contents: &str) -> Result<()> {
    if path.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
        std::fs::remove_file(path).map_err(|e| ChamberError::io(path, e))?;
    }
    std::fs::write(path, contents).map_err(|e| ChamberError::io(path, e))
}

/// Guest-side steps, run after the root switch with `root` = `/`.
pub fn configure_guest(root: &Path, config: &ContainerConfig) {
    if let Err(e) = chamber_core::namespace::uts::set_hostname(&config.hostname) {
        tracing::warn!(error = %e, "sethostname failed");
    }

    let etc: PathBuf = root.join("etc");
    if let Err(e) = std::fs::create_dir_all(&etc) {
        tracing::warn!(error = %e, "guest /etc unavailable, skipping network files");
        return;
    }
    if let Err(e) = replace_file(&etc.join("hostname"), &format!("{}\n", config.hostname)) {
        tracing::warn!(error = %e, "hostname file not written");
    }

    let hosts_path = etc.join("hosts");
    let hosts = std::fs::read_to_string(&hosts_path).unwrap_or_default();
    if let Err(e) = replace_file(&hosts_path, &hosts_with_entry(&hosts, &config.hostname)) {
        tracing::warn!(error = %e, "hosts file not written");
    }

    let resolv = render_resolv_conf(&config.effective_dns());
    if let Err(e) = replace_file(&etc.join("resolv.conf"), &resolv) {
        tracing::warn!(error = %e, "resolv.conf not written");
    }
}

#[cfg(test)]
mod tests {
    use chamber_common::config::{FeatureFlags, RootfsSource};

    use super::*;

    #[test]
    fn resolv_conf_lists_every_server() {
        let servers = vec!["1.1.1.1".to_string(), "2606:4700::1111".to_string()];
        assert_eq!(
            render_resolv_conf(&servers),
            "nameserver 1.1.1.1\nnameserver 2606:4700::1111\n"
        );
    }

    #[test]
    fn hosts_entry_is_added_once() {
        let existing = "127.0.0.1 localhost";
        let once = hosts_with_entry(existing, "box");
        assert_eq!(once, "127.0.0.1 localhost\n127.0.1.1\tbox\n");
        assert_eq!(hosts_with_entry(&once, "box"), once);
    }

    #[test]
    fn commented_hostname_does_not_count() {
        let existing = "127.0.0.1 localhost\n# 127.0.1.1 box\n";
        assert!(hosts_with_entry(existing, "box").ends_with("127.0.1.1\tbox\n"));
    }

    #[test]
    fn empty_hosts_gets_loopback_defaults() {
        let out = hosts_with_entry("", "box");
        assert!(out.starts_with("127.0.0.1\tlocalhost\n"));
        assert!(out.ends_with("127.0.1.1\tbox\n"));
    }

    #[test]
    fn symlinked_resolv_conf_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("stub-resolv.conf");
        std::fs::write(&target, "nameserver 127.0.0.53\n").expect("stub");
        let link = dir.path().join("resolv.conf");
        std::os::unix::fs::symlink(&target, &link).expect("symlink");

        replace_file(&link, "nameserver 1.1.1.1\n").expect("replace");
        assert!(!link.symlink_metadata().expect("meta").file_type().is_symlink());
        assert_eq!(std::fs::read_to_string(&target).expect("stub"), "nameserver 127.0.0.53\n");
    }

    fn config(rootfs: &Path, ipv6: bool) -> ContainerConfig {
        ContainerConfig::builder("net", RootfsSource::Directory(rootfs.to_path_buf()))
            .features(FeatureFlags {
                ipv6,
                ..FeatureFlags::default()
            })
            .build()
            .expect("config")
    }

    #[test]
    fn host_ipv6_is_untouched_unless_requested() {
        let proc_root = tempfile::tempdir().expect("proc");
        let rootfs = tempfile::tempdir().expect("rootfs");
        let sysctl = proc_root.path().join(IPV6_SYSCTL);
        std::fs::create_dir_all(sysctl.parent().expect("parent")).expect("mkdir");
        std::fs::write(&sysctl, "0").expect("host default");

        prepare_host(&config(rootfs.path(), false), proc_root.path(), None, rootfs.path());
        assert_eq!(std::fs::read_to_string(&sysctl).expect("read"), "0");

        std::fs::write(&sysctl, "1").expect("host disabled");
        prepare_host(&config(rootfs.path(), false), proc_root.path(), None, rootfs.path());
        assert_eq!(std::fs::read_to_string(&sysctl).expect("read"), "1");

        prepare_host(&config(rootfs.path(), true), proc_root.path(), None, rootfs.path());
        assert_eq!(std::fs::read_to_string(&sysctl).expect("read"), "0");
    }
}
