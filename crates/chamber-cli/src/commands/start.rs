//! `chamber start` — Boot a container.

use std::path::PathBuf;
use std::process::ExitCode;

use chamber_common::config::{BindMount, ContainerConfig, FeatureFlags, RootfsSource};
use chamber_common::constants::DEFAULT_TTYS;
use chamber_runtime::engine::{Engine, StartOutcome};
use clap::{ArgGroup, Args};

use crate::output;

/// Arguments for the `start` command.
#[derive(Args, Debug)]
#[command(group(ArgGroup::new("root").required(true).args(["rootfs", "image"])))]
pub struct StartArgs {
    /// Container name.
    #[arg(short, long)]
    pub name: String,

    /// Root filesystem directory.
    #[arg(short, long)]
    pub rootfs: Option<PathBuf>,

    /// Root filesystem image, loop-mounted read-write.
    #[arg(short, long)]
    pub image: Option<PathBuf>,

    /// Hostname inside the container (defaults to the name).
    #[arg(long)]
    pub hostname: Option<String>,

    /// DNS servers for the guest's resolv.conf.
    #[arg(long, value_delimiter = ',')]
    pub dns: Vec<String>,

    /// Bind mount from the host, as SRC:DST (repeatable).
    #[arg(short, long = "bind", value_name = "SRC:DST")]
    pub binds: Vec<String>,

    /// Number of virtual terminals besides the console.
    #[arg(long, default_value_t = DEFAULT_TTYS)]
    pub ttys: u8,

    /// Stay attached to the console until the container exits.
    #[arg(short, long)]
    pub foreground: bool,

    /// Pass the host's devices and a writable /sys through.
    ///
    /// Trusted guests only: the guest sees every host device, and the
    /// kernel-wide devtmpfs is shared with the host.
    #[arg(long)]
    pub hw_access: bool,

    /// Enable IPv6 on the host interfaces.
    ///
    /// The setting is host-wide and stays enabled after the container stops.
    #[arg(long)]
    pub ipv6: bool,

    /// Switch SELinux to permissive before booting.
    #[arg(long)]
    pub selinux_permissive: bool,

    /// Discard every change to the root filesystem on stop.
    #[arg(long)]
    pub volatile: bool,
}

impl StartArgs {
    /// Builds the validated container configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is invalid.
    pub fn to_config(&self) -> anyhow::Result<ContainerConfig> {
        let rootfs = match (&self.rootfs, &self.image) {
            (Some(dir), _) => RootfsSource::Directory(dir.clone()),
            (None, Some(image)) => RootfsSource::Image(image.clone()),
            (None, None) => anyhow::bail!("either --rootfs or --image is required"),
        };
        let mut builder = ContainerConfig::builder(&self.name, rootfs)
            .features(FeatureFlags {
                hw_access: self.hw_access,
                ipv6: self.ipv6,
                selinux_permissive: self.selinux_permissive,
                volatile: self.volatile,
            })
            .foreground(self.foreground)
            .tty_count(self.ttys);
        if let Some(hostname) = &self.hostname {
            builder = builder.hostname(hostname);
        }
        for server in &self.dns {
            builder = builder.dns(server.trim());
        }
        for bind in &self.binds {
            builder = builder.bind(BindMount::parse(bind)?);
        }
        Ok(builder.build()?)
    }
}

/// Executes the `start` command.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the container
/// fails to boot.
pub fn execute(engine: &Engine, args: StartArgs) -> anyhow::Result<ExitCode> {
    let config = args.to_config()?;
    match engine.start(&config)? {
        StartOutcome::Background(record) => {
            println!("{} started (pid {})", record.name, record.pid);
            Ok(ExitCode::SUCCESS)
        }
        StartOutcome::Exited(code) => {
            tracing::info!(name = %config.name, code, "container exited");
            Ok(output::exit_code_from_status(code))
        }
    }
}
