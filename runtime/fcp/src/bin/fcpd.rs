// SPDX-License-Identifier: GPL-3.0-or-later

use {
    clap::Parser,
    fcp_core::{cmdline::ServiceCmd, LogLevel},
    fcpd::daemon::{self, Daemon},
    std::path::PathBuf,
};

struct FcpServiceCmd;

#[derive(Parser)]
#[clap(name = "fcpd")]
struct Arguments {
    /// The numeric identifier of the sound card in the Linux sound subsystem.
    card_id: u32,

    /// Path to the hwdep character device exposing the FCP ioctl surface.
    /// Defaults to `/dev/snd/hwC<card_id>D0`.
    #[clap(long)]
    device: Option<PathBuf>,

    /// The level to log runtime at; falls back to `LOG_LEVEL` when unset.
    #[clap(long, short)]
    log_level: Option<LogLevel>,
}

impl ServiceCmd<Arguments, daemon::Arguments, Daemon> for FcpServiceCmd {
    fn params(args: &Arguments) -> (daemon::Arguments, Option<LogLevel>) {
        let device_path = args
            .device
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/dev/snd/hwC{}D0", args.card_id)));

        (
            daemon::Arguments {
                card_id: args.card_id,
                device_path,
            },
            args.log_level,
        )
    }
}

fn main() {
    FcpServiceCmd::run()
}
