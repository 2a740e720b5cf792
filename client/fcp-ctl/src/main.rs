// SPDX-License-Identifier: GPL-3.0-or-later

//! Command-line entry point (C4.7/C4.9/C6), grounded on the original
//! client's `main.c`: split commands that need no socket at all (listing,
//! help) from ones that require a connected daemon, then dispatch.

mod card;
mod commands;
mod session;
mod wait;

use {
    clap::{Parser, Subcommand},
    fcp_core::LogLevel,
    fcp_protocol::{firmware::read_firmware_file, new_error, ProtocolError},
    glib::Error,
    std::path::PathBuf,
};

#[derive(Parser)]
#[clap(name = "fcp-ctl", about = "Control client for the Focusrite control-protocol daemon")]
struct Args {
    /// Restricts the operation to a single ALSA card number, when more than
    /// one supported device is attached.
    #[clap(long, short)]
    card: Option<u32>,

    /// Sets the tracing level; falls back to `LOG_LEVEL` when unset.
    #[clap(long, short)]
    log_level: Option<LogLevel>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lists the supported device managed by `--card`, or the sole one found.
    #[clap(short_flag = 'l')]
    List,
    /// Lists every supported device found on the system.
    ListAll,
    /// Prints command help.
    #[clap(short_flag = 'h')]
    Help,
    /// Prints version and build information.
    About,
    /// Reboots the selected device.
    Reboot,
    /// Erases the selected device's saved configuration.
    EraseConfig,
    /// Erases the selected device's application firmware.
    EraseApp,
    /// Uploads a leapfrog firmware image without rebooting.
    UploadLeapfrog {
        #[clap(long, short = 'f')]
        firmware: PathBuf,
    },
    /// Uploads an auxiliary-MCU firmware image.
    UploadEsp {
        #[clap(long, short = 'f')]
        firmware: PathBuf,
    },
    /// Uploads an application firmware image.
    UploadApp {
        #[clap(long, short = 'f')]
        firmware: PathBuf,
    },
    /// Brings the selected device up to date with the given firmware file,
    /// uploading and rebooting only the sections that actually changed.
    #[clap(short_flag = 'u')]
    Update {
        #[clap(long, short = 'f')]
        firmware: PathBuf,
    },
}

fn init_tracing(log_level: Option<LogLevel>) {
    use tracing_subscriber::EnvFilter;

    let level = log_level.unwrap_or_default();
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| {
        EnvFilter::new(match level {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        })
    });
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn run(args: Args) -> Result<(), Error> {
    match args.command {
        Command::List => {
            let found = card::select_card(args.card)?;
            commands::print_card(&found);
            return Ok(());
        }
        Command::ListAll => {
            let cards = card::enumerate_cards()?;
            if cards.is_empty() {
                eprintln!("No supported devices found.");
            }
            for found in &cards {
                commands::print_card(found);
            }
            return Ok(());
        }
        Command::Help => {
            Args::parse_from(["fcp-ctl", "--help"]);
            return Ok(());
        }
        Command::About => {
            println!("fcp-ctl {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let found = card::select_card(args.card)?;
    let Some(socket_path) = found.socket_path.clone() else {
        return Err(new_error(
            ProtocolError::Transport,
            format!("fcp-server not running for card {}", found.card_num),
        ));
    };
    let mut stream = session::connect(&socket_path)?;

    match args.command {
        Command::Reboot => commands::reboot(&mut stream),
        Command::EraseConfig => commands::erase_config(&mut stream),
        Command::EraseApp => commands::erase_app(&mut stream),
        Command::UploadLeapfrog { firmware } => {
            let container = read_firmware_file(&firmware)?;
            commands::upload_leapfrog(&mut stream, &found, &container)
        }
        Command::UploadEsp { firmware } => {
            let container = read_firmware_file(&firmware)?;
            commands::upload_esp(&mut stream, &found, &container)
        }
        Command::UploadApp { firmware } => {
            let container = read_firmware_file(&firmware)?;
            commands::upload_app(&mut stream, &found, &container)
        }
        Command::Update { firmware } => {
            let container = read_firmware_file(&firmware)?;
            commands::update(stream, found, &container)
        }
        Command::List | Command::ListAll | Command::Help | Command::About => unreachable!(),
    }
}

fn main() {
    let args = Args::parse();
    init_tracing(args.log_level);

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        std::process::exit(libc::EXIT_FAILURE);
    }
    std::process::exit(libc::EXIT_SUCCESS);
}
