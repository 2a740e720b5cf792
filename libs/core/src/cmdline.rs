// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2022 Takashi Sakamoto

use {
    super::*,
    alsactl::CardError,
    clap::Parser,
    glib::{Error, FileError},
};

pub trait ServiceCmd<A, T, R>: Sized
where
    A: Parser,
    R: RuntimeOperation<T>,
{
    fn params(args: &A) -> (T, Option<LogLevel>);

    fn run() {
        // NOTE: clap(v4)::Parser::parse() can exit process with 2 when detecting any error
        // or printing help.
        let args = A::parse();
        let (params, log_level) = Self::params(&args);

        let code = R::new(params, log_level)
            .and_then(|mut runtime| {
                runtime.listen()?;
                runtime.run()?;
                Ok(libc::EXIT_SUCCESS)
            })
            .map_err(|err| specific_err_to_string(&err))
            .unwrap_or_else(|msg| {
                eprintln!("{}", msg);
                libc::EXIT_FAILURE
            });

        std::process::exit(code)
    }
}

fn specific_err_to_string(e: &Error) -> String {
    let (domain, cause) = if let Some(error) = e.kind::<FileError>() {
        (
            "Linux file or device-node operation error",
            match error {
                FileError::Acces => "Access permission",
                FileError::Isdir => "Is directory",
                FileError::Noent => "Not exists",
                FileError::Nodev => "No such device",
                FileError::Busy => "Device is busy",
                _ => "",
            },
        )
    } else if let Some(error) = e.kind::<CardError>() {
        (
            "ALSA control operation error",
            match error {
                CardError::Disconnected => "Sound card is disconnected",
                _ => "",
            },
        )
    } else {
        ("Unknown domain error", "")
    };
    format!("{}: {}, {}", domain, cause, e)
}
