use std::{io::Write, path::PathBuf};

use argparse::{ArgumentParser, Print, StoreOption, StoreTrue};

// Command line options, every value left unset falls back to the
// configuration file and then to the built-in defaults
#[derive(Debug, Default)]
pub struct ArgsOptions {
    pub config_file_path: Option<PathBuf>,

    pub check_period: Option<u64>,
    pub warn_after: Option<u64>,
    pub warning_interval: Option<u64>,
    pub machine_name: Option<String>,
    // Comma separated
    pub people: Option<String>,
    pub excluded_processes: Option<String>,

    pub command_timeout: Option<u64>,
    pub log_file: Option<PathBuf>,
    pub no_terminal: bool,
}

impl ArgsOptions {
    pub fn parse() -> Self {
        let args = std::env::args().collect();

        match Self::parse_from(args, &mut std::io::stdout(), &mut std::io::stderr()) {
            Ok(options) => options,
            Err(code) => std::process::exit(code),
        }
    }

    // Parse the given arguments, the first one being the program name.
    // On error or after printing help the exit code is returned.
    pub fn parse_from(
        args: Vec<String>,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<Self, i32> {
        let mut options = ArgsOptions::default();

        {
            let mut parser = ArgumentParser::new();
            parser.set_description(
                "Warn about GPUs left idle while holding processes. \
                 Run as root to inspect processes of every user.",
            );

            // Configuration file path
            parser.refer(&mut options.config_file_path).add_option(
                &["-c", "--config"],
                StoreOption,
                "Path of the JSON configuration file",
            );

            parser.refer(&mut options.check_period).add_option(
                &["--check-period", "--check_period"],
                StoreOption,
                "Seconds between two utilization checks (default 25)",
            );
            parser.refer(&mut options.warn_after).add_option(
                &["--warn-after", "--warn_after"],
                StoreOption,
                "Seconds of 0% utilization before warning (default 350)",
            );
            parser.refer(&mut options.warning_interval).add_option(
                &["--warning-interval", "--warning_interval"],
                StoreOption,
                "Minimum seconds between two warnings for the same GPU \
                 (default 3600)",
            );
            parser.refer(&mut options.machine_name).add_option(
                &["--machine-name", "--machine_name"],
                StoreOption,
                "Name of this machine in the warnings (required)",
            );
            parser.refer(&mut options.people).add_option(
                &["--people"],
                StoreOption,
                "Comma separated list of people to attribute processes to",
            );
            parser.refer(&mut options.excluded_processes).add_option(
                &["--exclude"],
                StoreOption,
                "Comma separated process names that are never reported",
            );

            parser.refer(&mut options.command_timeout).add_option(
                &["--command-timeout"],
                StoreOption,
                "Seconds before an external command is killed (default 20)",
            );
            parser.refer(&mut options.log_file).add_option(
                &["--log-file"],
                StoreOption,
                "File warnings are appended to, empty to disable \
                 (default logs.txt)",
            );
            parser.refer(&mut options.no_terminal).add_option(
                &["--no-terminal"],
                StoreTrue,
                "Do not print warnings on the standard output",
            );

            // Show daemon version
            parser.add_option(
                &["-V", "--version"],
                Print(env!("CARGO_PKG_VERSION").to_string()),
                "Show the daemon version",
            );

            parser.parse(args, stdout, stderr)?;
        }

        Ok(options)
    }
}
