// File: ./src/cli.rs
//! Command-line parsing and help text for the `roomcal` binary.
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub root: Option<PathBuf>,
    /// Calendar ids given with `--select`, in order.
    pub select: Vec<String>,
    pub select_all: bool,
    /// Print the calendar list and exit.
    pub list: bool,
    pub help: bool,
}

impl CliArgs {
    /// Parses arguments, skipping the binary name. Unknown flags are ignored.
    pub fn parse(args: &[String]) -> Self {
        let mut parsed = CliArgs::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--root" | "-r" => {
                    if i + 1 < args.len() {
                        parsed.root = Some(args[i + 1].clone().into());
                        i += 1;
                    }
                }
                "--select" | "-s" => {
                    if i + 1 < args.len() {
                        parsed.select.push(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--all" | "-a" => parsed.select_all = true,
                "--list" | "-l" => parsed.list = true,
                "--help" | "-h" | "help" => parsed.help = true,
                _ => {}
            }
            i += 1;
        }
        parsed
    }
}

pub fn print_help(binary_name: &str) {
    println!(
        "Roomcal v{} - Live room calendar sync over push subscriptions",
        env!("CARGO_PKG_VERSION")
    );
    println!();
    println!("USAGE:");
    println!("    {} [--root <path>] [--select <calendarId>]... [--all]", binary_name);
    println!("    {} --list", binary_name);
    println!("    {} --help", binary_name);
    println!();
    println!("OPTIONS:");
    println!("    -r, --root <path>        Use a different directory for config and data.");
    println!("    -s, --select <id>        Select a calendar by backend id (repeatable).");
    println!("    -a, --all                Select every calendar once the list is loaded.");
    println!("    -l, --list               Print the available calendars and exit.");
    println!("    -h, --help               Show this help message.");
    println!();
    println!("CONFIG:");
    println!("    config.toml lives in the config directory (or <root>/config).");
    println!("    The access token is read from `access_token`, `token_command`,");
    println!("    or the ROOMCAL_ACCESS_TOKEN environment variable.");
    println!();
    println!("Press Ctrl-C to stop; subscriptions are deleted on the way out.");
}
