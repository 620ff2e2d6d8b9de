use clap::ArgMatches;
use colored::Colorize;
use std::path::PathBuf;
use tracing::Level;
use trawler::commands::command_argument_builder;
use trawler::handlers::{handle_crawl, handle_init};
use trawler_core::print_banner;

#[tokio::main]
async fn main() {
    let chosen_command = command_argument_builder().get_matches();
    let quiet = chosen_command.get_flag("quiet");

    init_logging(&chosen_command, quiet);

    // Show banner unless --quiet flag is set
    if !quiet {
        print_banner();
    }

    let config_path = chosen_command.get_one::<PathBuf>("config").cloned();

    let outcome = match chosen_command.subcommand() {
        None => return,
        Some(("init", primary_command)) => handle_init(primary_command),
        Some(("crawl", primary_command)) => {
            handle_crawl(primary_command, config_path.as_deref(), quiet).await
        }
        _ => unreachable!("clap should ensure we don't get here"),
    };

    if let Err(e) = outcome {
        eprintln!("{} {:#}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(matches: &ArgMatches, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match matches.get_count("verbose") {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
