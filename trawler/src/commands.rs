use crate::CLAP_STYLING;
use clap::{ArgAction, arg, command};
use url::Url;

pub fn command_argument_builder() -> clap::Command {
    clap::Command::new("trawler")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("trawler")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").global(true))
        .arg(
            arg!(-v --"verbose" ... "Increase log verbosity (-v info, -vv debug, -vvv trace)")
                .global(true),
        )
        .arg(
            arg!(-c --"config" <PATH>)
                .required(false)
                .global(true)
                .help("Config file (default: ~/.config/trawler/config.toml)")
                .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Writes a default trawler config file")
                .arg(
                    arg!([PATH])
                        .required(false)
                        .help("Where to write the config file")
                        .default_value("~/.config/trawler/config.toml"),
                )
                .arg(
                    arg!(-f --"force")
                        .help("Overwrite an existing config file")
                        .required(false),
                ),
        )
        .subcommand(
            command!("crawl")
                .about("Crawl a host or collection of hosts and report what was found")
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(false)
                        .help("The URL to crawl")
                        .value_parser(clap::value_parser!(Url))
                        .conflicts_with("hosts-file"),
                )
                .arg(
                    arg!(-H --"hosts-file" <PATH>)
                        .required(false)
                        .help("Path to a newline-delimited file of URLs to crawl")
                        .value_parser(clap::value_parser!(std::path::PathBuf))
                        .conflicts_with("url"),
                )
                .arg(
                    arg!(-w --"workers" <NUM_WORKERS>)
                        .required(false)
                        .help("How many seeds are crawled concurrently")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(-d --"depth" <DEPTH>)
                        .required(false)
                        .help("Maximum link depth from each seed (0 = unlimited)")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(-p --"pages" <PAGES>)
                        .required(false)
                        .help("Maximum pages per seed (0 = unlimited)")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"delay" <MS>)
                        .required(false)
                        .help("Delay between requests in milliseconds")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    arg!(--"follow-external")
                        .required(false)
                        .help("Follow links to other domains")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"allow-domain" <DOMAIN>)
                        .required(false)
                        .help("Only crawl these domains (repeatable)")
                        .action(ArgAction::Append),
                )
                .arg(
                    arg!(--"filter" <REGEX>)
                        .required(false)
                        .help("Skip URLs matching this pattern (repeatable)")
                        .action(ArgAction::Append),
                )
                .arg(
                    arg!(--"backend" <BACKEND>)
                        .required(false)
                        .help("Crawl backend: frontier (in-process) or bridge (worker process)")
                        .value_parser(["frontier", "bridge"]),
                )
                .arg(
                    arg!(--"dynamic")
                        .required(false)
                        .help("Render script-heavy pages in the sandbox")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"worker-program" <PROGRAM>)
                        .required(false)
                        .help("Program launched by the bridge backend"),
                )
                .arg(
                    arg!(--"worker-script" <PATH>)
                        .required(false)
                        .help("Script passed to the worker program")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save report to file (default: display to screen)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Report format: text, json, markdown")
                        .value_parser(["text", "json", "markdown"])
                        .default_value("text"),
                ),
        )
}
