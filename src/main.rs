use clap::Arg;
use fyr::prelude::*;
use fyr::{HandlerRegistry, Manager, Settings};
use std::process::ExitCode;

const ABOUT: &str = "\nA TLS-terminating Gemini server.\n\
\n\
The configuration root holds two directories: servers/ with one listener \
per YAML file (name, host, port, cert, key) and handlers/ with one request \
handler per YAML file (handler, server, plus handler-specific keys).";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let command = clap::command!()
        .about(ABOUT)
        .arg(
            Arg::new("log")
                .short('l')
                .long("log")
                .value_name("LEVEL")
                .help("Log level: debug, info, warn, error or none.")
                .default_value("info"),
        )
        .arg(
            Arg::new("colors")
                .long("colors")
                .value_name("yes|no")
                .help("Colored log output.")
                .default_value("yes"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .value_name("yes|no")
                .help("Log every internal step; overrides --log.")
                .default_value("no"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("DIR")
                .help("Configuration root containing servers/ and handlers/.")
                .default_value("."),
        );

    let matches = match command.try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let level = match matches.get_one::<String>("log").unwrap().as_str() {
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "none" => log::LevelFilter::Off,
        other => {
            eprintln!("unknown log level {other:?}");
            return ExitCode::FAILURE;
        }
    };
    let Some(colors) = yes_no(matches.get_one::<String>("colors").unwrap()) else {
        eprintln!("--colors takes yes or no");
        return ExitCode::FAILURE;
    };
    let verbose = match yes_no(matches.get_one::<String>("verbose").unwrap()) {
        Some(verbose) => verbose,
        None => {
            eprintln!("--verbose takes yes or no");
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::new()
        .filter_level(if verbose {
            log::LevelFilter::Trace
        } else {
            level
        })
        .write_style(if colors {
            env_logger::WriteStyle::Always
        } else {
            env_logger::WriteStyle::Never
        })
        .init();

    let config_root = PathBuf::from(matches.get_one::<String>("config").unwrap());
    info!("{} starting, config root {}", fyr::SERVER_SOFTWARE, config_root.display());

    let settings = match Settings::load(&config_root) {
        Ok(settings) => settings,
        Err(err) => {
            error!("reading configuration under {}: {err}", config_root.display());
            return ExitCode::FAILURE;
        }
    };
    if settings.servers.is_empty() {
        error!(
            "no usable listener in {}; nothing to serve",
            config_root.join("servers").display()
        );
        return ExitCode::FAILURE;
    }

    let registry = HandlerRegistry::with_defaults();
    let manager = match Manager::from_settings(&settings, &registry) {
        Ok(manager) => manager,
        Err(_) => return ExitCode::FAILURE,
    };

    match manager.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn yes_no(value: &str) -> Option<bool> {
    match value {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}
