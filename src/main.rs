use clap::{Arg, Command};
use log::LevelFilter;
use spamd_milter::{Config, Milter};
use std::process;

#[tokio::main]
async fn main() {
    let matches = Command::new("spamd-milter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Milter that scores messages through SpamAssassin's spamd")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/spamd-milter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("socket")
                .short('p')
                .long("socket")
                .value_name("PATH")
                .help("Milter socket path (overrides the config file)")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("spamd-user")
                .short('U')
                .long("spamd-user")
                .value_name("NAME")
                .help("Per-user settings name passed to spamd (overrides the config file)")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("ignore-connect")
                .short('i')
                .long("ignore-connect")
                .value_name("REGEX")
                .help("Accept matching client hosts/addresses without scoring")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging (all log output goes to stderr)")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    // Initialize logger based on verbose flag
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if let Some(socket) = matches.get_one::<String>("socket") {
        config.socket_path = socket.clone();
    }
    if let Some(user) = matches.get_one::<String>("spamd-user") {
        config.spamd_user = Some(user.clone());
    }
    if let Some(pattern) = matches.get_one::<String>("ignore-connect") {
        config.ignore_connect = Some(pattern.clone());
    }

    if matches.get_flag("test-config") {
        match config.ignore_matcher() {
            Ok(_) => {
                println!("Configuration OK");
                println!("  milter socket: {}", config.socket_path);
                println!("  spamd: {}", config.spamd_endpoint());
                if let Some(user) = &config.spamd_user {
                    println!("  spamd user: {user}");
                }
                if let Some(pattern) = &config.ignore_connect {
                    println!("  ignore connect: {pattern}");
                }
            }
            Err(e) => {
                eprintln!("Configuration invalid: {e}");
                process::exit(1);
            }
        }
        return;
    }

    let milter = match Milter::new(config.clone()) {
        Ok(milter) => milter,
        Err(e) => {
            eprintln!("Error initializing milter: {e}");
            process::exit(1);
        }
    };

    log::info!("spamd-milter starting, spamd at {}", config.spamd_endpoint());
    if let Err(e) = milter.run(&config.socket_path).await {
        log::error!("Milter error: {e}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Config file {path} not found, using defaults");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => println!("Generated default configuration at {path}"),
        Err(e) => {
            eprintln!("Error generating configuration: {e}");
            process::exit(1);
        }
    }
}
