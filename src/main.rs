use std::{
    env, fmt,
    net::{IpAddr, Ipv6Addr, SocketAddr},
    process,
    str::FromStr,
};

mod ikev2;
mod logger;

const DEFAULT_PORT: u16 = 500;
const DEFAULT_ID: &str = "ikev2d";

enum Action {
    Serve(ikev2::Config),
    Connect(ikev2::Config),
}

pub struct Args {
    log_level: log::LevelFilter,
    action: Action,
}

const USAGE_INSTRUCTIONS: &str = "Usage: ikev2d [OPTIONS] <serve|connect>\n\n\
Actions:\
\n  serve                                Respond to IKEv2 peers\
\n  connect                              Establish an IKE SA with --remote, then keep responding\
\n\n\
Options:\
\n      --log-level=<LOG_LEVEL>          Log level [default: info]\
\n      --listen-ip=<IP>                 Listen IP address, multiple options can be provided [default: ::]\
\n      --port=<PORT>                    Listen UDP port [default: 500]\
\n      --id=<FQDN>                      Hostname for identification [default: ikev2d]\
\n      --psk=<KEY>                      Pre-shared key used for authentication\
\n      --remote=<IP:PORT>               Peer address for the connect action\
\n      --cookies                        Require stateless cookies for every IKE_SA_INIT\
\n      --legacy-sk-px                   Size SK_pi and SK_pr by the integrity key length\
\n      --help                           Print help";

impl Args {
    fn parse() -> Args {
        let fail_with_error = |name: &str, value: &str, err: fmt::Arguments| {
            eprintln!(
                "Argument {} has an unsupported value {}: {}",
                name, value, err
            );
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        let mut log_level = log::LevelFilter::Info;
        let mut listen_ips = vec![];
        let mut port = DEFAULT_PORT;
        let mut id = None;
        let mut psk = None;
        let mut remote = None;
        let mut require_cookies = false;
        let mut sk_px = ikev2::SkPxLength::Prf;

        for arg in env::args()
            .take(env::args().len().saturating_sub(1))
            .skip(1)
        {
            if arg == "--help" || arg == "help" {
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(0);
            }
            // Boolean switches may omit the value.
            let (name, value) = if let Some(arg) = arg.split_once('=') {
                arg
            } else if arg == "--cookies" || arg == "--legacy-sk-px" {
                (arg.as_str(), "true")
            } else {
                eprintln!("Option flag {} has no value", arg);
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            };

            if name == "--log-level" {
                log_level = match value.to_uppercase().as_str() {
                    "TRACE" => log::LevelFilter::Trace,
                    "DEBUG" => log::LevelFilter::Debug,
                    "INFO" => log::LevelFilter::Info,
                    "WARN" => log::LevelFilter::Warn,
                    "ERROR" => log::LevelFilter::Error,
                    "OFF" => log::LevelFilter::Off,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported log level"));
                        process::exit(2);
                    }
                };
            } else if name == "--listen-ip" {
                match IpAddr::from_str(value) {
                    Ok(ip) => {
                        listen_ips.push(ip);
                    }
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IP address: {}", err),
                    ),
                };
            } else if name == "--port" {
                match u16::from_str(value) {
                    Ok(value) => port = value,
                    Err(err) => {
                        fail_with_error(name, value, format_args!("Failed to parse port: {}", err))
                    }
                };
            } else if name == "--id" {
                id = Some(value.to_string());
            } else if name == "--psk" {
                psk = Some(value.to_string());
            } else if name == "--remote" {
                match SocketAddr::from_str(value) {
                    Ok(addr) => remote = Some(addr),
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse socket address: {}", err),
                    ),
                };
            } else if name == "--cookies" || name == "--legacy-sk-px" {
                let enabled = match bool::from_str(value) {
                    Ok(enabled) => enabled,
                    Err(err) => {
                        fail_with_error(name, value, format_args!("Not a boolean: {}", err));
                        process::exit(2);
                    }
                };
                if name == "--cookies" {
                    require_cookies = enabled;
                } else if enabled {
                    sk_px = ikev2::SkPxLength::Integrity;
                } else {
                    sk_px = ikev2::SkPxLength::Prf;
                }
            } else {
                eprintln!("Unsupported argument {}", arg);
            }
        }

        let action = if let Some(action) = env::args().last() {
            action
        } else {
            eprintln!("No action specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        let psk = if let Some(psk) = psk {
            psk
        } else {
            eprintln!("No pre-shared key specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };
        if listen_ips.is_empty() {
            listen_ips = vec![IpAddr::V6(Ipv6Addr::UNSPECIFIED)];
        }
        let id = id.unwrap_or_else(|| DEFAULT_ID.to_string());
        let mut engine = ikev2::EngineConfig::new(
            ikev2::Identification::fqdn(&id),
            ikev2::Credentials::shared_key(psk.as_bytes()),
        );
        engine.require_cookies = require_cookies;
        engine.sk_px = sk_px;

        match action.as_str() {
            "serve" => {
                let action = Action::Serve(ikev2::Config {
                    listen_ips,
                    port,
                    engine,
                    remote: None,
                });
                Args { log_level, action }
            }
            "connect" => {
                if remote.is_none() {
                    eprintln!("The connect action needs --remote");
                    println!("{}", USAGE_INSTRUCTIONS);
                    process::exit(2);
                }
                let action = Action::Connect(ikev2::Config {
                    listen_ips,
                    port,
                    engine,
                    remote,
                });
                Args { log_level, action }
            }
            _ => {
                eprintln!("No action specified");
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            }
        }
    }
}

fn main() {
    println!(
        "ikev2d version {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    let args = Args::parse();

    if let Err(err) = logger::setup_logger(args.log_level) {
        eprintln!("Failed to set up logger, error is {}", err);
    }
    let config = match args.action {
        Action::Serve(config) => config,
        Action::Connect(config) => config,
    };
    let server = ikev2::Server::new(config);
    if let Err(err) = server.run() {
        println!("Failed to run server, error is {}", err);
        process::exit(1);
    }
}
