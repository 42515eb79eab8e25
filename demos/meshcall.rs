// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::Mutex;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{o, Discard, Drain, LevelFilter, Logger};

use mesh_rpc::{Client, Config, LogLevel, Method};

static APP: &str = "meshcall";
static DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making a single mesh RPC call")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Request method (Default: GET)")
                .long("method")
                .short("m")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("endpoint")
                .help("Endpoint path, e.g. /v1/status")
                .long("endpoint")
                .short("e")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("body")
                .help("Request body")
                .long("body")
                .short("b")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("header")
                .help("Request header as name=value, may be repeated")
                .long("header")
                .short("H")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Milliseconds to wait for the response (Default: 15000)")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log_level")
                .help("Log level (Default: WARN)")
                .long("log-level")
                .short("l")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("abandon")
                .help("Send without waiting for a response")
                .long("abandon-immediately")
                .short("a")
                .takes_value(false),
        )
        .get_matches()
}

fn stderr_logger(level: LogLevel) -> Logger {
    let level = match level.slog_level() {
        Some(level) => level,
        None => return Logger::root(Discard, o!()),
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!(),
    )
}

fn exit_with(msg: &str, e: &dyn std::fmt::Display) -> ! {
    eprintln!("{}: {}", msg, e);
    process::exit(1)
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let address = format!("{}:{}", host, port);
    let method = matches
        .value_of("method")
        .unwrap_or("GET")
        .parse::<Method>()
        .unwrap_or_else(|()| {
            eprintln!("Unsupported method");
            process::exit(1)
        });
    let endpoint = matches.value_of("endpoint").unwrap_or("/");
    let abandon = matches.is_present("abandon");
    let level = matches
        .value_of("log_level")
        .unwrap_or("WARN")
        .parse::<LogLevel>()
        .unwrap_or_else(|e| exit_with("Invalid log level", &e));

    let mut config = Config::default();
    if matches.is_present("timeout") {
        let ms = value_t!(matches, "timeout", u64).unwrap_or_else(|e| e.exit());
        config.timeout = Duration::from_millis(ms);
    }
    let log = stderr_logger(level);
    let client = Client::with_config(config, Some(&log))
        .unwrap_or_else(|e| exit_with("Invalid options", &e));
    let service = client.connect_with(&address, 1);

    let mut exchange = service
        .make_exchange(!abandon)
        .with_method(method)
        .with_endpoint(endpoint);
    if let Some(body) = matches.value_of("body") {
        exchange = exchange.with_body(body);
    }
    for header in matches.values_of("header").into_iter().flatten() {
        match header.split_once('=') {
            Some((name, value)) => exchange = exchange.with_header(name, value),
            None => exit_with("Invalid header", &header),
        }
    }
    let reply = exchange.reply();

    if let Err(e) = client.send(|_| (), vec![exchange]).await {
        exit_with("Failed to send request", &e)
    }

    if abandon {
        // Nothing comes back; give the writer a moment to put the request
        // on the wire before the connection is torn down.
        let connected = async {
            while service.connected() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        if tokio::time::timeout(client.config().timeout, connected).await.is_err() {
            eprintln!("Error: could not connect to {}", address);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    } else {
        match reply.wait().await {
            Ok(resp) => {
                eprintln!("status: {}", resp.status);
                println!("{}", String::from_utf8_lossy(&resp.body));
            }
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    if let Err(e) = client.close().await {
        eprintln!("Error: {}", e);
    }
}
