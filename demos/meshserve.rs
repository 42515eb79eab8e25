// Copyright 2020 Joyent, Inc.

use std::fs;
use std::process;
use std::sync::Mutex;

use chrono::prelude::*;
use clap::{crate_version, App, Arg, ArgMatches};
use serde_derive::{Deserialize, Serialize};
use slog::{debug, error, info, o, Discard, Drain, LevelFilter, Logger};

use mesh_rpc::{
    new_endpoint, new_root_endpoint, Config, Endpoint, Error, LogLevel,
    Response, Server,
};

static APP: &str = "meshserve";
static DEFAULT_ADDRESS: &str = "127.0.0.1:2030";

#[derive(Serialize, Deserialize)]
struct StatusPayload {
    service: String,
    version: String,
}

#[derive(Serialize, Deserialize)]
struct DatePayload {
    timestamp: i64,
    iso8601: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct UserPayload {
    id: u64,
}

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Serves a handful of demonstration endpoints over mesh RPC")
        .version(crate_version!())
        .arg(
            Arg::with_name("address")
                .help("Address to listen on (Default: 127.0.0.1:2030)")
                .long("address")
                .short("a")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .help("JSON configuration file")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log_level")
                .help("Log level, overriding the configuration file")
                .long("log-level")
                .short("l")
                .takes_value(true),
        )
        .get_matches()
}

fn json_body<T: serde::Serialize>(resp: &mut Response, payload: &T) -> Result<(), Error> {
    resp.body =
        serde_json::to_vec(payload).map_err(|e| Error::handler(e.to_string()))?;
    resp.status = 200;
    resp.add_header("content-type", "application/json");
    Ok(())
}

fn routes(log: &Logger) -> Result<Endpoint, Error> {
    let root = new_root_endpoint();
    let v1 = root.sub(&new_endpoint("v1")?)?;

    let status_log = log.clone();
    v1.sub(&new_endpoint("status")?)?.get(move |_, resp, _| {
        debug!(status_log, "handling status request");
        json_body(
            resp,
            &StatusPayload {
                service: APP.to_string(),
                version: crate_version!().to_string(),
            },
        )
    });

    let date_log = log.clone();
    v1.sub(&new_endpoint("date")?)?.get(move |_, resp, _| {
        debug!(date_log, "handling date request");
        let now = Utc::now();
        json_body(
            resp,
            &DatePayload {
                timestamp: now.timestamp_millis(),
                iso8601: now,
            },
        )
    });

    let echo = v1.sub(&new_endpoint("echo")?)?;
    echo.post(|req, resp, _| {
        resp.body = req.body.clone();
        resp.status = 200;
        Ok(())
    });
    echo.put(|req, resp, _| {
        resp.body = req.body.clone();
        resp.status = 200;
        Ok(())
    });

    // The first handler refuses ids that are not numbers; the second one
    // only runs for ids that are.
    let users = v1.sub(&new_endpoint("users")?)?;
    users.sub(&new_endpoint(":id")?)?
        .get(|req, resp, next| {
            match req.header(":id").map(str::parse::<u64>) {
                Some(Ok(_)) => next.call(req, resp),
                _ => {
                    resp.status = 400;
                    resp.body = b"user id must be a number".to_vec();
                    Ok(())
                }
            }
        })
        .get(|req, resp, _| {
            let id = req
                .header(":id")
                .and_then(|id| id.parse().ok())
                .ok_or_else(|| Error::handler("missing user id"))?;
            json_body(resp, &UserPayload { id })
        });

    Ok(root)
}

fn load_config(matches: &ArgMatches) -> Result<Config, Error> {
    let mut config = match matches.value_of("config") {
        Some(path) => Config::from_json(&fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    if let Some(level) = matches.value_of("log_level") {
        config.log_level = level.parse::<LogLevel>()?;
    }
    Ok(config)
}

fn root_logger(level: LogLevel) -> Logger {
    let level = match level.slog_level() {
        Some(level) => level,
        None => return Logger::root(Discard, o!()),
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    )
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let config = load_config(&matches).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        process::exit(1)
    });
    let log = root_logger(config.log_level);
    let address = matches.value_of("address").unwrap_or(DEFAULT_ADDRESS);

    let root = routes(&log).unwrap_or_else(|e| {
        error!(log, "failed to build endpoints"; "err" => %e);
        process::exit(1)
    });
    let mut server = Server::with_config(address, config, Some(&log))
        .unwrap_or_else(|e| {
            error!(log, "invalid configuration"; "err" => %e);
            process::exit(1)
        });
    server.register(root);

    let addr = server.start().await.unwrap_or_else(|e| {
        error!(log, "failed to start"; "address" => address, "err" => %e);
        process::exit(1)
    });
    info!(log, "listening for mesh requests"; "address" => %addr);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(log, "failed to wait for interrupt"; "err" => %e);
    }
    if let Err(e) = server.stop().await {
        error!(log, "failed to stop"; "err" => %e);
    }
}
