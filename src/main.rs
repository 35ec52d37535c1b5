//! An HTTP/1.1 server with nginx-style configuration.
//!
//! Call it like this:
//!
//!     webserv -c webserv.conf
//!
//! The config file is a block grammar in the spirit of nginx. Here is an
//! example:
//!
//! ```text
//! server {
//!     listen 127.0.0.1:8080 default_server;
//!     server_name localhost;
//!     root /var/www/site;
//!     error_page 404 /errors/404.html;
//!
//!     location /uploads {
//!         methods GET POST DELETE;
//!         upload_store /var/www/site/uploads;
//!         client_max_body_size 10m;
//!     }
//!
//!     location /cgi-bin {
//!         cgi_handler .py /usr/bin/python3;
//!     }
//!
//!     location /old {
//!         return 301 /new;
//!     }
//! }
//! ```
//!
//! Every `(host, port)` pair named by a `listen` is bound once. Requests are
//! matched to a server block by `Host`, then to a location by path. Errors
//! in the file are reported with their line and column, and the server
//! refuses to start.

#[macro_use] extern crate log;

mod cgi;
mod config;
mod errors;
mod filesystem;
mod log_util;
mod server;

use crate::config::parser::{self, parse_file};
use crate::server::serve;

use clap::{value_parser, Arg, ArgAction, ArgGroup, Command};
use log::LevelFilter;

use std::env;
use std::io::{stderr, Write};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

fn main() {
    let matches = Command::new("webserv")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Serves static files, CGI scripts and uploads over HTTP/1.1")
        .arg(Arg::new("config")
             .short('c')
             .long("config")
             .value_name("FILE")
             .help("The server configuration file")
             .value_parser(value_parser!(PathBuf)))
        .arg(Arg::new("config_path")
             .value_name("CONFIG")
             .help("The server configuration file, as a positional argument")
             .value_parser(value_parser!(PathBuf)))
        .group(ArgGroup::new("config_file")
               .args(["config", "config_path"])
               .required(true))
        .arg(Arg::new("verbose")
             .short('v')
             .long("verbose")
             .help("Log at debug level")
             .action(ArgAction::SetTrue))
        .arg(Arg::new("workers")
             .short('w')
             .long("workers")
             .value_name("N")
             .help("Number of worker threads")
             .value_parser(value_parser!(u64).range(1..=4096)))
        .arg(Arg::new("cgi_timeout")
             .long("cgi-timeout")
             .value_name("SECONDS")
             .help("Wall-clock limit for each CGI script")
             .value_parser(value_parser!(u64).range(1..)))
        .get_matches();

    let mut log_builder = env_logger::Builder::new();
    log_builder.filter_level(if matches.get_flag("verbose") {
        LevelFilter::Debug
    }
    else {
        LevelFilter::Info
    });

    if let Ok(var) = env::var("WEBSERV_LOG") {
        log_builder.parse_filters(&var);
    }

    if let Err(e) = log_builder.try_init() {
        let _ = writeln!(stderr(), "webserv: Error when initializing logging: {}", e);
        exit(1);
    }

    let config_file = match matches.get_one::<PathBuf>("config")
        .or_else(|| matches.get_one::<PathBuf>("config_path"))
    {
        Some(path) => path,
        None => {
            error!("No configuration file given");
            exit(1);
        },
    };

    let mut config = match parse_file(config_file) {
        Ok(c) => c,
        Err(parser::Error::Io(e)) => {
            error!("Error opening config file {:?}: {}", config_file, e);
            exit(1);
        },
        Err(parser::Error::Syntax(m)) => {
            error!("Config file syntax error at line {} column {}: {}", m.line, m.column, m.desc);
            exit(1);
        },
        Err(parser::Error::Validation(m)) => {
            error!("Config file error at line {} column {}: {}", m.line, m.column, m.desc);
            exit(1);
        },
    };

    if let Some(&workers) = matches.get_one::<u64>("workers") {
        config.limits.workers = workers as usize;
    }
    if let Some(&seconds) = matches.get_one::<u64>("cgi_timeout") {
        config.limits.cgi_timeout = Duration::from_secs(seconds);
    }

    if let Err(e) = ctrlc::set_handler(|| {
        info!("Shutting down");
        exit(0);
    }) {
        error!("Could not install the signal handler: {}", e);
        exit(1);
    }

    info!("Starting webserv with {} server block(s) from {:?}",
          config.servers.len(), config_file);
    if let Err(e) = serve(config) {
        error!("Server stopped: {}", e);
        exit(1);
    }
}
