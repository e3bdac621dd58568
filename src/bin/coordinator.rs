/*
 * coordinator is the chatter central server. It takes configuration via a
 * configuration file and environment variables, then serves four remote
 * surfaces: node registration, client user operations, chat-node message
 * logging, and participant transaction decisions.
 */

#![warn(clippy::all)]

use chatter::error::Result;
use chatter::Coordinator;

use serde_derive::Deserialize;
use std::net::TcpListener;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/coordinator.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("chatter");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let registry = TcpListener::bind(&cfg.listen_registry)?;
    let users = TcpListener::bind(&cfg.listen_users)?;
    let chatlog = TcpListener::bind(&cfg.listen_chatlog)?;
    let decisions = TcpListener::bind(&cfg.listen_decisions)?;

    Coordinator::new().serve(registry, users, chatlog, decisions)
}

#[derive(Debug, Deserialize)]
struct Config {
    listen_registry: String,
    listen_users: String,
    listen_chatlog: String,
    listen_decisions: String,
    log_level: String,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("listen_registry", "0.0.0.0:9610")?
            .set_default("listen_users", "0.0.0.0:9611")?
            .set_default("listen_chatlog", "0.0.0.0:9612")?
            .set_default("listen_decisions", "0.0.0.0:9613")?
            .set_default("log_level", "info")?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("CHATTER"))
            .build()?
            .try_deserialize()?)
    }
}
