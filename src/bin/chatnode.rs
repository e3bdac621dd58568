/*
 * chatnode is a chatter chat server. It hosts live chatrooms placed on it
 * by the coordinator, accepts client subscriber streams over TCP, fans
 * published messages out to subscribers, and submits every message to the
 * coordinator for durable logging.
 */

#![warn(clippy::all)]

use chatter::error::Result;
use chatter::ChatNode;

use serde_derive::Deserialize;
use std::net::TcpListener;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/chatnode.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("chatter");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let ops = TcpListener::bind(&cfg.listen_ops)?;
    let rpc = TcpListener::bind(&cfg.listen_rpc)?;
    let streams = TcpListener::bind(&cfg.listen_stream)?;

    ChatNode::new(cfg.host, cfg.coordinator.parse()?).serve(ops, rpc, streams)
}

#[derive(Debug, Deserialize)]
struct Config {
    host: String,
    coordinator: String,
    listen_ops: String,
    listen_rpc: String,
    listen_stream: String,
    log_level: String,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("host", "127.0.0.1")?
            .set_default("coordinator", "127.0.0.1:9610")?
            .set_default("listen_ops", "0.0.0.0:9631")?
            .set_default("listen_rpc", "0.0.0.0:9632")?
            .set_default("listen_stream", "0.0.0.0:9633")?
            .set_default("log_level", "info")?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("CHATTER"))
            .build()?
            .try_deserialize()?)
    }
}
