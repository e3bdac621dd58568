/*
 * datanode is a chatter data server. It durably stores a replica of user
 * credentials, chatroom ownership, and chat logs under
 * <data_dir>/files_<id>/, registers with the coordinator, and participates
 * in two-phase commit for all state changes.
 */

#![warn(clippy::all)]

use chatter::error::Result;
use chatter::DataNode;

use serde_derive::Deserialize;
use std::net::TcpListener;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/datanode.yaml"),
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
    let participant = TcpListener::bind(&cfg.listen_participant)?;

    let node = DataNode::new(
        &cfg.id,
        &cfg.host,
        std::path::Path::new(&cfg.data_dir),
        cfg.coordinator.parse()?,
    )?;
    node.serve(ops, participant)
}

#[derive(Debug, Deserialize)]
struct Config {
    id: String,
    host: String,
    coordinator: String,
    listen_ops: String,
    listen_participant: String,
    data_dir: String,
    log_level: String,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("id", "1")?
            .set_default("host", "127.0.0.1")?
            .set_default("coordinator", "127.0.0.1:9610")?
            .set_default("listen_ops", "0.0.0.0:9621")?
            .set_default("listen_participant", "0.0.0.0:9622")?
            .set_default("data_dir", "data")?
            .set_default("log_level", "info")?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("CHATTER"))
            .build()?
            .try_deserialize()?)
    }
}
