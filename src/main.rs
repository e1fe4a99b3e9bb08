use std::net::SocketAddr;

use clap::Parser;
use log::error;

use webgate::{config::Config, server::Server};

#[derive(Parser, Debug)]
#[clap(
    name = "webgate",
    about = "forward HTTP/HTTPS proxy gateway with host authorization",
    version
)]
struct Args {
    /// configuration file (TOML); compiled-in defaults apply when absent
    #[clap(short = 'c', long = "config")]
    config: Option<String>,
    /// override the proxy listener address
    #[clap(long = "proxy-addr")]
    proxy_addr: Option<SocketAddr>,
    /// override the administrative listener address
    #[clap(long = "admin-addr")]
    admin_addr: Option<SocketAddr>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(addr) = args.proxy_addr {
        config.proxy_addr = addr;
    }
    if let Some(addr) = args.admin_addr {
        config.admin_addr = addr;
    }

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = server.run() {
        error!("event loop failed: {}", e);
        std::process::exit(1);
    }
}
