use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use genserve_core::Servable;
use salvo::{
    affix_state,
    cors::{AllowHeaders, AllowOrigin, Cors},
    http::Method,
    logging::Logger,
    prelude::*,
    Router,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, BufReader},
};

use crate::types::AppState;

mod api;
mod config;
mod types;

pub async fn load_config(path: impl AsRef<Path>) -> Result<config::Config> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut contents = String::new();
    reader.read_to_string(&mut contents).await?;
    Ok(toml::from_str(&contents)?)
}

/// Loads every configured servable. Names must be unique.
pub fn load_servables(config: &config::Config) -> Result<Vec<Servable>> {
    if config.servables.is_empty() {
        bail!("no servables configured");
    }
    let mut servables: Vec<Servable> = Vec::with_capacity(config.servables.len());
    for servable in &config.servables {
        if servables.iter().any(|loaded| loaded.name() == servable.name) {
            bail!("duplicated servable name: {}", servable.name);
        }
        let loaded = genserve_core::initialize(servable)
            .with_context(|| format!("failed to load servable {}", servable.name))?;
        servables.push(loaded);
    }
    Ok(servables)
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(long, short)]
    ip: Option<IpAddr>,
    #[arg(long, short)]
    port: Option<u16>,
    /// Log level of the server and core crates.
    #[arg(long, short, default_value = "info", value_parser = parse_level)]
    log_level: log::LevelFilter,
}

fn parse_level(level: &str) -> Result<log::LevelFilter, String> {
    level
        .parse()
        .map_err(|_| format!("unknown log level: {level}"))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("genserve_server", args.log_level)
        .with_module_level("genserve_core", args.log_level)
        .init()
        .expect("start logger");

    let cmd = Args::command();
    let version = cmd.get_version().unwrap_or("0.0.1");
    let bin_name = cmd.get_bin_name().unwrap_or("genserve_server");

    log::info!("{}\tversion: {}", bin_name, version);

    let config = {
        let path = args
            .config
            .clone()
            .unwrap_or("assets/configs/Config.toml".into());
        log::info!("reading config {}...", path.to_string_lossy());
        load_config(path).await.expect("load config failed")
    };
    let listen = config.listen.clone();

    let servables = load_servables(&config).expect("load servables failed");
    let state = AppState::new(servables);

    let cors = Cors::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(vec![Method::GET, Method::POST])
        .allow_headers(AllowHeaders::any())
        .into_handler();

    let api_router = Router::new()
        .push(Router::with_path("/models").get(api::oai::models))
        .push(Router::with_path("/v1/models").get(api::oai::models))
        .push(Router::with_path("/completions").post(api::oai::completions))
        .push(Router::with_path("/v1/completions").post(api::oai::completions))
        .push(Router::with_path("/chat/completions").post(api::oai::chat_completions))
        .push(Router::with_path("/v1/chat/completions").post(api::oai::chat_completions))
        .push(Router::with_path("/tokenize").post(api::oai::tokenize))
        .push(Router::with_path("/v1/tokenize").post(api::oai::tokenize));

    let app = Router::new()
        .hoop(Logger::new())
        .hoop(affix_state::inject(state))
        .push(Router::with_path("/v3").push(api_router));

    let doc = OpenApi::new(bin_name, version).merge_router(&app);

    let app = app
        .push(doc.into_router("/api-docs/openapi.json"))
        .push(SwaggerUi::new("/api-docs/openapi.json").into_router("api-docs"));

    let service = Service::new(app).hoop(cors);
    let ip_addr = args.ip.unwrap_or(listen.ip);
    let port = args.port.unwrap_or(listen.port);
    let addr = SocketAddr::new(ip_addr, port);

    let url = match ip_addr {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED) | IpAddr::V4(Ipv4Addr::UNSPECIFIED) => "localhost".into(),
        IpAddr::V6(addr) => format!("[{addr}]"),
        IpAddr::V4(addr) => addr.to_string(),
    };
    log::info!("serving at http://{url}:{port}/v3");

    let acceptor = TcpListener::new(addr).bind().await;
    salvo::server::Server::new(acceptor).serve(service).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicated_servable_names() {
        let servable = genserve_core::ServableConfig {
            name: "echo".into(),
            models_path: "does/not/exist".into(),
            ..Default::default()
        };
        let config = config::Config {
            servables: vec![servable.clone(), servable],
            ..Default::default()
        };
        assert!(load_servables(&config).is_err());
        assert!(load_servables(&config::Config::default()).is_err());
    }

    #[test]
    fn test_parse_args() {
        let args = Args::parse_from(["genserve", "-c", "config.toml", "--port", "9000", "-l", "debug"]);
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.log_level, log::LevelFilter::Debug);
        assert_eq!(args.config, Some(PathBuf::from("config.toml")));
    }
}
