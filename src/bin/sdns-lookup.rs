use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sdns::{AddrInfoHints, SdnsConfig, SdnsEnv, SockType, load_config};

#[derive(Parser, Debug)]
#[command(author, version, about = "Resolve names through the sdns cache", long_about = None)]
struct Args {
    /// 配置文件路径（JSON），缺省使用内置默认值
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// 要解析的域名，可重复；每个名字会查询 `--rounds` 次
    #[arg(required = true)]
    names: Vec<String>,
    /// 服务名或端口，如 http / 443
    #[arg(short = 's', long = "service")]
    service: Option<String>,
    /// 每个名字查询轮数，第二轮起应命中缓存
    #[arg(long = "rounds", default_value_t = 2)]
    rounds: usize,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// 以 JSON 格式输出日志
    #[arg(long = "json-log", default_value_t = false)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.json_log);

    let cfg = match &args.config {
        Some(path) => load_config(path).context("load config")?,
        None => SdnsConfig::default(),
    };
    let env = SdnsEnv::init(cfg).context("init resolution environment")?;

    let hints = AddrInfoHints {
        socktype: SockType::Stream,
        canonname: true,
        ..Default::default()
    };

    for name in &args.names {
        for round in 0..args.rounds.max(1) {
            let start = std::time::Instant::now();
            match env.getaddrinfo(name, args.service.as_deref(), Some(&hints)).await {
                Ok(list) => {
                    let addrs: Vec<String> = list.addrs().map(|a| a.to_string()).collect();
                    let canon = list.first().and_then(|ai| ai.canonname.as_deref()).unwrap_or(name.as_str());
                    println!(
                        "{canon} [{round}] {} ({} us)",
                        addrs.join(" "),
                        start.elapsed().as_micros()
                    );
                }
                Err(err) => {
                    error!(qname = %name, error = %err, "lookup failed");
                    println!("{name} [{round}] error: {err}");
                }
            }
        }
    }

    let status = env.cache_status();
    info!(%status, "cache status");
    println!("{status}");
    env.destroy();
    Ok(())
}

fn init_tracing(debug: bool, json: bool) {
    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_level(debug)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
