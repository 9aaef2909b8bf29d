use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use bandwidth::{Context, ListenerConfig};
use clap::Parser;
use log::{error, info, warn};
use socks5::{Config, Server, StaticCredentials, interface_ipv4};

/// 1 Mbit 对应的字节数
const BYTE2MEGABIT: i64 = 128 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "带宽限速的 SOCKS5 代理服务器")]
struct Args {
    /// 代理用户名
    #[arg(long, default_value = "")]
    user: String,

    /// 代理密码
    #[arg(long, default_value = "")]
    pass: String,

    /// UDP 中继使用的网卡，取其第一个 IPv4 地址
    #[arg(long, default_value = "lo")]
    inf: String,

    /// 直接指定 UDP 中继地址，优先于 --inf
    #[arg(long)]
    bind_ip: Option<IpAddr>,

    /// 监听端口
    #[arg(short, long, default_value_t = 1080)]
    port: u16,

    /// 上行速率，单位 Mbit/s，0 表示不限速
    #[arg(long, default_value_t = 0)]
    up: i64,

    /// 下行速率，单位 Mbit/s，0 表示不限速
    #[arg(long, default_value_t = 0)]
    down: i64,
}

fn megabits_to_bytes(mbit: i64) -> i64 {
    mbit.saturating_mul(BYTE2MEGABIT)
}

fn resolve_bind_ip(args: &Args) -> IpAddr {
    if let Some(ip) = args.bind_ip {
        return ip;
    }
    match interface_ipv4(&args.inf) {
        Ok(Some(ip)) => IpAddr::V4(ip),
        Ok(None) => {
            warn!("网卡 {} 没有 IPv4 地址，使用 127.0.0.1", args.inf);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
        Err(e) => {
            warn!("读取网卡 {} 失败: {}，使用 127.0.0.1", args.inf, e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let bind_ip = resolve_bind_ip(&args);

    let mut config = Config {
        bind_ip,
        bandwidth: ListenerConfig::simple(megabits_to_bytes(args.up), megabits_to_bytes(args.down)),
        ..Config::default()
    };
    if !args.user.is_empty() || !args.pass.is_empty() {
        let mut creds = StaticCredentials::new();
        creds.insert(args.user.as_str(), args.pass.as_str());
        config.credentials = Some(Arc::new(creds));
        info!("已启用用户名密码认证");
    }

    let ctx = Context::background();
    let shutdown = ctx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("收到退出信号");
                shutdown.cancel();
            }
            Err(e) => error!("监听退出信号失败: {}", e),
        }
    });

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);
    info!("上行限速 {} Mbit/s, 下行限速 {} Mbit/s (0 为不限速)", args.up, args.down);
    info!("UDP 中继地址: {}", bind_ip);

    let server = Arc::new(Server::new(config));
    server.listen_and_serve(ctx, addr).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_megabits_to_bytes() {
        assert_eq!(megabits_to_bytes(0), 0);
        assert_eq!(megabits_to_bytes(1), 131072);
        assert_eq!(megabits_to_bytes(i64::MAX), i64::MAX);
    }

    #[test]
    fn test_bind_ip_resolution() {
        let args = Args::parse_from(["socks5"]);
        assert_eq!(args.inf, "lo");
        assert_eq!(resolve_bind_ip(&args), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let args = Args::parse_from(["socks5", "--inf", "lo", "--bind-ip", "10.0.0.1"]);
        assert_eq!(resolve_bind_ip(&args), "10.0.0.1".parse::<IpAddr>().unwrap());

        let args = Args::parse_from(["socks5", "--inf", "no-such-if0"]);
        assert_eq!(resolve_bind_ip(&args), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
