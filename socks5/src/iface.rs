use std::io;
use std::net::Ipv4Addr;

/// 取网卡上的第一个 IPv4 地址，网卡不存在或没有 IPv4 地址时返回 `None`
pub fn interface_ipv4(name: &str) -> io::Result<Option<Ipv4Addr>> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(io::Error::from)?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|addr| addr.as_sockaddr_in()) {
            return Ok(Some(Ipv4Addr::from(sin.ip())));
        }
    }
    Ok(None)
}
