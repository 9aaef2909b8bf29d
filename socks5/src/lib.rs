//! 带分层带宽限速的 SOCKS5 代理服务端
//!
//! 支持 CONNECT 和 UDP ASSOCIATE，BIND 总是回复不支持。
//! 所有连接都经过 [`bandwidth`] 的服务端级和连接级限速。

mod auth;
mod context;
mod dialer;
mod error;
mod iface;
mod protocol;
mod relay;
mod request;
mod resolver;
mod ruleset;
mod server;
mod udp;

pub use auth::{
    AsyncStream, AuthContext, Authenticator, CredentialStore, NO_ACCEPTABLE, NO_AUTH, NoAuth,
    StaticCredentials, USER_PASS_AUTH, UserPassAuthenticator, negotiate,
};
pub use context::RequestContext;
pub use dialer::{Connection, Dialer, TcpDialer, classify_dial_error};
pub use error::{Error, Result};
pub use iface::interface_ipv4;
pub use protocol::{
    AddrSpec, Command, Reply, SOCKS_VERSION, decode_addr_spec, encode_reply, parse_udp_header,
    read_addr_spec, send_reply,
};
pub use relay::{ClientConn, relay};
pub use request::Request;
pub use resolver::{DnsResolver, NameResolver};
pub use ruleset::{AddressRewriter, PermitAll, PermitCommand, RuleSet};
pub use server::{Config, Server};
pub use udp::{BufferPool, MAX_UDP_PACKET_SIZE, PooledBuffer, UdpRelay};
