use std::io;

use thiserror::Error;

use crate::protocol::{AddrSpec, Command};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Bandwidth(#[from] bandwidth::Error),

    #[error("不支持的SOCKS版本: {0}")]
    UnsupportedVersion(u8),

    #[error("无法识别的地址类型: {0}")]
    UnrecognizedAddrType(u8),

    #[error("域名不是合法的 UTF-8")]
    InvalidDomain,

    #[error("无法编码地址: {0}")]
    AddressFormat(String),

    #[error("UDP 包过短: 只有 {0} 字节")]
    ShortUdpPacket(usize),

    #[error("UDP 包头保留字段非零: {0:?}")]
    UdpReserved([u8; 2]),

    #[error("不支持 UDP 分片: FRAG={0}")]
    UdpFragment(u8),

    #[error("未配置域名解析器")]
    NoResolver,

    #[error("解析目标 '{host}' 失败: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("连接 {addr} 失败: {source}")]
    Dial { addr: String, source: io::Error },

    #[error("{command} 到 {addr} 被规则拒绝")]
    RuleRejected { command: Command, addr: AddrSpec },

    #[error("不支持的命令: {0}")]
    UnsupportedCommand(u8),

    #[error("客户端没有可用的认证方式")]
    NoSupportedAuth,

    #[error("认证失败: {0}")]
    Auth(String),
}

impl Error {
    /// 由取消或超时引起，不再回复客户端
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Bandwidth(err) => err.is_cancellation(),
            Error::Io(err) => bandwidth::Error::from_io(err).is_some_and(bandwidth::Error::is_cancellation),
            _ => false,
        }
    }

    /// 规则拒绝属于正常的策略结果，不算系统故障
    pub fn is_rule_rejection(&self) -> bool {
        matches!(self, Error::RuleRejected { .. })
    }
}
