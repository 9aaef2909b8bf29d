use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::SOCKS_VERSION;

pub const NO_AUTH: u8 = 0x00;
pub const USER_PASS_AUTH: u8 = 0x02;
pub const NO_ACCEPTABLE: u8 = 0xFF;

const USER_AUTH_VERSION: u8 = 0x01;
const AUTH_SUCCESS: u8 = 0x00;
const AUTH_FAILURE: u8 = 0x01;

/// 认证的结果，随请求一起传下去，核心逻辑不关心里面的内容
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub method: u8,
    pub payload: HashMap<String, String>,
}

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// 在方法协商里对应的编号
    fn code(&self) -> u8;

    /// 方法被选中后由认证器自己回复选择结果并完成子协商
    async fn authenticate(&self, conn: &mut dyn AsyncStream) -> Result<AuthContext>;
}

pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    fn code(&self) -> u8 {
        NO_AUTH
    }

    async fn authenticate(&self, conn: &mut dyn AsyncStream) -> Result<AuthContext> {
        conn.write_all(&[SOCKS_VERSION, NO_AUTH]).await?;
        Ok(AuthContext {
            method: NO_AUTH,
            payload: HashMap::new(),
        })
    }
}

pub trait CredentialStore: Send + Sync {
    fn valid(&self, user: &str, password: &str) -> bool;
}

/// 内存中的用户名到密码的映射
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(HashMap<String, String>);

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, user: impl Into<String>, password: impl Into<String>) {
        self.0.insert(user.into(), password.into());
    }
}

impl<U: Into<String>, P: Into<String>> FromIterator<(U, P)> for StaticCredentials {
    fn from_iter<I: IntoIterator<Item = (U, P)>>(iter: I) -> Self {
        let mut creds = Self::new();
        for (user, password) in iter {
            creds.insert(user, password);
        }
        creds
    }
}

impl CredentialStore for StaticCredentials {
    fn valid(&self, user: &str, password: &str) -> bool {
        self.0.get(user).is_some_and(|expected| expected == password)
    }
}

/// RFC 1929 用户名密码认证
pub struct UserPassAuthenticator {
    pub credentials: Arc<dyn CredentialStore>,
}

impl UserPassAuthenticator {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Authenticator for UserPassAuthenticator {
    fn code(&self) -> u8 {
        USER_PASS_AUTH
    }

    async fn authenticate(&self, conn: &mut dyn AsyncStream) -> Result<AuthContext> {
        conn.write_all(&[SOCKS_VERSION, USER_PASS_AUTH]).await?;

        // VER | ULEN | UNAME | PLEN | PASSWD
        let version = conn.read_u8().await?;
        if version != USER_AUTH_VERSION {
            return Err(Error::Auth(format!("不支持的认证版本: {}", version)));
        }
        let user = read_field(conn).await?;
        let password = read_field(conn).await?;

        if !self.credentials.valid(&user, &password) {
            conn.write_all(&[USER_AUTH_VERSION, AUTH_FAILURE]).await?;
            return Err(Error::Auth(format!("用户 {} 的凭据无效", user)));
        }
        conn.write_all(&[USER_AUTH_VERSION, AUTH_SUCCESS]).await?;

        let mut payload = HashMap::new();
        payload.insert("username".to_owned(), user);
        Ok(AuthContext {
            method: USER_PASS_AUTH,
            payload,
        })
    }
}

async fn read_field(conn: &mut dyn AsyncStream) -> Result<String> {
    let len = conn.read_u8().await? as usize;
    let mut field = vec![0u8; len];
    conn.read_exact(&mut field).await?;
    String::from_utf8(field).map_err(|_| Error::Auth("凭据不是合法的 UTF-8".to_owned()))
}

/// 读取客户端提供的方法列表，选出第一个服务端支持的方法并执行认证。
///
/// 调用前版本号已经被读走。
pub async fn negotiate<S: AsyncStream>(
    conn: &mut S,
    authenticators: &[Arc<dyn Authenticator>],
) -> Result<AuthContext> {
    let nmethods = conn.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    conn.read_exact(&mut methods).await?;

    for method in methods {
        if let Some(authenticator) = authenticators.iter().find(|a| a.code() == method) {
            debug!("选择认证方式: {:#04x}", method);
            return authenticator.authenticate(conn).await;
        }
    }

    conn.write_all(&[SOCKS_VERSION, NO_ACCEPTABLE]).await?;
    Err(Error::NoSupportedAuth)
}
