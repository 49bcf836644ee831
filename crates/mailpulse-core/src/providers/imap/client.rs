//! IMAP client
//!
//! A minimal line-oriented IMAP4rev1 client covering what a watcher needs:
//! login, select, status, IDLE, flag fetches, UID search and logout.

use super::response::{
    capability_code, parse_untagged, quote, Capabilities, Completion, FetchedFlags, MailboxStatus,
    Tagged, Untagged,
};
use super::{IdleWait, PushConnector, PushSession};
use async_trait::async_trait;
use mailpulse_common::{Error, Result};
use mailpulse_storage::models::{AccountConfig, Credential};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Byte stream an IMAP session runs over (TCP, TLS, or an in-memory pipe in tests)
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

fn tls_connector() -> &'static TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();
    CONNECTOR.get_or_init(|| {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    })
}

fn io_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::TransientProtocol(format!("{}: {}", context, e))
}

/// Connected IMAP session
pub struct ImapClient {
    stream: BufReader<Box<dyn Transport>>,
    next_tag: u32,
    capabilities: Capabilities,
    delimiter: Option<char>,
    idle_tag: Option<String>,
    pending: Vec<Untagged>,
    line_buf: Vec<u8>,
    timeout: Duration,
}

impl ImapClient {
    /// Open a TCP (optionally TLS) connection and read the greeting
    pub async fn connect(host: &str, port: u16, use_tls: bool, io_timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let tcp = timeout(io_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::TransientProtocol(format!("connect to {} timed out", addr)))?
            .map_err(|e| io_error(&format!("connect to {}", addr), e))?;

        let transport: Box<dyn Transport> = if use_tls {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| Error::Configuration(format!("invalid IMAP host name: {}", host)))?;
            let tls = timeout(io_timeout, tls_connector().connect(server_name, tcp))
                .await
                .map_err(|_| Error::TransientProtocol("TLS handshake timed out".to_string()))?
                .map_err(|e| io_error("TLS handshake", e))?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        Self::from_transport(transport, io_timeout).await
    }

    /// Start a session over an already connected stream
    pub async fn from_transport(transport: Box<dyn Transport>, io_timeout: Duration) -> Result<Self> {
        let mut client = Self {
            stream: BufReader::new(transport),
            next_tag: 0,
            capabilities: Capabilities::default(),
            delimiter: None,
            idle_tag: None,
            pending: Vec::new(),
            line_buf: Vec::new(),
            timeout: io_timeout,
        };

        let greeting = client.read_line_timed().await?;
        if greeting.starts_with("* BYE") {
            return Err(Error::TransientProtocol(format!(
                "server refused connection: {}",
                greeting.trim_end()
            )));
        }
        if let Some(caps) = greeting
            .strip_prefix("* OK ")
            .or_else(|| greeting.strip_prefix("* PREAUTH "))
            .and_then(capability_code)
        {
            client.capabilities = Capabilities::from_names(caps);
        }

        Ok(client)
    }

    fn tag(&mut self) -> String {
        self.next_tag += 1;
        format!("A{:04}", self.next_tag)
    }

    /// Read one logical response line, inlining any `{n}` literals.
    ///
    /// Bytes are accumulated in `line_buf`, so a read cancelled by a timeout
    /// resumes where it left off on the next call.
    async fn read_line(&mut self) -> Result<String> {
        loop {
            let n = self
                .stream
                .read_until(b'\n', &mut self.line_buf)
                .await
                .map_err(|e| io_error("read", e))?;
            if n == 0 {
                return Err(Error::TransientProtocol("connection closed by server".to_string()));
            }

            match literal_length(&self.line_buf) {
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.stream
                        .read_exact(&mut literal)
                        .await
                        .map_err(|e| io_error("read literal", e))?;
                    // Drop the `{n}` marker and splice the literal in as a quoted string
                    let marker = self.line_buf.iter().rposition(|b| *b == b'{').unwrap_or(0);
                    self.line_buf.truncate(marker);
                    let text = String::from_utf8_lossy(&literal);
                    self.line_buf.extend_from_slice(quote(&text).as_bytes());
                }
                None => {
                    let line = String::from_utf8_lossy(&self.line_buf).into_owned();
                    self.line_buf.clear();
                    return Ok(line);
                }
            }
        }
    }

    async fn read_line_timed(&mut self) -> Result<String> {
        timeout(self.timeout, self.read_line())
            .await
            .map_err(|_| Error::TransientProtocol("timed out waiting for server".to_string()))?
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let stream = self.stream.get_mut();
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| io_error("write", e))?;
        stream
            .write_all(b"\r\n")
            .await
            .map_err(|e| io_error("write", e))?;
        stream.flush().await.map_err(|e| io_error("flush", e))
    }

    /// Send a tagged command and collect untagged responses until completion
    async fn command(&mut self, command: &str) -> Result<(Vec<Untagged>, Tagged)> {
        let tag = self.tag();
        self.write_line(&format!("{} {}", tag, command)).await?;

        let mut untagged = Vec::new();
        loop {
            let line = self.read_line_timed().await?;
            if let Some(done) = Tagged::parse(&line).filter(|t| t.tag == tag) {
                return match done.status {
                    Completion::Ok => Ok((untagged, done)),
                    Completion::No | Completion::Bad => Err(Error::TransientProtocol(format!(
                        "{} failed: {}",
                        command_name(command),
                        done.text
                    ))),
                };
            }
            match parse_untagged(&line) {
                Some(Untagged::Bye(text)) if !command.eq_ignore_ascii_case("LOGOUT") => {
                    return Err(Error::TransientProtocol(format!("server closed session: {}", text)));
                }
                Some(response) => untagged.push(response),
                None => debug!("Ignoring IMAP line: {}", line.trim_end()),
            }
        }
    }

    /// Authenticate and negotiate capabilities
    pub async fn login(&mut self, login: &str, password: &str) -> Result<()> {
        let tag = self.tag();
        self.write_line(&format!("{} LOGIN {} {}", tag, quote(login), quote(password)))
            .await?;

        let mut caps = None;
        loop {
            let line = self.read_line_timed().await?;
            if let Some(done) = Tagged::parse(&line).filter(|t| t.tag == tag) {
                if done.status != Completion::Ok {
                    return Err(Error::AuthExpired(format!("LOGIN rejected: {}", done.text)));
                }
                caps = caps.or_else(|| capability_code(&done.text));
                break;
            }
            if let Some(Untagged::Capability(names)) = parse_untagged(&line) {
                caps = Some(names);
            }
        }

        match caps {
            Some(names) => self.capabilities = Capabilities::from_names(names),
            None => {
                let (untagged, _) = self.command("CAPABILITY").await?;
                for response in untagged {
                    if let Untagged::Capability(names) = response {
                        self.capabilities = Capabilities::from_names(names);
                    }
                }
            }
        }

        // Hierarchy delimiter, used for select fallbacks
        if let Ok((untagged, _)) = self.command("LIST \"\" \"\"").await {
            self.delimiter = untagged.into_iter().find_map(|r| match r {
                Untagged::List { delimiter, .. } => delimiter,
                _ => None,
            });
        }

        debug!(capabilities = ?self.capabilities, delimiter = ?self.delimiter, "IMAP session ready");
        Ok(())
    }

    async fn select_with(&mut self, verb: &str, mailbox: &str) -> Result<()> {
        let (untagged, _) = self.command(&format!("{} {}", verb, quote(mailbox))).await?;
        self.pending.extend(
            untagged
                .into_iter()
                .filter(|r| matches!(r, Untagged::Expunge(_) | Untagged::Fetch { .. })),
        );
        Ok(())
    }
}

/// Length of a trailing `{n}` / `{n+}` literal marker, if any
fn literal_length(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?.trim_end();
    let inner = text.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

fn command_name(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or(command)
}

#[async_trait]
impl PushSession for ImapClient {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn delimiter(&self) -> Option<char> {
        self.delimiter
    }

    async fn enable_utf8(&mut self) -> Result<()> {
        self.command("ENABLE UTF8=ACCEPT").await.map(|_| ())
    }

    async fn select(&mut self, mailbox: &str) -> Result<()> {
        self.select_with("SELECT", mailbox).await
    }

    async fn examine(&mut self, mailbox: &str) -> Result<()> {
        self.select_with("EXAMINE", mailbox).await
    }

    async fn status(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        let (untagged, _) = self
            .command(&format!("STATUS {} (UIDNEXT UNSEEN RECENT)", quote(mailbox)))
            .await?;
        untagged
            .iter()
            .find_map(|r| match r {
                Untagged::Status { items, .. } => Some(MailboxStatus::from(items)),
                _ => None,
            })
            .ok_or_else(|| Error::TransientProtocol("STATUS returned no data".to_string()))
    }

    async fn idle_start(&mut self) -> Result<()> {
        let tag = self.tag();
        self.write_line(&format!("{} IDLE", tag)).await?;

        loop {
            let line = self.read_line_timed().await?;
            if line.starts_with('+') {
                self.idle_tag = Some(tag);
                return Ok(());
            }
            if let Some(done) = Tagged::parse(&line).filter(|t| t.tag == tag) {
                return Err(Error::TransientProtocol(format!("IDLE refused: {}", done.text)));
            }
            if let Some(response) = parse_untagged(&line) {
                self.pending.push(response);
            }
        }
    }

    async fn idle_wait(&mut self, slice: Duration) -> IdleWait {
        if !self.pending.is_empty() {
            return IdleWait::Notified(std::mem::take(&mut self.pending));
        }

        let line = match timeout(slice, self.read_line()).await {
            Err(_) => return IdleWait::TimedOut,
            Ok(Err(e)) => return IdleWait::Failed(e),
            Ok(Ok(line)) => line,
        };

        if let Some(done) = Tagged::parse(&line) {
            self.idle_tag = None;
            return IdleWait::Failed(Error::TransientProtocol(format!(
                "IDLE ended by server: {}",
                done.text
            )));
        }

        match parse_untagged(&line) {
            Some(Untagged::Bye(text)) => {
                IdleWait::Failed(Error::TransientProtocol(format!("server closed session: {}", text)))
            }
            Some(response) => IdleWait::Notified(vec![response]),
            None => IdleWait::Notified(Vec::new()),
        }
    }

    async fn idle_done(&mut self) -> Result<()> {
        let Some(tag) = self.idle_tag.take() else {
            return Ok(());
        };
        self.write_line("DONE").await?;

        loop {
            let line = self.read_line_timed().await?;
            if let Some(done) = Tagged::parse(&line).filter(|t| t.tag == tag) {
                return match done.status {
                    Completion::Ok => Ok(()),
                    _ => Err(Error::TransientProtocol(format!("IDLE failed: {}", done.text))),
                };
            }
            if let Some(response) = parse_untagged(&line) {
                self.pending.push(response);
            }
        }
    }

    async fn fetch_flags(&mut self, sequence_set: &str) -> Result<Vec<FetchedFlags>> {
        let (untagged, _) = self
            .command(&format!("FETCH {} (UID FLAGS)", sequence_set))
            .await?;
        Ok(untagged
            .into_iter()
            .filter_map(|r| match r {
                Untagged::Fetch {
                    seq,
                    uid: Some(uid),
                    flags,
                } => Some(FetchedFlags {
                    seq,
                    uid,
                    flags: flags.unwrap_or_default(),
                }),
                _ => None,
            })
            .collect())
    }

    async fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>> {
        let (untagged, _) = self.command(&format!("UID SEARCH {}", criteria)).await?;
        Ok(untagged
            .into_iter()
            .flat_map(|r| match r {
                Untagged::Search(uids) => uids,
                _ => Vec::new(),
            })
            .collect())
    }

    async fn noop(&mut self) -> Result<Vec<Untagged>> {
        let (untagged, _) = self.command("NOOP").await?;
        Ok(untagged)
    }

    async fn logout(&mut self) -> Result<()> {
        if self.idle_tag.is_some() {
            if let Err(e) = self.idle_done().await {
                debug!("DONE before LOGOUT failed: {}", e);
            }
        }
        self.command("LOGOUT").await.map(|_| ())
    }
}

/// Opens real IMAP sessions from account configuration
pub struct ImapConnector {
    io_timeout: Duration,
}

impl ImapConnector {
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }
}

#[async_trait]
impl PushConnector for ImapConnector {
    async fn connect(&self, account: &AccountConfig) -> Result<Box<dyn PushSession>> {
        let host = account
            .host
            .as_deref()
            .ok_or_else(|| Error::Configuration(format!("account {} has no IMAP host", account.account_id)))?;
        let Credential::Password { login, password } = &account.credential else {
            return Err(Error::Configuration(format!(
                "account {} has no IMAP password",
                account.account_id
            )));
        };

        let mut client = ImapClient::connect(host, account.port, account.use_tls, self.io_timeout).await?;
        if let Err(e) = client.login(login, password).await {
            if let Err(logout) = client.logout().await {
                warn!("LOGOUT after failed login: {}", logout);
            }
            return Err(e);
        }
        Ok(Box::new(client))
    }
}
