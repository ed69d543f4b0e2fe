use std::time::Duration;

use async_imap::types::Mailbox;
use async_imap::Session;
use async_native_tls::TlsStream;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

// This type alias saves us from writing this monster type everywhere.
// An IMAP session is generic over the stream type — in our case,
// it's TLS-encrypted TCP wrapped in a tokio compat layer.
pub type ImapSession = Session<TlsStream<Compat<TcpStream>>>;

pub struct ImapConnection {
    pub session: ImapSession,
    /// EXAMINE instead of SELECT when no rule can request a server-side
    /// \Seen write.
    pub read_only: bool,
}

impl ImapConnection {
    pub async fn select_inbox(&mut self) -> Result<Mailbox> {
        let select = async {
            if self.read_only {
                self.session.examine("INBOX").await
            } else {
                self.session.select("INBOX").await
            }
        };
        let mailbox = tokio::time::timeout(COMMAND_TIMEOUT, select)
            .await
            .map_err(|_| Error::Transient("SELECT INBOX timed out".to_string()))?
            .map_err(|e| Error::Imap(format!("SELECT INBOX failed: {}", e)))?;
        Ok(mailbox)
    }

    pub async fn logout(mut self) {
        // Courtesy only; the server reaps dead sessions either way.
        let _ = tokio::time::timeout(Duration::from_secs(5), self.session.logout()).await;
    }
}

/// Open a TLS IMAP session and authenticate. Transport failures are
/// transient (the next poll retries), a rejected login is an auth error
/// surfaced in the account's poll status.
pub async fn connect(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    read_only: bool,
) -> Result<ImapConnection> {
    info!(host = %host, port = port, "Connecting to IMAP server");

    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::Transient(format!("TCP connect to {}:{} timed out", host, port)))?
        .map_err(|e| Error::Transient(format!("TCP connection failed: {}", e)))?;

    let tcp = tcp.compat();
    let tls = async_native_tls::TlsConnector::new();
    let tls_stream = tokio::time::timeout(CONNECT_TIMEOUT, tls.connect(host, tcp))
        .await
        .map_err(|_| Error::Transient("TLS handshake timed out".to_string()))?
        .map_err(|e| Error::Transient(format!("TLS handshake failed: {}", e)))?;

    let client = async_imap::Client::new(tls_stream);

    let session = tokio::time::timeout(COMMAND_TIMEOUT, client.login(username, password))
        .await
        .map_err(|_| Error::Transient("IMAP login timed out".to_string()))?
        .map_err(|(e, _)| Error::Auth(format!("login rejected for {}: {}", username, e)))?;

    debug!(host = %host, "IMAP session authenticated");

    Ok(ImapConnection {
        session,
        read_only,
    })
}
