//! SMTP connection pool.
//!
//! Transports are keyed by `(host, port, user, use_tls)` so sessions are
//! reused across messages of the same account but never shared between
//! different credentials. Each pooled transport carries its own idle
//! timeout from the account's `ttl`; transports untouched for longer than
//! their ttl are dropped by [`SmtpPool::evict_idle`], closing their
//! connections.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use lettre::transport::smtp::PoolConfig;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::response::Response;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use postino_types::Account;
use tokio::sync::Mutex;
use tracing::debug;

/// Classification input extracted from a failed send.
#[derive(Debug, Clone)]
pub struct SmtpFailure {
    /// Three-digit reply code when the server answered at all.
    pub code: Option<u16>,
    pub detail: String,
}

/// Pool identity; credentials are part of the key on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    host: String,
    port: u16,
    user: Option<String>,
    use_tls: bool,
}

impl PoolKey {
    fn for_account(account: &Account) -> Self {
        Self {
            host: account.host.clone(),
            port: account.port,
            user: account.user.clone(),
            use_tls: account.use_tls.unwrap_or(false),
        }
    }
}

struct PoolEntry {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    last_used: Instant,
    ttl: Duration,
}

/// Shared pool of authenticated SMTP transports.
#[derive(Default)]
pub struct SmtpPool {
    entries: Mutex<HashMap<PoolKey, PoolEntry>>,
}

impl SmtpPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `message` through the account's pooled transport, creating and
    /// authenticating it on first use.
    pub async fn send(
        &self,
        account: &Account,
        message: Message,
    ) -> Result<Response, lettre::transport::smtp::Error> {
        let transport = self.transport(account).await?;
        transport.send(message).await
    }

    async fn transport(
        &self,
        account: &Account,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, lettre::transport::smtp::Error> {
        let key = PoolKey::for_account(account);
        let ttl = Duration::from_secs(account.ttl.max(1) as u64);

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&key) {
            entry.last_used = Instant::now();
            return Ok(entry.transport.clone());
        }

        let transport = build_transport(account, ttl)?;
        debug!(
            host = %account.host,
            port = account.port,
            user = account.user.as_deref().unwrap_or("-"),
            "opening SMTP transport"
        );
        entries.insert(
            key,
            PoolEntry {
                transport: transport.clone(),
                last_used: Instant::now(),
                ttl,
            },
        );
        Ok(transport)
    }

    /// Drop transports idle past their account ttl; returns how many.
    pub async fn evict_idle(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.last_used.elapsed() <= entry.ttl);
        before - entries.len()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

fn build_transport(
    account: &Account,
    idle_ttl: Duration,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, lettre::transport::smtp::Error> {
    let mut builder =
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&account.host)
            .port(account.port)
            .timeout(Some(Duration::from_secs(30)))
            .pool_config(PoolConfig::new().idle_timeout(idle_ttl));

    if account.use_tls.unwrap_or(false) {
        let params = TlsParameters::new(account.host.clone())?;
        // Port 465 is implicit TLS; everything else negotiates STARTTLS.
        builder = if account.port == 465 {
            builder.tls(Tls::Wrapper(params))
        } else {
            builder.tls(Tls::Required(params))
        };
    }

    if let (Some(user), Some(password)) = (&account.user, &account.password) {
        builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
    }

    Ok(builder.build())
}

/// Extract the classification input from a lettre SMTP error.
pub fn failure_of(err: &lettre::transport::smtp::Error) -> SmtpFailure {
    let code = err
        .status()
        .and_then(|code| code.to_string().parse::<u16>().ok());
    SmtpFailure {
        code,
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, user: &str, port: u16) -> Account {
        Account {
            pk: format!("pk-{id}"),
            id: id.into(),
            tenant_id: "t1".into(),
            host: "smtp.example.com".into(),
            port,
            user: Some(user.into()),
            password: Some("secret".into()),
            use_tls: Some(false),
            ttl: 300,
            batch_size: None,
            limit_per_minute: None,
            limit_per_hour: None,
            limit_per_day: None,
            limit_behavior: Default::default(),
            is_pec_account: false,
            imap_host: None,
            imap_port: 993,
            imap_user: None,
            imap_password: None,
            imap_folder: "INBOX".into(),
            imap_last_uid: None,
            imap_uidvalidity: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn transports_are_keyed_by_credentials() {
        let pool = SmtpPool::new();
        pool.transport(&account("a", "user-a", 587)).await.unwrap();
        pool.transport(&account("b", "user-b", 587)).await.unwrap();
        // Same credentials, same key: no third entry.
        pool.transport(&account("c", "user-a", 587)).await.unwrap();
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn eviction_respects_account_ttl() {
        let pool = SmtpPool::new();
        let mut short = account("a", "user-a", 587);
        short.ttl = 0; // clamped to 1s; entry is younger than that
        pool.transport(&short).await.unwrap();

        assert_eq!(pool.evict_idle().await, 0);
        assert_eq!(pool.len().await, 1);

        pool.clear().await;
        assert!(pool.is_empty().await);
    }
}
