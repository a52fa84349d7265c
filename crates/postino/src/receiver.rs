//! Bounce / PEC correlation receiver.
//!
//! One polling task per account with an inbound mailbox. Each cycle opens
//! an IMAP session, honours UIDVALIDITY, fetches everything past the
//! persisted `imap_last_uid`, parses each message as a DSN bounce or PEC
//! receipt, correlates it to the original message by `X-Genro-Mail-ID`,
//! and emits the matching event. The UID cursor advances only after the
//! event is committed, so a crash replays at most one UID, and replays are
//! detected and skipped.

use std::time::Duration;

use anyhow::{Context, Result};
use async_imap::Session;
use async_native_tls::{TlsConnector, TlsStream};
use futures_util::TryStreamExt;
use postino_store::Store;
use postino_types::{Account, EventType, now_ts};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::parser::{self, PecReceipt};

type ImapSession = Session<TlsStream<TcpStream>>;

/// Long-running polling loop for one inbound account.
pub async fn run_imap_poller(
    store: Store,
    account_pk: String,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    info!(account_pk = %account_pk, "starting IMAP poller");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(account_pk = %account_pk, "IMAP poller stopping");
                break;
            }
            _ = tokio::time::sleep(poll_interval) => {
                match poll_account_once(&store, &account_pk).await {
                    Ok(0) => {}
                    Ok(n) => debug!(account_pk = %account_pk, events = n, "IMAP poll done"),
                    // The UID cursor was not advanced; next cycle retries.
                    Err(e) => warn!(account_pk = %account_pk, "IMAP poll failed: {e:#}"),
                }
            }
        }
    }
}

/// One polling cycle. Returns the number of events emitted.
pub async fn poll_account_once(store: &Store, account_pk: &str) -> Result<usize> {
    let Some(account) = store.accounts().get_by_pk(account_pk).await? else {
        return Ok(0);
    };
    if !account.has_imap() {
        return Ok(0);
    }

    let mut session = open_session(&account).await?;
    let mailbox = session
        .select(&account.imap_folder)
        .await
        .with_context(|| format!("select folder {}", account.imap_folder))?;

    let uidvalidity = mailbox.uid_validity.map(i64::from);
    let mut last_uid = if uidvalidity != account.imap_uidvalidity {
        // Mailbox was rebuilt; the old cursor is meaningless.
        0
    } else {
        account.imap_last_uid.unwrap_or(0)
    };

    let query = format!("UID {}:*", last_uid + 1);
    let mut uids: Vec<u32> = session
        .uid_search(&query)
        .await
        .with_context(|| format!("UID SEARCH {query}"))?
        .into_iter()
        // The server returns the newest message even when the range is
        // empty; filter to strictly-new UIDs.
        .filter(|uid| i64::from(*uid) > last_uid)
        .collect();
    uids.sort_unstable();

    let mut emitted = 0;
    for uid in uids {
        let raw = fetch_body(&mut session, uid).await?;
        if let Some(raw) = raw {
            match process_inbound(store, &account, i64::from(uid), &raw).await {
                Ok(true) => emitted += 1,
                Ok(false) => {}
                Err(e) => {
                    // Do not advance past a message we failed to record.
                    session.logout().await.ok();
                    return Err(e);
                }
            }
        }
        last_uid = i64::from(uid);
        store
            .accounts()
            .update_imap_sync_state(&account.pk, last_uid, uidvalidity)
            .await?;
    }

    session.logout().await.ok();
    Ok(emitted)
}

async fn open_session(account: &Account) -> Result<ImapSession> {
    let host = account.imap_host.as_deref().context("imap_host missing")?;
    let user = account
        .imap_user
        .as_deref()
        .or(account.user.as_deref())
        .context("imap_user missing")?;
    let password = account
        .imap_password
        .as_deref()
        .or(account.password.as_deref())
        .context("imap_password missing")?;

    let tcp = TcpStream::connect((host, account.imap_port))
        .await
        .with_context(|| format!("connect {host}:{}", account.imap_port))?;
    let tls = TlsConnector::new()
        .connect(host, tcp)
        .await
        .with_context(|| format!("TLS handshake with {host}"))?;
    let client = async_imap::Client::new(tls);
    let session = client
        .login(user, password)
        .await
        .map_err(|(e, _)| e)
        .with_context(|| format!("IMAP login as {user}"))?;
    Ok(session)
}

async fn fetch_body(session: &mut ImapSession, uid: u32) -> Result<Option<Vec<u8>>> {
    let mut fetches = session
        .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
        .await
        .with_context(|| format!("UID FETCH {uid}"))?;
    let mut raw = None;
    while let Some(fetch) = fetches.try_next().await.context("reading FETCH response")? {
        if let Some(body) = fetch.body() {
            raw = Some(body.to_vec());
        }
    }
    Ok(raw)
}

/// Parse one inbound message and emit its event. Returns true when an
/// event was recorded; replayed UIDs and uncorrelated messages are no-ops.
pub async fn process_inbound(
    store: &Store,
    account: &Account,
    uid: i64,
    raw: &[u8],
) -> Result<bool> {
    if account.is_pec_account {
        process_pec(store, account, uid, raw).await
    } else {
        process_bounce(store, account, uid, raw).await
    }
}

async fn process_bounce(store: &Store, account: &Account, uid: i64, raw: &[u8]) -> Result<bool> {
    let info = parser::parse_bounce(raw);
    if !info.is_bounce {
        return Ok(false);
    }
    let Some(message_id) = &info.message_id else {
        debug!(uid, "bounce without correlation header, skipping");
        return Ok(false);
    };
    let Some(message) = store.messages().get(message_id, &account.tenant_id).await? else {
        debug!(uid, message_id = %message_id, "bounce for unknown message, skipping");
        return Ok(false);
    };

    if store
        .events()
        .has_event_with_uid(&message.pk, EventType::Bounce, uid)
        .await?
    {
        return Ok(false);
    }

    let mut metadata = json!({ "imap_uid": uid });
    if let Some(bounce_type) = info.bounce_type {
        metadata["bounce_type"] = json!(bounce_type.as_str());
    }
    if let Some(code) = &info.bounce_code {
        metadata["bounce_code"] = json!(code);
    }
    if let Some(recipient) = &info.recipient {
        metadata["recipient"] = json!(recipient);
    }

    store
        .events()
        .add_event(
            &message.pk,
            EventType::Bounce,
            now_ts(),
            info.diagnostic.as_deref(),
            Some(&metadata),
        )
        .await?;
    info!(
        message_id = %message_id,
        bounce_type = info.bounce_type.map(|t| t.as_str()).unwrap_or("unknown"),
        "bounce correlated"
    );
    Ok(true)
}

async fn process_pec(store: &Store, account: &Account, uid: i64, raw: &[u8]) -> Result<bool> {
    let info = parser::parse_pec(raw);
    let Some(receipt) = info.receipt else {
        return Ok(false);
    };
    let Some(message_id) = &info.message_id else {
        debug!(uid, "PEC receipt without correlation header, skipping");
        return Ok(false);
    };
    let Some(message) = store.messages().get(message_id, &account.tenant_id).await? else {
        debug!(uid, message_id = %message_id, "PEC receipt for unknown message, skipping");
        return Ok(false);
    };

    let event_type = match receipt {
        PecReceipt::Acceptance => EventType::PecAcceptance,
        PecReceipt::Delivery => EventType::PecDelivery,
        PecReceipt::Failure => EventType::PecError,
        // Provider refusal terminates the message like an SMTP error.
        PecReceipt::NonAcceptance => EventType::Error,
    };

    if store
        .events()
        .has_event_with_uid(&message.pk, event_type, uid)
        .await?
    {
        return Ok(false);
    }

    let metadata = json!({ "imap_uid": uid, "receipt": pec_receipt_label(receipt) });
    store
        .events()
        .add_event(
            &message.pk,
            event_type,
            now_ts(),
            info.diagnostic.as_deref(),
            Some(&metadata),
        )
        .await?;
    info!(message_id = %message_id, receipt = pec_receipt_label(receipt), "PEC receipt correlated");
    Ok(true)
}

fn pec_receipt_label(receipt: PecReceipt) -> &'static str {
    match receipt {
        PecReceipt::Acceptance => "accettazione",
        PecReceipt::Delivery => "avvenuta-consegna",
        PecReceipt::Failure => "mancata-consegna",
        PecReceipt::NonAcceptance => "non-accettazione",
    }
}

/// Background sweep: PEC messages sent before the acceptance deadline with
/// no acceptance receipt lose the flag and count as ordinary sent mail.
pub async fn sweep_pec_without_acceptance(
    store: &Store,
    acceptance_timeout: Duration,
) -> Result<usize> {
    let cutoff = now_ts() - acceptance_timeout.as_secs() as i64;
    let stale = store.messages().pec_without_acceptance(cutoff).await?;
    let count = stale.len();
    for message in stale {
        store.messages().clear_pec_flag(&message.pk).await?;
        info!(message_id = %message.id, "no PEC acceptance within deadline, downgraded to plain mail");
    }
    Ok(count)
}
