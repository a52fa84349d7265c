//! Outbound message assembly.
//!
//! Turns a queued payload into a `lettre::Message`: envelope validation,
//! attachment retrieval (bounded by the attachment semaphore), large-file
//! policy enforcement, and header injection including the correlation
//! header every dispatched message must carry.

use std::sync::Arc;

use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Attachment, Mailbox, MessageBuilder, MultiPart, SinglePart};
use postino_types::{LargeFileAction, LargeFileConfig, Message, Tenant};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::MAIL_ID_HEADER;
use crate::attachments::{AttachmentFetcher, FetchContext, FetchedAttachment};
use crate::error::DispatchError;

/// Assemble the outbound email for a queue entry.
pub async fn build_email(
    msg: &Message,
    tenant: &Tenant,
    fetcher: &AttachmentFetcher,
    attachment_sem: &Arc<Semaphore>,
) -> Result<lettre::Message, DispatchError> {
    let payload = &msg.payload;

    let from = payload
        .from
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or(DispatchError::MissingField("from"))?;
    if payload.to.is_empty() {
        return Err(DispatchError::MissingField("to"));
    }
    let subject = payload
        .subject
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or(DispatchError::MissingField("subject"))?;

    let mut builder = lettre::Message::builder()
        .from(parse_mailbox(from)?)
        .subject(subject);
    builder = add_recipients(builder, payload.to.iter(), RecipientKind::To)?;
    builder = add_recipients(builder, payload.cc.iter(), RecipientKind::Cc)?;
    builder = add_recipients(builder, payload.bcc.iter(), RecipientKind::Bcc)?;

    let ctx = FetchContext {
        endpoint_url: tenant.attachment_url(),
        auth: tenant.client_auth.clone(),
    };
    let large_file = tenant.large_file_config.as_ref();

    let mut attachments: Vec<FetchedAttachment> = Vec::new();
    let mut rewritten_links: Vec<String> = Vec::new();

    for spec in &payload.attachments {
        let _permit = attachment_sem
            .acquire()
            .await
            .map_err(|_| DispatchError::AttachmentFetch("fetcher shut down".into()))?;
        let Some(fetched) = fetcher.fetch(spec, &ctx).await? else {
            continue;
        };
        drop(_permit);

        match apply_large_file_policy(large_file, &fetched)? {
            LargeFileOutcome::Attach => attachments.push(fetched),
            LargeFileOutcome::Rewrite { storage_url } => {
                let auth = spec.auth.as_ref().or(ctx.auth.as_ref());
                let link = fetcher
                    .upload(&storage_url, &fetched.filename, &fetched.content, auth)
                    .await?;
                rewritten_links.push(link);
            }
        }
    }

    let mut body = payload.body.clone().unwrap_or_default();
    let is_html = payload
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.contains("html"));
    if !rewritten_links.is_empty() {
        body.push_str(&format_link_block(&rewritten_links, is_html));
    }

    let body_part = if is_html {
        SinglePart::html(body)
    } else {
        SinglePart::plain(body)
    };

    let mut email = if attachments.is_empty() {
        builder
            .singlepart(body_part)
            .map_err(|e| DispatchError::InvalidMessage(e.to_string()))?
    } else {
        let mut multipart = MultiPart::mixed().singlepart(body_part);
        for fetched in &attachments {
            let content_type = payload
                .attachments
                .iter()
                .find(|spec| {
                    spec.filename
                        .as_deref()
                        .map(|raw| crate::attachments::parse_filename(raw).0)
                        .as_deref()
                        == Some(fetched.filename.as_str())
                })
                .and_then(|spec| spec.mime_type.as_deref())
                .and_then(|mime| ContentType::parse(mime).ok())
                .unwrap_or(ContentType::parse("application/octet-stream").expect("static mime"));
            multipart = multipart.singlepart(
                Attachment::new(fetched.filename.clone())
                    .body(fetched.content.clone(), content_type),
            );
        }
        builder
            .multipart(multipart)
            .map_err(|e| DispatchError::InvalidMessage(e.to_string()))?
    };

    // The correlation header carries the client-facing id; bounce and PEC
    // receipts are matched against it case-exact.
    let headers = email.headers_mut();
    let mail_id_name = HeaderName::new_from_ascii(MAIL_ID_HEADER.to_string())
        .map_err(|e| DispatchError::InvalidMessage(e.to_string()))?;
    headers.insert_raw(HeaderValue::new(mail_id_name, msg.id.clone()));

    for (name, value) in &payload.headers {
        match HeaderName::new_from_ascii(name.clone()) {
            Ok(header_name) => {
                headers.insert_raw(HeaderValue::new(header_name, value.clone()));
            }
            Err(_) => {
                return Err(DispatchError::InvalidMessage(format!(
                    "invalid header name '{name}'"
                )));
            }
        }
    }

    Ok(email)
}

enum LargeFileOutcome {
    Attach,
    Rewrite { storage_url: String },
}

fn apply_large_file_policy(
    config: Option<&LargeFileConfig>,
    fetched: &FetchedAttachment,
) -> Result<LargeFileOutcome, DispatchError> {
    let Some(config) = config else {
        return Ok(LargeFileOutcome::Attach);
    };
    if !config.enabled {
        return Ok(LargeFileOutcome::Attach);
    }
    let size_mb = fetched.content.len() as f64 / (1024.0 * 1024.0);
    if size_mb <= config.max_size_mb {
        return Ok(LargeFileOutcome::Attach);
    }
    match config.action {
        LargeFileAction::Warn => {
            warn!(
                filename = %fetched.filename,
                size_mb = format_args!("{size_mb:.1}"),
                limit_mb = config.max_size_mb,
                "attachment exceeds size limit, attaching anyway"
            );
            Ok(LargeFileOutcome::Attach)
        }
        LargeFileAction::Reject => Err(DispatchError::AttachmentTooLarge {
            filename: fetched.filename.clone(),
            size_mb,
            max_size_mb: config.max_size_mb,
        }),
        LargeFileAction::Rewrite => match &config.storage_url {
            Some(url) => Ok(LargeFileOutcome::Rewrite {
                storage_url: url.clone(),
            }),
            None => Err(DispatchError::AttachmentFetch(
                "large-file rewrite requested but no storage_url configured".into(),
            )),
        },
    }
}

fn format_link_block(links: &[String], html: bool) -> String {
    if html {
        let items: String = links
            .iter()
            .map(|link| format!("<li><a href=\"{link}\">{link}</a></li>"))
            .collect();
        format!("<p>Attachments:</p><ul>{items}</ul>")
    } else {
        let items: String = links.iter().map(|link| format!("\n- {link}")).collect();
        format!("\n\nAttachments:{items}\n")
    }
}

enum RecipientKind {
    To,
    Cc,
    Bcc,
}

fn add_recipients<'a>(
    mut builder: MessageBuilder,
    addresses: impl Iterator<Item = &'a str>,
    kind: RecipientKind,
) -> Result<MessageBuilder, DispatchError> {
    for address in addresses {
        let mailbox = parse_mailbox(address)?;
        builder = match kind {
            RecipientKind::To => builder.to(mailbox),
            RecipientKind::Cc => builder.cc(mailbox),
            RecipientKind::Bcc => builder.bcc(mailbox),
        };
    }
    Ok(builder)
}

fn parse_mailbox(address: &str) -> Result<Mailbox, DispatchError> {
    address
        .parse()
        .map_err(|e| DispatchError::InvalidMessage(format!("invalid address '{address}': {e}")))
}
