//! New-message discovery for one poll.
//!
//! `fetch_new` runs the whole stateless C3 contract: select INBOX,
//! search above the UID watermark (or a date bound on first contact),
//! fetch envelope + preferred text part, decode, and hand back messages
//! in ascending UID order together with the advanced watermark.
//!
//! The watermark is `"<uidvalidity>:<max_uid>"`. Nothing outside this
//! module looks inside it; a UIDVALIDITY change simply invalidates it
//! and the search falls back to the date bound.

use std::collections::HashMap;

use async_imap::types::Fetch;
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use imap_proto::types::{BodyStructure, ContentEncoding, SectionPath};
use tracing::{debug, warn};

use super::connection::{ImapConnection, COMMAND_TIMEOUT};
use super::envelopes::parse_meta;
use crate::error::{Error, Result};

const FETCH_BATCH: usize = 50;

/// One decoded message from the server.
#[derive(Debug, Clone)]
pub struct FetchedEmail {
    pub uid: u32,
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    /// Decoded text body; empty when only HTML was available.
    pub body_text: String,
    /// Present only when the message had no text part.
    pub body_html: Option<String>,
    /// Unix seconds.
    pub received_at: i64,
}

pub fn format_watermark(uid_validity: u32, uid: u32) -> String {
    format!("{}:{}", uid_validity, uid)
}

pub fn parse_watermark(raw: &str) -> Option<(u32, u32)> {
    let (validity, uid) = raw.split_once(':')?;
    Some((validity.parse().ok()?, uid.parse().ok()?))
}

/// Collect a FETCH stream tolerantly: log and skip individual responses
/// that fail to parse (e.g. IMAP literal strings in BODYSTRUCTURE).
async fn collect_tolerant<E: std::fmt::Display>(
    stream: impl futures::Stream<Item = std::result::Result<Fetch, E>>,
    context: &str,
) -> Vec<Fetch> {
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => items.push(fetch),
            Err(e) => {
                warn!("Skipping unparseable IMAP response ({}): {}", context, e);
            }
        }
    }
    items
}

/// Discover and decode messages newer than `watermark`.
///
/// `host` feeds the synthesized Message-ID for messages that arrive
/// without one (`"<uid>@<host>"`), so deduplication still holds.
pub async fn fetch_new(
    conn: &mut ImapConnection,
    host: &str,
    watermark: Option<&str>,
    lookback_days: u32,
) -> Result<(Vec<FetchedEmail>, Option<String>)> {
    let mailbox = conn.select_inbox().await?;
    let uid_validity = mailbox.uid_validity.unwrap_or(0);

    // The stored watermark only binds the search while UIDVALIDITY is
    // unchanged; otherwise server UIDs have been reassigned.
    let last_uid = watermark
        .and_then(parse_watermark)
        .filter(|(validity, _)| *validity == uid_validity)
        .map(|(_, uid)| uid);

    let query = match last_uid {
        Some(uid) => format!("UID {}:*", uid.saturating_add(1)),
        None => {
            let since = Utc::now() - ChronoDuration::days(lookback_days as i64);
            format!("SINCE {}", since.format("%d-%b-%Y"))
        }
    };

    let uid_set = tokio::time::timeout(COMMAND_TIMEOUT, conn.session.uid_search(&query))
        .await
        .map_err(|_| Error::Transient("UID SEARCH timed out".to_string()))?
        .map_err(|e| Error::Imap(format!("UID SEARCH failed: {}", e)))?;

    // `UID n:*` always matches the highest-UID message, even when it is
    // below n; drop anything at or under the watermark.
    let mut uids: Vec<u32> = uid_set
        .into_iter()
        .filter(|&uid| last_uid.map_or(true, |last| uid > last))
        .collect();
    uids.sort_unstable();

    if uids.is_empty() {
        debug!(host = %host, "No new messages");
        return Ok((Vec::new(), watermark.map(str::to_string)));
    }

    debug!(host = %host, count = uids.len(), "Fetching new messages");

    let mut emails = Vec::with_capacity(uids.len());
    for chunk in uids.chunks(FETCH_BATCH) {
        let batch = fetch_batch(conn, host, chunk).await?;
        emails.extend(batch);
    }
    emails.sort_by_key(|e| e.uid);

    let max_uid = *uids.last().expect("non-empty");
    Ok((emails, Some(format_watermark(uid_validity, max_uid))))
}

async fn fetch_batch(
    conn: &mut ImapConnection,
    host: &str,
    uids: &[u32],
) -> Result<Vec<FetchedEmail>> {
    let uid_list: String = uids
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",");

    // Round trip 1: envelopes + body structure.
    let stream = tokio::time::timeout(
        COMMAND_TIMEOUT,
        conn.session.uid_fetch(&uid_list, "(UID ENVELOPE BODYSTRUCTURE)"),
    )
    .await
    .map_err(|_| Error::Transient("FETCH envelopes timed out".to_string()))?
    .map_err(|e| Error::Imap(format!("FETCH envelopes failed: {}", e)))?;
    let fetches = collect_tolerant(stream, "envelopes").await;

    let mut emails: Vec<FetchedEmail> = Vec::new();
    // uid -> (part path, is_html, transfer encoding, charset)
    let mut text_parts: Vec<(u32, Vec<u32>, bool, String, Option<String>)> = Vec::new();

    for fetch in &fetches {
        let Some(meta) = parse_meta(fetch) else {
            continue;
        };

        if let Some(bs) = fetch.bodystructure() {
            if let Some((part, encoding, charset)) = find_text_part(bs, &[], "plain") {
                text_parts.push((meta.uid, part, false, encoding_to_string(encoding), charset));
            } else if let Some((part, encoding, charset)) = find_text_part(bs, &[], "html") {
                text_parts.push((meta.uid, part, true, encoding_to_string(encoding), charset));
            }
        }

        let message_id = if meta.message_id.is_empty() {
            format!("<{}@{}>", meta.uid, host)
        } else {
            meta.message_id
        };

        emails.push(FetchedEmail {
            uid: meta.uid,
            message_id,
            subject: meta.subject,
            sender: meta.sender,
            body_text: String::new(),
            body_html: None,
            received_at: meta.received_at.unwrap_or_else(|| Utc::now().timestamp()),
        });
    }

    if text_parts.is_empty() {
        return Ok(emails);
    }

    // Round trip 2: bodies, grouped by part path so one FETCH covers all
    // messages that keep their text in the same section.
    let mut by_part: HashMap<Vec<u32>, Vec<u32>> = HashMap::new();
    let mut uid_is_html: HashMap<u32, bool> = HashMap::new();
    let mut uid_encoding: HashMap<u32, (String, Option<String>)> = HashMap::new();
    for (uid, part, is_html, encoding, charset) in text_parts {
        by_part.entry(part).or_default().push(uid);
        uid_is_html.insert(uid, is_html);
        uid_encoding.insert(uid, (encoding, charset));
    }

    for (part, part_uids) in &by_part {
        let part_uid_list: String = part_uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let fetch_query = format!("(UID BODY.PEEK[{}])", part_to_string(part));

        let stream = tokio::time::timeout(
            COMMAND_TIMEOUT,
            conn.session.uid_fetch(&part_uid_list, &fetch_query),
        )
        .await
        .map_err(|_| Error::Transient("FETCH body timed out".to_string()))?
        .map_err(|e| Error::Imap(format!("FETCH body failed: {}", e)))?;
        let body_fetches = collect_tolerant(stream, "bodies").await;

        let path = SectionPath::Part(part.clone(), None);
        for fetch in &body_fetches {
            let Some(uid) = fetch.uid else { continue };
            let Some(section) = fetch.section(&path) else {
                continue;
            };
            let (encoding, charset) = uid_encoding
                .get(&uid)
                .cloned()
                .unwrap_or((String::new(), None));
            let decoded = decode_body(section, &encoding, charset.as_deref());

            if let Some(email) = emails.iter_mut().find(|e| e.uid == uid) {
                if uid_is_html.get(&uid).copied().unwrap_or(false) {
                    email.body_html = Some(decoded);
                } else {
                    email.body_text = decoded;
                }
            }
        }
    }

    Ok(emails)
}

/// Mirror local read state to the server: `+FLAGS \Seen` for the given
/// UIDs. Requires a read-write selection.
pub async fn mark_seen(conn: &mut ImapConnection, uids: &[u32]) -> Result<()> {
    if uids.is_empty() {
        return Ok(());
    }
    let uid_list: String = uids
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let stream = tokio::time::timeout(
        COMMAND_TIMEOUT,
        conn.session.uid_store(&uid_list, "+FLAGS (\\Seen)"),
    )
    .await
    .map_err(|_| Error::Transient("STORE \\Seen timed out".to_string()))?
    .map_err(|e| Error::Imap(format!("STORE \\Seen failed: {}", e)))?;

    // Drain the untagged responses; we only care that the command ran.
    let _ = collect_tolerant(stream, "store-seen").await;
    Ok(())
}

// ---------------------------------------------------------------------------
// MIME part helpers
// ---------------------------------------------------------------------------

type TextPart<'a> = (Vec<u32>, &'a ContentEncoding<'a>, Option<String>);

fn charset_param(params: &imap_proto::types::BodyParams) -> Option<String> {
    params.as_ref().and_then(|list| {
        list.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("charset"))
            .map(|(_, v)| v.to_string())
    })
}

fn find_text_part<'a>(
    body: &'a BodyStructure<'a>,
    prefix: &[u32],
    subtype: &str,
) -> Option<TextPart<'a>> {
    match body {
        BodyStructure::Text { common, other, .. } => {
            if common.ty.subtype.to_lowercase() == subtype {
                let path = if prefix.is_empty() {
                    vec![1]
                } else {
                    prefix.to_vec()
                };
                Some((path, &other.transfer_encoding, charset_param(&common.ty.params)))
            } else {
                None
            }
        }
        BodyStructure::Basic { common, other, .. } => {
            let mime = format!(
                "{}/{}",
                common.ty.ty.to_lowercase(),
                common.ty.subtype.to_lowercase()
            );
            if mime == format!("text/{}", subtype) {
                let path = if prefix.is_empty() {
                    vec![1]
                } else {
                    prefix.to_vec()
                };
                Some((path, &other.transfer_encoding, charset_param(&common.ty.params)))
            } else {
                None
            }
        }
        BodyStructure::Multipart { bodies, .. } => {
            for (i, part) in bodies.iter().enumerate() {
                let mut part_path = prefix.to_vec();
                part_path.push((i + 1) as u32);
                if let Some(found) = find_text_part(part, &part_path, subtype) {
                    return Some(found);
                }
            }
            None
        }
        BodyStructure::Message { body, .. } => {
            let inner = if prefix.is_empty() {
                vec![1]
            } else {
                prefix.to_vec()
            };
            find_text_part(body, &inner, subtype)
        }
    }
}

fn encoding_to_string(enc: &ContentEncoding) -> String {
    match enc {
        ContentEncoding::SevenBit => "7bit".to_string(),
        ContentEncoding::EightBit => "8bit".to_string(),
        ContentEncoding::Binary => "binary".to_string(),
        ContentEncoding::Base64 => "base64".to_string(),
        ContentEncoding::QuotedPrintable => "quoted-printable".to_string(),
        ContentEncoding::Other(s) => s.to_lowercase(),
    }
}

fn part_to_string(part: &[u32]) -> String {
    part.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Undo the transfer encoding, then decode the declared charset.
/// Anything we cannot decode exactly falls back to UTF-8 with
/// replacement characters.
fn decode_body(raw: &[u8], encoding: &str, charset: Option<&str>) -> String {
    let bytes = match encoding {
        "quoted-printable" => quoted_printable::decode(raw, quoted_printable::ParseMode::Robust)
            .unwrap_or_else(|_| raw.to_vec()),
        "base64" => {
            let cleaned: Vec<u8> = raw
                .iter()
                .filter(|b| !b.is_ascii_whitespace())
                .copied()
                .collect();
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(&cleaned)
                .unwrap_or_else(|_| raw.to_vec())
        }
        _ => raw.to_vec(),
    };

    match charset.map(|c| c.to_ascii_lowercase()).as_deref() {
        // Latin-1 maps bytes to code points directly.
        Some("iso-8859-1") | Some("latin1") => bytes.iter().map(|&b| b as char).collect(),
        _ => String::from_utf8_lossy(&bytes).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_round_trip() {
        let raw = format_watermark(1700000000, 4242);
        assert_eq!(parse_watermark(&raw), Some((1700000000, 4242)));
        assert_eq!(parse_watermark("garbage"), None);
        assert_eq!(parse_watermark("1:2:3"), None);
        assert_eq!(parse_watermark(""), None);
    }

    #[test]
    fn decode_quoted_printable_body() {
        let decoded = decode_body(b"caf=C3=A9 menu", "quoted-printable", Some("utf-8"));
        assert_eq!(decoded, "café menu");
    }

    #[test]
    fn decode_base64_body_ignores_line_breaks() {
        let decoded = decode_body(b"SGVsbG8g\r\nV29ybGQ=", "base64", None);
        assert_eq!(decoded, "Hello World");
    }

    #[test]
    fn decode_latin1_body() {
        let decoded = decode_body(&[0x63, 0x61, 0x66, 0xE9], "8bit", Some("ISO-8859-1"));
        assert_eq!(decoded, "café");
    }

    #[test]
    fn undecodable_bytes_fall_back_to_replacement() {
        let decoded = decode_body(&[0xFF, 0xFE, 0x63], "7bit", Some("utf-8"));
        assert!(decoded.contains('\u{FFFD}'));
        assert!(decoded.contains('c'));
    }

    #[test]
    fn part_path_rendering() {
        assert_eq!(part_to_string(&[1]), "1");
        assert_eq!(part_to_string(&[1, 2, 3]), "1.2.3");
    }
}
