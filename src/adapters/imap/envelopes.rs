//! ENVELOPE parsing: addresses, RFC 2047 header decoding, date parsing.

use async_imap::types::Fetch;

/// Envelope-level metadata for one fetched message.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub uid: u32,
    /// RFC 5322 Message-ID, angle brackets preserved as sent. Empty when
    /// the header is missing; the caller synthesizes a stable fallback.
    pub message_id: String,
    pub subject: String,
    /// `mailbox@host`, lowercased host.
    pub sender: String,
    /// Unix seconds from the Date header; None when absent/unparseable.
    pub received_at: Option<i64>,
}

pub fn parse_meta(fetch: &Fetch) -> Option<MessageMeta> {
    let uid = fetch.uid?;
    let envelope = fetch.envelope()?;

    let message_id = envelope
        .message_id
        .as_ref()
        .map(|id| String::from_utf8_lossy(id).trim().to_string())
        .unwrap_or_default();

    let subject = envelope
        .subject
        .as_ref()
        .map(|s| decode_rfc2047(&String::from_utf8_lossy(s)))
        .unwrap_or_default();

    let sender = envelope
        .from
        .as_ref()
        .and_then(|addrs| addrs.first())
        .map(|addr| {
            let mailbox = addr
                .mailbox
                .as_ref()
                .map(|m| String::from_utf8_lossy(m).to_string())
                .unwrap_or_default();
            let host = addr
                .host
                .as_ref()
                .map(|h| String::from_utf8_lossy(h).to_lowercase())
                .unwrap_or_default();
            format!("{}@{}", mailbox, host)
        })
        .unwrap_or_default();

    let received_at = envelope
        .date
        .as_ref()
        .map(|d| String::from_utf8_lossy(d).to_string())
        .and_then(|d| mailparse::dateparse(&d).ok());

    Some(MessageMeta {
        uid,
        message_id,
        subject,
        sender,
        received_at,
    })
}

/// Decode RFC 2047 encoded-words by round-tripping through a fake header.
pub fn decode_rfc2047(input: &str) -> String {
    let fake_header = format!("X: {}", input);
    match mailparse::parse_header(fake_header.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_encoded_words() {
        assert_eq!(
            decode_rfc2047("=?UTF-8?B?SGVsbG8gV29ybGQ=?="),
            "Hello World"
        );
        assert_eq!(
            decode_rfc2047("=?utf-8?q?caf=C3=A9_menu?="),
            "café menu"
        );
        // Plain text passes through untouched.
        assert_eq!(decode_rfc2047("Alert: disk"), "Alert: disk");
    }
}
