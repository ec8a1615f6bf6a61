use std::collections::BTreeSet;
use std::sync::OnceLock;

use base64::Engine;
use regex_lite::Regex;

use super::{ExtractFailure, Extraction, Extractor, FailureReason, SourceFile};
use crate::domain::DocumentFormat;
use crate::normalize::dates::parse_rfc2822_date;

const KNOWN_HEADERS: &[&str] = &[
    "from",
    "to",
    "cc",
    "bcc",
    "date",
    "subject",
    "received",
    "return-path",
    "message-id",
    "mime-version",
    "content-type",
    "delivered-to",
    "reply-to",
];

const MAX_MULTIPART_DEPTH: usize = 4;

const ADDRESS_PATTERN: &str = r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}";

fn address_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ADDRESS_PATTERN).ok()).as_ref()
}

/// RFC 5322 message: headers, a blank line, then a body.
pub struct EmailExtractor;

fn header_name(line: &str) -> Option<&str> {
    let (name, _) = line.split_once(':')?;
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    ok.then_some(name)
}

/// True when the text opens with a header block containing `From` and one other known header.
pub(crate) fn looks_like_email(text: &str) -> bool {
    let mut known = 0usize;
    let mut has_from = false;
    let mut saw_header = false;
    for line in text.trim_start_matches('\u{feff}').lines() {
        if line.trim().is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if !saw_header {
                return false;
            }
            continue;
        }
        let Some(name) = header_name(line) else {
            return false;
        };
        saw_header = true;
        let lower = name.to_ascii_lowercase();
        if KNOWN_HEADERS.contains(&lower.as_str()) {
            known += 1;
        }
        if lower == "from" {
            has_from = true;
        }
    }
    has_from && known >= 2
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Part {
    headers: Vec<(String, String)>,
    body: String,
}

impl Part {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn headers_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

fn parse_part(raw: &str) -> Part {
    let normalized = raw.replace("\r\n", "\n");
    let (head, body) = match normalized.split_once("\n\n") {
        Some((h, b)) => (h.to_string(), b.to_string()),
        None => (normalized.clone(), String::new()),
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, v)) = headers.last_mut() {
                v.push(' ');
                v.push_str(line.trim());
            }
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.push((k.trim().to_ascii_lowercase(), v.trim().to_string()));
        }
    }
    Part { headers, body }
}

/// `multipart/mixed; boundary="abc"` -> ("multipart/mixed", Some("abc")).
fn content_type(part: &Part) -> (String, Option<String>) {
    let Some(raw) = part.header("content-type") else {
        return ("text/plain".to_string(), None);
    };
    let mut pieces = raw.split(';');
    let mime = pieces.next().unwrap_or("").trim().to_ascii_lowercase();
    let boundary = pieces.find_map(|p| {
        let (k, v) = p.split_once('=')?;
        (k.trim().eq_ignore_ascii_case("boundary")).then(|| v.trim().trim_matches('"').to_string())
    });
    (mime, boundary)
}

fn decode_quoted_printable(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' {
            if bytes.get(i + 1) == Some(&b'\n') {
                i += 2;
                continue;
            }
            if let (Some(h), Some(l)) = (bytes.get(i + 1), bytes.get(i + 2)) {
                let hex = [*h, *l];
                if let Ok(v) = u8::from_str_radix(&String::from_utf8_lossy(&hex), 16) {
                    out.push(v);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn decode_body(part: &Part) -> Result<String, ExtractFailure> {
    let encoding = part
        .header("content-transfer-encoding")
        .unwrap_or("7bit")
        .trim()
        .to_ascii_lowercase();
    match encoding.as_str() {
        "quoted-printable" => Ok(decode_quoted_printable(&part.body)),
        "base64" => {
            let compact: String = part.body.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(compact.as_bytes())
                .map_err(|e| {
                    ExtractFailure::new(
                        FailureReason::CorruptFile,
                        format!("invalid base64 body: {e}"),
                    )
                })?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Ok(part.body.clone()),
    }
}

fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Best text body of a (possibly multipart) part: first text/plain, else stripped text/html.
fn body_text(part: &Part, depth: usize) -> Result<Option<String>, ExtractFailure> {
    let (mime, boundary) = content_type(part);
    if mime.starts_with("multipart/") {
        if depth >= MAX_MULTIPART_DEPTH {
            return Err(ExtractFailure::new(
                FailureReason::ExtractionFailed,
                "multipart nesting too deep",
            ));
        }
        let Some(boundary) = boundary else {
            return Err(ExtractFailure::new(
                FailureReason::CorruptFile,
                "multipart message without boundary",
            ));
        };
        let delimiter = format!("--{boundary}");
        let mut html: Option<String> = None;
        for chunk in part.body.split(delimiter.as_str()).skip(1) {
            if chunk.starts_with("--") {
                break;
            }
            let sub = parse_part(chunk.trim_start_matches('\n'));
            let (sub_mime, _) = content_type(&sub);
            if sub_mime == "text/html" {
                if html.is_none() {
                    html = Some(strip_html(&decode_body(&sub)?));
                }
                continue;
            }
            if let Some(text) = body_text(&sub, depth + 1)? {
                return Ok(Some(text));
            }
        }
        return Ok(html);
    }
    match mime.as_str() {
        "text/plain" => Ok(Some(decode_body(part)?)),
        "text/html" => Ok(Some(strip_html(&decode_body(part)?))),
        _ => Ok(None),
    }
}

fn addresses(values: &[&str]) -> Vec<String> {
    let Some(re) = address_re() else {
        return Vec::new();
    };
    let mut set = BTreeSet::new();
    for v in values {
        for m in re.find_iter(v) {
            set.insert(m.as_str().to_ascii_lowercase());
        }
    }
    set.into_iter().collect()
}

impl Extractor for EmailExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Email
    }

    fn extract(&self, src: &SourceFile<'_>) -> Result<Extraction, ExtractFailure> {
        let raw = std::str::from_utf8(src.bytes).map_err(|e| {
            ExtractFailure::new(FailureReason::CorruptFile, format!("email is not UTF-8: {e}"))
        })?;
        let message = parse_part(raw.trim_start_matches('\u{feff}'));

        let body = body_text(&message, 0)?.unwrap_or_default();
        let text = match message.header("subject") {
            Some(subject) if !subject.is_empty() => format!("{subject}\n\n{}", body.trim()),
            _ => body.trim().to_string(),
        };

        let declared = message.header("date").and_then(parse_rfc2822_date);
        // Received headers are prepended per hop; the last one is the earliest.
        let observed = message
            .headers_all("received")
            .last()
            .and_then(|r| r.rsplit_once(';'))
            .and_then(|(_, d)| parse_rfc2822_date(d));

        let mut party_headers = message.headers_all("from");
        party_headers.extend(message.headers_all("to"));
        party_headers.extend(message.headers_all("cc"));

        Ok(Extraction {
            text,
            declared,
            observed,
            participants: addresses(&party_headers),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use time::macros::date;

    fn extract(raw: &str) -> Extraction {
        let path = PathBuf::from("msg.eml");
        EmailExtractor
            .extract(&SourceFile {
                path: &path,
                bytes: raw.as_bytes(),
            })
            .unwrap()
    }

    #[test]
    fn plain_message_dates_and_participants() {
        let raw = "Received: from relay2 by mx; Mon, 10 Jul 2023 08:00:00 +0000\n\
Received: from origin by relay2; Sun, 09 Jul 2023 23:00:00 +0000\n\
From: Claims Desk <Claims@Insurer.example>\n\
To: claimant@example.org,\n\
\tcounsel@lawfirm.example\n\
Date: Wed, 01 Mar 2023 09:00:00 +0000\n\
Subject: Claim decision\n\
\n\
Your claim is denied.\n";
        let ex = extract(raw);
        assert_eq!(ex.text, "Claim decision\n\nYour claim is denied.");
        assert_eq!(ex.declared, Some(date!(2023 - 03 - 01)));
        assert_eq!(ex.observed, Some(date!(2023 - 07 - 09)));
        assert_eq!(
            ex.participants,
            vec![
                "claimant@example.org".to_string(),
                "claims@insurer.example".to_string(),
                "counsel@lawfirm.example".to_string(),
            ]
        );
    }

    #[test]
    fn multipart_prefers_plain_and_decodes_transfer_encodings() {
        let raw = "From: a@example.com\n\
Date: Wed, 01 Mar 2023 09:00:00 +0000\n\
Content-Type: multipart/alternative; boundary=\"XYZ\"\n\
\n\
--XYZ\n\
Content-Type: text/html\n\
\n\
<p>html version</p>\n\
--XYZ\n\
Content-Type: text/plain\n\
Content-Transfer-Encoding: base64\n\
\n\
cGxhaW4gdmVyc2lvbg==\n\
--XYZ--\n";
        assert_eq!(extract(raw).text, "plain version");

        assert_eq!(decode_quoted_printable("caf=C3=A9 =\nline"), "café line");
    }

    #[test]
    fn detects_header_blocks() {
        assert!(looks_like_email("From: a@b.example\nSubject: hi\n\nbody"));
        assert!(!looks_like_email("Subject: hi\nTo: x@y.example\n\nno from header"));
        assert!(!looks_like_email("Dear Sir: this is a letter\nregards"));
    }
}
