use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};
use std::cmp::Reverse;
use log::warn;

use crate::chat::{FileUpload, PostPayload};
use crate::mail_reader::header::decode_header;
use crate::mail_reader::RawMessage;

pub const DEFAULT_TEMPLATE: &str = ":incoming_envelope: _From: **{}**_\n>_{}_\n\n{}";

/// Lines of plain text shown in the chat post itself.
pub const PREVIEW_LINES: usize = 5;

pub const HTML_DOCUMENT: &str = "email.html";
pub const TEXT_DOCUMENT: &str = "email.txt";

#[derive(Debug, Default, Clone)]
pub struct ParsedContent {
    pub from: String,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub inlines: Vec<InlinePart>,
    pub others: Vec<InlinePart>,
    pub attachments: Vec<Attachment>,
}

/// A part that HTML may reference through `cid:`.
#[derive(Debug, Default, Clone)]
pub struct InlinePart {
    pub content_id: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Default, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

impl ParsedContent {
    fn from_mail(parsed: &ParsedMail) -> ParsedContent {
        let mut content = ParsedContent {
            from: decoded_header(parsed, "From"),
            subject: decoded_header(parsed, "Subject"),
            ..Default::default()
        };
        collect_parts(parsed, &mut content);
        content
    }

    /// The file attached to the post alongside the preview: the HTML body with
    /// inline images embedded, or else the plain text body.
    pub fn body_document(&self) -> Option<FileUpload> {
        if let Some(html) = self.html.as_deref().filter(|html| !html.is_empty()) {
            let html = embed_inline_parts(html, self.inlines.iter().chain(&self.others));
            return Some(FileUpload::new(HTML_DOCUMENT, html.into_bytes()).with_content_type("text/html"));
        }
        self.text
            .as_deref()
            .filter(|text| !text.is_empty())
            .map(|text| {
                FileUpload::new(TEXT_DOCUMENT, text.as_bytes().to_vec()).with_content_type("text/plain")
            })
    }

    pub fn preview(&self) -> String {
        self.text
            .as_deref()
            .map(|text| preview(text, PREVIEW_LINES))
            .unwrap_or_default()
    }
}

// Raw header value so encoded-words go through our own decoder
fn decoded_header(parsed: &ParsedMail, key: &str) -> String {
    parsed
        .headers
        .get_first_header(key)
        .map(|header| decode_header(String::from_utf8_lossy(header.get_value_raw()).trim()))
        .unwrap_or_default()
}

fn collect_parts(part: &ParsedMail, content: &mut ParsedContent) {
    if part.ctype.mimetype.starts_with("multipart/") {
        for subpart in &part.subparts {
            collect_parts(subpart, content);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let mimetype = part.ctype.mimetype.to_lowercase();

    if disposition.disposition == DispositionType::Attachment {
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .map(|name| decode_header(name))
            .unwrap_or_else(|| format!("attachment-{}", content.attachments.len() + 1));
        match part.get_body_raw() {
            Ok(body) => content.attachments.push(Attachment {
                filename,
                content_type: mimetype,
                content: body,
            }),
            Err(e) => warn!("Skipping attachment {}: {}", filename, e),
        }
        return;
    }

    if mimetype == "text/html" && content.html.is_none() {
        match part.get_body() {
            Ok(body) => content.html = Some(body),
            Err(e) => warn!("Cannot decode HTML body: {}", e),
        }
        return;
    }

    if mimetype == "text/plain" && content.text.is_none() {
        match part.get_body() {
            Ok(body) => content.text = Some(body),
            Err(e) => warn!("Cannot decode text body: {}", e),
        }
        return;
    }

    let body = match part.get_body_raw() {
        Ok(body) => body,
        Err(e) => {
            warn!("Skipping {} part: {}", mimetype, e);
            return;
        }
    };
    let inline = InlinePart {
        content_id: part
            .headers
            .get_first_value("Content-ID")
            .map(|id| id.trim().to_string())
            .unwrap_or_default(),
        content_type: mimetype,
        content: body,
    };
    // mailparse reports Inline when the header is absent
    let explicit = part.headers.get_first_header("Content-Disposition").is_some();
    if explicit && disposition.disposition == DispositionType::Inline {
        content.inlines.push(inline);
    } else {
        content.others.push(inline);
    }
}

/// Parse a fetched message. Input that is not MIME at all is kept as a
/// plain-text body so the mail still reaches the channel.
pub fn parse_message(raw: &RawMessage) -> ParsedContent {
    let source = if raw.body.is_empty() { &raw.header } else { &raw.body };
    match parse_mail(source) {
        Ok(parsed) => ParsedContent::from_mail(&parsed),
        Err(e) => {
            warn!("Cannot parse message {:?}: {}", raw.id, e);
            ParsedContent {
                text: Some(String::from_utf8_lossy(source).into_owned()),
                ..Default::default()
            }
        }
    }
}

/// Replace every `cid:<id>` reference with a data URI built from the matching
/// part.
///
/// The first part carrying a given content-id wins. At each `cid:` the longest
/// known id that follows literally is taken, so `cid:img10` goes to `img10`
/// rather than to `img1`. Unknown ids and parts without an id are left alone.
pub fn embed_inline_parts<'a>(html: &str, parts: impl IntoIterator<Item = &'a InlinePart>) -> String {
    let mut uris: Vec<(String, String)> = Vec::new();
    for part in parts {
        let cid = part.content_id.replace(['<', '>'], "");
        if cid.is_empty() || uris.iter().any(|(known, _)| *known == cid) {
            continue;
        }
        let uri = format!("data:{};base64,{}", part.content_type, BASE64.encode(&part.content));
        uris.push((cid, uri));
    }
    if uris.is_empty() {
        return html.to_string();
    }
    uris.sort_by_key(|(cid, _)| Reverse(cid.len()));

    let mut embedded = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find("cid:") {
        embedded.push_str(&rest[..start]);
        let reference = &rest[start + 4..];
        match uris.iter().find(|(cid, _)| reference.starts_with(cid.as_str())) {
            Some((cid, uri)) => {
                embedded.push_str(uri);
                rest = &reference[cid.len()..];
            }
            None => {
                embedded.push_str("cid:");
                rest = reference;
            }
        }
    }
    embedded.push_str(rest);
    embedded
}

/// First `max_lines` lines of `text` followed by ` ...`, or `text` itself when
/// it is already short enough.
pub fn preview(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    format!("{} ...", lines[..max_lines].join("\n"))
}

/// Post text with three ordered `{}` slots: sender, subject, preview.
#[derive(Debug, Clone)]
pub struct MessageTemplate(String);

impl MessageTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        MessageTemplate(template.into())
    }

    pub fn render(&self, from: &str, subject: &str, preview: &str) -> String {
        let mut rendered = String::with_capacity(self.0.len() + preview.len());
        let mut rest = self.0.as_str();
        for value in [from, subject, preview] {
            let Some(slot) = rest.find("{}") else { break };
            rendered.push_str(&rest[..slot]);
            rendered.push_str(value);
            rest = &rest[slot + 2..];
        }
        rendered.push_str(rest);
        rendered
    }
}

impl Default for MessageTemplate {
    fn default() -> Self {
        MessageTemplate::new(DEFAULT_TEMPLATE)
    }
}

/// Turns fetched mail into posts for one channel.
#[derive(Debug, Clone)]
pub struct MimeTransformer {
    channel: String,
    template: MessageTemplate,
}

impl MimeTransformer {
    pub fn new(channel: impl Into<String>, template: MessageTemplate) -> Self {
        MimeTransformer {
            channel: channel.into(),
            template,
        }
    }

    pub fn transform(&self, raw: &RawMessage) -> PostPayload {
        self.build_payload(parse_message(raw))
    }

    pub fn build_payload(&self, content: ParsedContent) -> PostPayload {
        let message = self.template.render(&content.from, &content.subject, &content.preview());
        PostPayload {
            channel: self.channel.clone(),
            message,
            body_document: content.body_document(),
            attachments: content
                .attachments
                .into_iter()
                .map(|attachment| {
                    FileUpload::new(attachment.filename, attachment.content)
                        .with_content_type(attachment.content_type)
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(message: &str) -> RawMessage {
        RawMessage {
            body: message.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn transformer() -> MimeTransformer {
        MimeTransformer::new("town-square", MessageTemplate::new("{}|{}|{}"))
    }

    const RELATED: &str = "From: alice@example.com\r\n\
Subject: Chart\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/related; boundary=\"REL\"\r\n\
\r\n\
--REL\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p><img src=\"cid:img1\"><img src=\"cid:img10\"><img src=\"cid:missing\"></p>\r\n\
--REL\r\n\
Content-Type: image/png\r\n\
Content-Transfer-Encoding: base64\r\n\
Content-ID: <img1>\r\n\
Content-Disposition: inline\r\n\
\r\n\
WA==\r\n\
--REL\r\n\
Content-Type: image/gif\r\n\
Content-Transfer-Encoding: base64\r\n\
Content-ID: <img10>\r\n\
\r\n\
WQ==\r\n\
--REL--\r\n";

    #[test]
    fn plain_text_message_end_to_end() {
        let payload = transformer().transform(&raw(
            "From: =?UTF-8?B?Sm9obg==?=\r\nSubject: Hi\r\nContent-Type: text/plain\r\n\r\nline1\nline2",
        ));
        assert_eq!(payload.channel, "town-square");
        assert_eq!(payload.message, "John|Hi|line1\nline2");
        let document = payload.body_document.unwrap();
        assert_eq!(document.name, TEXT_DOCUMENT);
        assert_eq!(document.content_type.as_deref(), Some("text/plain"));
        assert_eq!(document.content, b"line1\nline2");
        assert!(payload.attachments.is_empty());
    }

    #[test]
    fn long_text_is_truncated_in_preview() {
        let content = parse_message(&raw(
            "Subject: Log\r\nContent-Type: text/plain\r\n\r\n1\n2\n3\n4\n5\n6\n7",
        ));
        assert_eq!(content.preview(), "1\n2\n3\n4\n5 ...");
    }

    #[test]
    fn preview_keeps_short_text_verbatim() {
        assert_eq!(preview("a\r\nb\r\nc", 5), "a\r\nb\r\nc");
        assert_eq!(preview("1\n2\n3\n4\n5", 5), "1\n2\n3\n4\n5");
        assert_eq!(preview("", 5), "");
    }

    #[test]
    fn preview_never_contains_sixth_line() {
        let text = "one\r\ntwo\nthree\nfour\nfive\nSIXTH\nseven";
        let short = preview(text, 5);
        assert_eq!(short, "one\ntwo\nthree\nfour\nfive ...");
        assert!(!short.contains("SIXTH"));
    }

    #[test]
    fn html_inline_image_becomes_data_uri() {
        let content = parse_message(&raw(RELATED));
        assert_eq!(content.inlines.len(), 1);
        assert_eq!(content.others.len(), 1);

        let document = content.body_document().unwrap();
        assert_eq!(document.name, HTML_DOCUMENT);
        let html = String::from_utf8(document.content).unwrap();
        assert_eq!(
            html.trim_end(),
            "<p><img src=\"data:image/png;base64,WA==\">\
<img src=\"data:image/gif;base64,WQ==\">\
<img src=\"cid:missing\"></p>"
        );
    }

    #[test]
    fn html_wins_over_text() {
        let message = "From: a@example.com\r\n\
Subject: Both\r\n\
Content-Type: multipart/alternative; boundary=\"ALT\"\r\n\
\r\n\
--ALT\r\n\
Content-Type: text/plain\r\n\
\r\n\
plain version\r\n\
--ALT\r\n\
Content-Type: text/html\r\n\
\r\n\
<b>html version</b>\r\n\
--ALT--\r\n";
        let payload = transformer().transform(&raw(message));
        assert_eq!(payload.body_document.unwrap().name, HTML_DOCUMENT);
        assert!(payload.message.starts_with("a@example.com|Both|plain version"));
    }

    #[test]
    fn attachments_keep_message_order() {
        let message = "From: a@example.com\r\n\
Subject: Files\r\n\
Content-Type: multipart/mixed; boundary=\"MIX\"\r\n\
\r\n\
--MIX\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
\r\n\
PDF\r\n\
--MIX\r\n\
Content-Type: text/csv\r\n\
Content-Disposition: attachment; filename=\"data.csv\"\r\n\
\r\n\
a,b\r\n\
--MIX--\r\n";
        let payload = transformer().transform(&raw(message));
        let names: Vec<_> = payload.attachments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["report.pdf", "data.csv"]);
        let types: Vec<_> = payload
            .attachments
            .iter()
            .map(|a| a.content_type.as_deref())
            .collect();
        assert_eq!(types, [Some("application/pdf"), Some("text/csv")]);
        assert!(payload.body_document.is_none());
        assert_eq!(payload.message, "a@example.com|Files|");
    }

    #[test]
    fn parts_without_content_id_are_inert() {
        let parts = [InlinePart {
            content_id: String::new(),
            content_type: "image/png".into(),
            content: b"X".to_vec(),
        }];
        let html = "<img src=\"cid:\"><img src=\"cid:img1\">";
        assert_eq!(embed_inline_parts(html, &parts), html);
    }

    #[test]
    fn every_matching_reference_is_replaced() {
        let parts = [InlinePart {
            content_id: "<logo@example.com>".into(),
            content_type: "image/png".into(),
            content: b"X".to_vec(),
        }];
        let html = "<img src=\"cid:logo@example.com\"> <img src='cid:logo@example.com'>";
        assert_eq!(
            embed_inline_parts(html, &parts),
            "<img src=\"data:image/png;base64,WA==\"> <img src='data:image/png;base64,WA=='>"
        );
    }

    #[test]
    fn references_end_wherever_the_id_ends() {
        let parts = [InlinePart {
            content_id: "<img1>".into(),
            content_type: "image/png".into(),
            content: b"X".to_vec(),
        }];
        let uri = "data:image/png;base64,WA==";
        assert_eq!(
            embed_inline_parts("<img src=cid:img1/>", &parts),
            format!("<img src={}/>", uri)
        );
        assert_eq!(
            embed_inline_parts("<img src=\"cid:img1?v=2\">", &parts),
            format!("<img src=\"{}?v=2\">", uri)
        );
        assert_eq!(
            embed_inline_parts("<a href=\"cid:img1&amp;x\">cid:img1</a>", &parts),
            format!("<a href=\"{}&amp;x\">{}</a>", uri, uri)
        );
    }

    #[test]
    fn longest_content_id_wins() {
        let parts = [
            InlinePart {
                content_id: "<img1>".into(),
                content_type: "image/png".into(),
                content: b"X".to_vec(),
            },
            InlinePart {
                content_id: "<img10>".into(),
                content_type: "image/gif".into(),
                content: b"Y".to_vec(),
            },
        ];
        assert_eq!(
            embed_inline_parts("cid:img10 cid:img1", &parts),
            "data:image/gif;base64,WQ== data:image/png;base64,WA=="
        );
    }

    #[test]
    fn empty_bodies_give_no_document() {
        let content = ParsedContent {
            text: Some(String::new()),
            html: Some(String::new()),
            ..Default::default()
        };
        assert!(content.body_document().is_none());
        assert_eq!(content.preview(), "");
    }

    #[test]
    fn header_only_message_is_parsed() {
        let message = RawMessage {
            header: b"From: a@example.com\r\nSubject: =?UTF-8?Q?Caf=C3=A9?=\r\n\r\n".to_vec(),
            ..Default::default()
        };
        let content = parse_message(&message);
        assert_eq!(content.subject, "Café");
        assert_eq!(content.from, "a@example.com");
    }

    #[test]
    fn template_fills_slots_in_order() {
        let template = MessageTemplate::new("From {} about {}: {} {}");
        assert_eq!(template.render("a", "b", "c"), "From a about b: c {}");
        assert_eq!(MessageTemplate::new("only {}").render("a", "b", "c"), "only a");
    }
}
