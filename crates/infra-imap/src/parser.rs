use courier_domain::{Address, Attachment, MailParser, ParsedMail};
use courier_error::RelayError;
use mailparse::{DispositionType, MailAddr, MailHeaderMap};

/// [`MailParser`] backed by `mailparse`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MimeParser;

impl MailParser for MimeParser {
    fn parse(&self, raw: &[u8]) -> Result<ParsedMail, RelayError> {
        let parsed = mailparse::parse_mail(raw)
            .map_err(|e| RelayError::parse(format!("mailparse: {e}")))?;

        let headers = parsed.get_headers();
        let subject = headers.get_first_value("Subject").unwrap_or_default();
        let from = headers
            .get_first_header("From")
            .map(|h| match mailparse::addrparse_header(h) {
                Ok(list) => list.iter().flat_map(flatten_addr).collect(),
                Err(_) => vec![Address {
                    address: h.get_value().trim().to_string(),
                    name: None,
                }],
            })
            .unwrap_or_default();

        let mut attachments = Vec::new();
        collect_attachments(&parsed, &mut attachments)?;

        Ok(ParsedMail {
            from,
            subject,
            text: extract_text(&parsed),
            attachments,
        })
    }
}

fn flatten_addr(addr: &MailAddr) -> Vec<Address> {
    match addr {
        MailAddr::Single(info) => vec![Address {
            address: info.addr.clone(),
            name: info.display_name.clone(),
        }],
        MailAddr::Group(group) => group
            .addrs
            .iter()
            .map(|info| Address {
                address: info.addr.clone(),
                name: info.display_name.clone(),
            })
            .collect(),
    }
}

fn extract_text(parsed: &mailparse::ParsedMail<'_>) -> String {
    if let Some(text) = find_text_part(parsed, "text/plain") {
        return text;
    }
    if let Some(html) = find_text_part(parsed, "text/html") {
        return strip_html(&html);
    }
    if parsed.subparts.is_empty() {
        return parsed.get_body().unwrap_or_default();
    }
    String::new()
}

fn find_text_part(parsed: &mailparse::ParsedMail<'_>, target: &str) -> Option<String> {
    if parsed.subparts.is_empty() {
        if attachment_name(parsed).is_some() {
            return None;
        }
        if parsed.ctype.mimetype.eq_ignore_ascii_case(target) {
            return parsed.get_body().ok();
        }
        return None;
    }
    parsed
        .subparts
        .iter()
        .find_map(|part| find_text_part(part, target))
}

fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Filename of a part that should be treated as an attachment.
fn attachment_name(part: &mailparse::ParsedMail<'_>) -> Option<String> {
    let disp = part.get_content_disposition();
    let named = disp
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();
    match disp.disposition {
        DispositionType::Attachment => Some(named.unwrap_or_else(|| "attachment".to_string())),
        _ => named,
    }
}

fn collect_attachments(
    parsed: &mailparse::ParsedMail<'_>,
    out: &mut Vec<Attachment>,
) -> Result<(), RelayError> {
    for part in &parsed.subparts {
        if !part.subparts.is_empty() {
            collect_attachments(part, out)?;
            continue;
        }
        if let Some(filename) = attachment_name(part) {
            let content = part
                .get_body_raw()
                .map_err(|e| RelayError::parse(format!("attachment {filename}: {e}")))?;
            out.push(Attachment { filename, content });
        }
    }
    Ok(())
}
