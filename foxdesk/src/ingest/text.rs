//! Text clean-up for inbound mail.

/// Line endings to LF, control characters dropped (tabs kept), trailing whitespace trimmed on
/// every line and at the end.
pub fn normalize_body(input: &str) -> String {
    let unified = input.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<String> = unified
        .split('\n')
        .map(|line| {
            line.chars()
                .filter(|c| !c.is_control() || *c == '\t')
                .collect::<String>()
                .trim_end()
                .to_string()
        })
        .collect();
    lines.join("\n").trim_matches('\n').to_string()
}

/// One line, single spaces, no control characters.
pub fn normalize_subject(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Markers that introduce quoted history in replies, checked against the start of a line.
const REPLY_HEADER_PREFIXES: &[&str] = &[
    "-----original message-----",
    "-------- original message --------",
    "-----ursprüngliche nachricht-----",
    "________________________________",
];

fn is_attribution_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    // "On Tue, 3 Jun 2025 at 10:00, Jane <jane@example.com> wrote:"
    (lower.starts_with("on ") && lower.ends_with("wrote:"))
        || (lower.starts_with("am ") && lower.ends_with("schrieb:"))
        || (lower.starts_with("le ") && lower.ends_with("a écrit :"))
}

fn is_outlook_header(lines: &[&str], index: usize) -> bool {
    let line = lines[index].trim().to_lowercase();
    if !line.starts_with("from:") && !line.starts_with("von:") {
        return false;
    }
    lines
        .iter()
        .skip(index + 1)
        .take(4)
        .any(|next| {
            let next = next.trim().to_lowercase();
            next.starts_with("sent:") || next.starts_with("date:") || next.starts_with("gesendet:")
        })
}

/// Cut a reply down to the newly written text: everything from the first attribution line,
/// "original message" separator or Outlook-style header block onwards is dropped, along with
/// `>` quoted lines. Returns the input unchanged when nothing would be left.
pub fn strip_quoted_reply(body: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let mut kept: Vec<&str> = Vec::new();

    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        let lower = trimmed.to_lowercase();
        if is_attribution_line(trimmed)
            || REPLY_HEADER_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
            || is_outlook_header(&lines, index)
        {
            break;
        }
        if trimmed.starts_with('>') {
            continue;
        }
        kept.push(line);
    }

    let stripped = kept.join("\n").trim().to_string();
    if stripped.is_empty() { body.trim().to_string() } else { stripped }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_body() {
        let raw = "Hello\r\nworld  \r\n\r\nbye\u{0}\u{7}\tnow \r\n\r\n";
        assert_eq!(normalize_body(raw), "Hello\nworld\n\nbye\tnow");
    }

    #[test]
    fn test_normalize_subject() {
        assert_eq!(normalize_subject("  Printer\r\n   on fire\t again "), "Printer on fire again");
    }

    #[test]
    fn test_strip_gmail_style_reply() {
        let body = "Thanks, that fixed it.\n\nOn Tue, 3 Jun 2025 at 10:00, Support <help@example.com> wrote:\n> Have you tried\n> turning it off?";
        assert_eq!(strip_quoted_reply(body), "Thanks, that fixed it.");
    }

    #[test]
    fn test_strip_outlook_style_reply() {
        let body = "Still broken.\n\nFrom: Support <help@example.com>\nSent: Tuesday, June 3, 2025 10:00\nTo: Jane\nSubject: RE: [FD-1000] Printer";
        assert_eq!(strip_quoted_reply(body), "Still broken.");

        let body = "Still broken.\n-----Original Message-----\nFrom: Support";
        assert_eq!(strip_quoted_reply(body), "Still broken.");
    }

    #[test]
    fn test_inline_quotes_are_dropped() {
        let body = "> what model?\nLaserJet 4\n> which floor?\nThird";
        assert_eq!(strip_quoted_reply(body), "LaserJet 4\nThird");
    }

    #[test]
    fn test_fully_quoted_body_is_kept() {
        let body = "> only quoted text";
        assert_eq!(strip_quoted_reply(body), "> only quoted text");
    }
}
