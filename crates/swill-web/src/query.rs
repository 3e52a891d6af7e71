/// Whose check-ins a command is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Requester,
    /// A Slack user mentioned as `<@U123|name>` or `<@U123>`.
    User(String),
    /// `<!channel>`, `<!here>` or `<!everyone>`: every registered user.
    Everyone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedText {
    pub target: Target,
    pub query: String,
}

const BROADCAST_TAGS: [&str; 3] = ["<!channel>", "<!here>", "<!everyone>"];

fn after_first_word(text: &str) -> String {
    text.split_once(char::is_whitespace)
        .map(|(_, rest)| rest.trim().to_string())
        .unwrap_or_default()
}

/// Splits a leading mention or broadcast tag from the rest of the command text.
pub fn parse_text(text: &str) -> ParsedText {
    let text = text.trim();
    if BROADCAST_TAGS.iter().any(|tag| text.contains(tag)) {
        return ParsedText {
            target: Target::Everyone,
            query: after_first_word(text),
        };
    }
    if let Some(start) = text.find("<@") {
        let rest = &text[start + 2..];
        let end = rest.find(|c: char| c == '|' || c == '>').unwrap_or(rest.len());
        let user_id = rest[..end].trim();
        if !user_id.is_empty() {
            return ParsedText {
                target: Target::User(user_id.to_string()),
                query: after_first_word(text),
            };
        }
    }
    ParsedText {
        target: Target::Requester,
        query: text.to_string(),
    }
}

fn closer_for(c: char) -> Option<char> {
    match c {
        '(' => Some(')'),
        '[' => Some(']'),
        '{' => Some('}'),
        _ => None,
    }
}

fn push_query(out: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(trimmed)
        .trim();
    if !unquoted.is_empty() {
        out.push(unquoted.to_string());
    }
}

/// Splits `/tick` text into beer queries on commas and newlines.
///
/// Separators inside double quotes or brackets do not split. An unbalanced
/// quote or bracket drops the tail of the text from where it was opened.
pub fn split_queries(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut closers: Vec<char> = Vec::new();
    let mut in_quotes = false;
    // byte offset in `current` where the outermost open quote/bracket started
    let mut opened_at: Option<usize> = None;

    for c in text.chars() {
        if in_quotes {
            if c == '"' {
                in_quotes = false;
                if closers.is_empty() {
                    opened_at = None;
                }
            }
            current.push(c);
            continue;
        }
        match c {
            '"' => {
                in_quotes = true;
                opened_at.get_or_insert(current.len());
                current.push(c);
            }
            ',' | '\n' | '\r' if closers.is_empty() => {
                push_query(&mut out, &current);
                current.clear();
            }
            _ => {
                if let Some(closer) = closer_for(c) {
                    opened_at.get_or_insert(current.len());
                    closers.push(closer);
                } else if closers.last() == Some(&c) {
                    closers.pop();
                    if closers.is_empty() {
                        opened_at = None;
                    }
                }
                current.push(c);
            }
        }
    }

    if let Some(at) = opened_at {
        current.truncate(at);
    }
    push_query(&mut out, &current);
    out
}
