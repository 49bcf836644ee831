//! IMAP server response parsing
//!
//! Only the responses the watcher reacts to are modelled; everything else
//! is kept as [`Untagged::Other`].

use std::collections::{BTreeSet, HashMap};

/// Capabilities advertised by the server, negotiated once per connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    names: BTreeSet<String>,
}

impl Capabilities {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| n.as_ref().trim().to_ascii_uppercase())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.names.contains(&name.to_ascii_uppercase())
    }

    pub fn idle(&self) -> bool {
        self.has("IDLE")
    }

    pub fn utf8_accept(&self) -> bool {
        self.has("ENABLE") && self.has("UTF8=ACCEPT")
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Counters from `STATUS`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub uid_next: Option<u32>,
    pub unseen: Option<u32>,
    pub recent: Option<u32>,
    pub messages: Option<u32>,
}

/// UID and flags of one message from `FETCH (UID FLAGS)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFlags {
    pub seq: u32,
    pub uid: u32,
    pub flags: Vec<String>,
}

impl FetchedFlags {
    fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }

    pub fn seen(&self) -> bool {
        self.has_flag("\\Seen")
    }

    pub fn flagged(&self) -> bool {
        self.has_flag("\\Flagged")
    }

    pub fn deleted(&self) -> bool {
        self.has_flag("\\Deleted")
    }
}

/// Untagged (`* ...`) server response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Untagged {
    Exists(u32),
    Expunge(u32),
    Recent(u32),
    Fetch {
        seq: u32,
        uid: Option<u32>,
        flags: Option<Vec<String>>,
    },
    Capability(Vec<String>),
    Status {
        mailbox: String,
        items: HashMap<String, u32>,
    },
    Search(Vec<u32>),
    List {
        delimiter: Option<char>,
        name: String,
    },
    Bye(String),
    Other(String),
}

/// Completion status of a tagged response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Ok,
    No,
    Bad,
}

/// Tagged completion line, e.g. `A0003 NO [AUTHENTICATIONFAILED] bad password`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tagged {
    pub tag: String,
    pub status: Completion,
    pub text: String,
}

impl Tagged {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end();
        let (tag, rest) = line.split_once(' ')?;
        if tag == "*" || tag == "+" {
            return None;
        }
        let (status, text) = rest.split_once(' ').unwrap_or((rest, ""));
        let status = match status.to_ascii_uppercase().as_str() {
            "OK" => Completion::Ok,
            "NO" => Completion::No,
            "BAD" => Completion::Bad,
            _ => return None,
        };
        Some(Self {
            tag: tag.to_string(),
            status,
            text: text.to_string(),
        })
    }

    /// Response code in brackets, upper-cased (`AUTHENTICATIONFAILED`)
    pub fn code(&self) -> Option<String> {
        response_code(&self.text).map(|c| c.to_ascii_uppercase())
    }
}

/// Text inside a leading `[...]` response code
pub fn response_code(text: &str) -> Option<&str> {
    let rest = text.trim_start().strip_prefix('[')?;
    let end = rest.find(']')?;
    Some(&rest[..end])
}

/// Capability names from a `[CAPABILITY ...]` response code
pub fn capability_code(text: &str) -> Option<Vec<String>> {
    let code = response_code(text)?;
    let mut parts = code.split_whitespace();
    if !parts.next()?.eq_ignore_ascii_case("CAPABILITY") {
        return None;
    }
    Some(parts.map(str::to_string).collect())
}

/// Parse one untagged response line (with or without trailing CRLF)
pub fn parse_untagged(line: &str) -> Option<Untagged> {
    let body = line.trim_end().strip_prefix("* ")?;
    let (first, rest) = body.split_once(' ').unwrap_or((body, ""));

    if let Ok(number) = first.parse::<u32>() {
        let (keyword, args) = rest.split_once(' ').unwrap_or((rest, ""));
        return Some(match keyword.to_ascii_uppercase().as_str() {
            "EXISTS" => Untagged::Exists(number),
            "EXPUNGE" => Untagged::Expunge(number),
            "RECENT" => Untagged::Recent(number),
            "FETCH" => parse_fetch(number, args),
            _ => Untagged::Other(body.to_string()),
        });
    }

    Some(match first.to_ascii_uppercase().as_str() {
        "CAPABILITY" => Untagged::Capability(rest.split_whitespace().map(str::to_string).collect()),
        "STATUS" => parse_status(rest).unwrap_or_else(|| Untagged::Other(body.to_string())),
        "SEARCH" => Untagged::Search(
            rest.split_whitespace()
                .filter_map(|n| n.parse().ok())
                .collect(),
        ),
        "LIST" => parse_list(rest).unwrap_or_else(|| Untagged::Other(body.to_string())),
        "BYE" => Untagged::Bye(rest.to_string()),
        "OK" => match capability_code(rest) {
            Some(caps) => Untagged::Capability(caps),
            None => Untagged::Other(body.to_string()),
        },
        _ => Untagged::Other(body.to_string()),
    })
}

/// S-expression item of a parenthesized IMAP list
#[derive(Debug, Clone, PartialEq, Eq)]
enum Item {
    Atom(String),
    List(Vec<Item>),
}

impl Item {
    fn as_atom(&self) -> Option<&str> {
        match self {
            Item::Atom(s) => Some(s),
            Item::List(_) => None,
        }
    }
}

/// Parse a sequence of atoms, quoted strings and nested lists
fn parse_items(input: &str) -> Vec<Item> {
    fn parse_seq(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, nested: bool) -> Vec<Item> {
        let mut items = Vec::new();
        while let Some(&c) = chars.peek() {
            match c {
                ' ' | '\t' | '\r' | '\n' => {
                    chars.next();
                }
                '(' => {
                    chars.next();
                    items.push(Item::List(parse_seq(chars, true)));
                }
                ')' => {
                    chars.next();
                    if nested {
                        return items;
                    }
                }
                '"' => {
                    chars.next();
                    let mut s = String::new();
                    while let Some(c) = chars.next() {
                        match c {
                            '\\' => {
                                if let Some(escaped) = chars.next() {
                                    s.push(escaped);
                                }
                            }
                            '"' => break,
                            other => s.push(other),
                        }
                    }
                    items.push(Item::Atom(s));
                }
                _ => {
                    let mut s = String::new();
                    while let Some(&c) = chars.peek() {
                        if c == ' ' || c == '(' || c == ')' || c == '\r' || c == '\n' {
                            break;
                        }
                        s.push(c);
                        chars.next();
                    }
                    items.push(Item::Atom(s));
                }
            }
        }
        items
    }

    parse_seq(&mut input.chars().peekable(), false)
}

fn parse_fetch(seq: u32, args: &str) -> Untagged {
    let items = parse_items(args);
    let attrs = match items.first() {
        Some(Item::List(attrs)) => attrs.as_slice(),
        _ => &[],
    };

    let mut uid = None;
    let mut flags = None;
    let mut iter = attrs.iter();
    while let Some(name) = iter.next() {
        let Some(name) = name.as_atom() else { continue };
        match name.to_ascii_uppercase().as_str() {
            "UID" => uid = iter.next().and_then(Item::as_atom).and_then(|v| v.parse().ok()),
            "FLAGS" => {
                if let Some(Item::List(list)) = iter.next() {
                    flags = Some(
                        list.iter()
                            .filter_map(Item::as_atom)
                            .map(str::to_string)
                            .collect(),
                    );
                }
            }
            _ => {
                iter.next();
            }
        }
    }

    Untagged::Fetch { seq, uid, flags }
}

fn parse_status(rest: &str) -> Option<Untagged> {
    let items = parse_items(rest);
    let mailbox = items.first()?.as_atom()?.to_string();
    let Some(Item::List(pairs)) = items.get(1) else {
        return None;
    };

    let mut map = HashMap::new();
    for pair in pairs.chunks(2) {
        if let [Item::Atom(key), Item::Atom(value)] = pair {
            if let Ok(v) = value.parse() {
                map.insert(key.to_ascii_uppercase(), v);
            }
        }
    }

    Some(Untagged::Status {
        mailbox,
        items: map,
    })
}

fn parse_list(rest: &str) -> Option<Untagged> {
    let items = parse_items(rest);
    let delimiter = match items.get(1)? {
        Item::Atom(d) if !d.eq_ignore_ascii_case("NIL") => d.chars().next(),
        _ => None,
    };
    let name = items.get(2).and_then(Item::as_atom).unwrap_or_default().to_string();
    Some(Untagged::List { delimiter, name })
}

impl From<&HashMap<String, u32>> for MailboxStatus {
    fn from(items: &HashMap<String, u32>) -> Self {
        MailboxStatus {
            uid_next: items.get("UIDNEXT").copied(),
            unseen: items.get("UNSEEN").copied(),
            recent: items.get("RECENT").copied(),
            messages: items.get("MESSAGES").copied(),
        }
    }
}

/// Compress sequence numbers into an IMAP sequence set (`1:3,7,9:10`)
pub fn compact_sequence_set(numbers: &[u32]) -> String {
    let sorted: BTreeSet<u32> = numbers.iter().copied().collect();
    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();

    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;

    for n in iter {
        if n == end + 1 {
            end = n;
            continue;
        }
        parts.push(format_range(start, end));
        start = n;
        end = n;
    }
    parts.push(format_range(start, end));

    parts.join(",")
}

fn format_range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}

/// Quote a string argument for an IMAP command
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
