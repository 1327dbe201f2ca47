//! Text command grammar: tokenizing, `key=value` attribute splitting, the
//! size-suffix table, and the trace-file line format. This module builds
//! [`Command`] values; it has no engine logic of its own — `master` and
//! `engine` are what interpret them.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::error::{EngineError, Result};
use crate::registry::Class;

/// A parsed `key=value,key=value,...` attribute list. `after` is the only
/// repeatable key, so it gets its own accumulator.
#[derive(Debug, Default, Clone)]
pub struct Attrs {
    values: HashMap<String, String>,
    pub after: Vec<String>,
}

impl Attrs {
    fn parse(raw: &str) -> Result<Self> {
        let mut attrs = Attrs::default();
        if raw.is_empty() {
            return Ok(attrs);
        }
        for pair in raw.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                EngineError::Usage(format!("attribute {pair:?} is missing '='"))
            })?;
            let key = key.trim();
            let value = value.trim();
            if key == "after" {
                attrs.after.push(value.to_string());
                continue;
            }
            if attrs.values.insert(key.to_string(), value.to_string()).is_some() {
                return Err(EngineError::Usage(format!("duplicate attribute key {key:?}")));
            }
        }
        Ok(attrs)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| EngineError::Usage(format!("missing required attribute {key:?}")))
    }

    /// Parses a decimal integer, optionally carrying one of the size
    /// suffixes `k K m M g G t T` (lower-case decimal, upper-case binary).
    pub fn get_size(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => parse_size(raw).map(Some),
        }
    }

    pub fn require_size(&self, key: &str) -> Result<u64> {
        self.get_size(key)?
            .ok_or_else(|| EngineError::Usage(format!("missing required attribute {key:?}")))
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<u64>()
                .map(Some)
                .map_err(|_| EngineError::Usage(format!("attribute {key} is not an integer"))),
        }
    }
}

/// `k=10^3, K=2^10, m=10^6, M=2^20, g=10^9, G=2^30, t=10^12, T=2^40`. No
/// suffix means the raw decimal value.
pub fn parse_size(raw: &str) -> Result<u64> {
    let bad = || EngineError::Usage(format!("invalid size value {raw:?}"));
    if raw.is_empty() {
        return Err(bad());
    }
    let (digits, mult) = match raw.chars().last().unwrap() {
        'k' => (&raw[..raw.len() - 1], 1_000u64),
        'K' => (&raw[..raw.len() - 1], 1u64 << 10),
        'm' => (&raw[..raw.len() - 1], 1_000_000u64),
        'M' => (&raw[..raw.len() - 1], 1u64 << 20),
        'g' => (&raw[..raw.len() - 1], 1_000_000_000u64),
        'G' => (&raw[..raw.len() - 1], 1u64 << 30),
        't' => (&raw[..raw.len() - 1], 1_000_000_000_000u64),
        'T' => (&raw[..raw.len() - 1], 1u64 << 40),
        _ => (raw, 1u64),
    };
    let base: u64 = digits.parse().map_err(|_| bad())?;
    base.checked_mul(mult).ok_or_else(bad)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WctlOp {
    Add,
    Queue,
    Start,
    Mod,
    Del,
}

impl WctlOp {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(WctlOp::Add),
            "queue" => Ok(WctlOp::Queue),
            "start" => Ok(WctlOp::Start),
            "mod" => Ok(WctlOp::Mod),
            "del" => Ok(WctlOp::Del),
            _ => Err(EngineError::Usage(format!("unknown wctl op {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOp {
    Queue,
    Start,
    Del,
}

impl LinkOp {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "queue" => Ok(LinkOp::Queue),
            "start" => Ok(LinkOp::Start),
            "del" => Ok(LinkOp::Del),
            _ => Err(EngineError::Usage(format!("unknown link op {s:?}"))),
        }
    }
}

/// One member of a `link queue` command's `w1=n1,w2=n2,...` list.
#[derive(Debug, Clone)]
pub struct LinkMember {
    pub label: String,
    pub quantum: u64,
}

#[derive(Debug, Clone)]
pub enum Command {
    Wctl {
        op: WctlOp,
        class: Class,
        attrs: Attrs,
    },
    Link {
        op: LinkOp,
        label: String,
        members: Vec<LinkMember>,
    },
    Info {
        class: Option<Class>,
        worker: Option<String>,
        detail: bool,
    },
    Wait {
        class: Option<Class>,
        time: Option<f64>,
    },
    Helo,
    Quit,
}

impl Command {
    /// Parses one whitespace-separated command line. Blank lines and lines
    /// starting with `#` are not valid commands; callers filter those out
    /// before calling this (the trace-file reader does).
    pub fn parse(line: &str) -> Result<Command> {
        let line = line.trim();
        let mut parts = line.splitn(2, char::is_whitespace);
        let verb = parts
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| EngineError::Usage("empty command".to_string()))?;
        let rest = parts.next().unwrap_or("").trim();

        match verb {
            "wctl" => parse_wctl(rest),
            "link" => parse_link(rest),
            "info" => parse_info(rest),
            "wait" => parse_wait(rest),
            "helo" => Ok(Command::Helo),
            "quit" => Ok(Command::Quit),
            other => Err(EngineError::Usage(format!("unknown command {other:?}"))),
        }
    }
}

fn parse_wctl(rest: &str) -> Result<Command> {
    let mut it = rest.splitn(3, char::is_whitespace);
    let op = it
        .next()
        .ok_or_else(|| EngineError::Usage("wctl: missing op".to_string()))?;
    let class = it
        .next()
        .ok_or_else(|| EngineError::Usage("wctl: missing class".to_string()))?;
    let args = it.next().unwrap_or("");
    Ok(Command::Wctl {
        op: WctlOp::parse(op)?,
        class: Class::parse(class)
            .ok_or_else(|| EngineError::Usage(format!("unknown class {class:?}")))?,
        attrs: Attrs::parse(args)?,
    })
}

fn parse_link(rest: &str) -> Result<Command> {
    let mut it = rest.splitn(3, char::is_whitespace);
    let op = it
        .next()
        .ok_or_else(|| EngineError::Usage("link: missing op".to_string()))?;
    let label = it
        .next()
        .ok_or_else(|| EngineError::Usage("link: missing label".to_string()))?;
    let members_raw = it.next().unwrap_or("");
    let op = LinkOp::parse(op)?;
    let mut members = Vec::new();
    if op == LinkOp::Queue {
        for entry in members_raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (w, n) = entry.split_once('=').ok_or_else(|| {
                EngineError::Usage(format!("link member {entry:?} is missing '='"))
            })?;
            members.push(LinkMember {
                label: w.trim().to_string(),
                quantum: parse_size(n.trim())?,
            });
        }
    }
    Ok(Command::Link {
        op,
        label: label.to_string(),
        members,
    })
}

fn parse_info(rest: &str) -> Result<Command> {
    let attrs = Attrs::parse(rest)?;
    let class = match attrs.get("class") {
        Some(c) => Some(
            Class::parse(c).ok_or_else(|| EngineError::Usage(format!("unknown class {c:?}")))?,
        ),
        None => None,
    };
    let detail = matches!(attrs.get("detail"), Some("1"));
    Ok(Command::Info {
        class,
        worker: attrs.get("worker").map(str::to_string),
        detail,
    })
}

fn parse_wait(rest: &str) -> Result<Command> {
    let attrs = Attrs::parse(rest)?;
    let class = match attrs.get("class") {
        Some(c) => Some(
            Class::parse(c).ok_or_else(|| EngineError::Usage(format!("unknown class {c:?}")))?,
        ),
        None => None,
    };
    let time = match attrs.get("time") {
        Some(t) => Some(
            t.parse::<f64>()
                .map_err(|_| EngineError::Usage(format!("invalid wait time {t:?}")))?,
        ),
        None => None,
    };
    Ok(Command::Wait { class, time })
}

/// Parses a NET worker's `addr` attribute, defaulting to `0.0.0.0`.
pub fn parse_net_addr(attrs: &Attrs) -> Result<IpAddr> {
    match attrs.get("addr") {
        Some(raw) => raw
            .parse()
            .map_err(|_| EngineError::Usage(format!("invalid address {raw:?}"))),
        None => Ok(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
    }
}

/// One line of a trace file: `<time-seconds> <command>`, when `-T y`. The
/// input thread sleeps until `at` elapses (skipping sleeps under 15 ms)
/// before executing `command`.
#[derive(Debug, Clone)]
pub struct TraceLine {
    pub at: f64,
    pub command: String,
}

/// Parses one non-blank, non-comment trace-file line into a timed command,
/// or a bare command if `timestamped` is false.
pub fn parse_trace_line(line: &str, timestamped: bool) -> Result<TraceLine> {
    let line = line.trim();
    if !timestamped {
        return Ok(TraceLine {
            at: 0.0,
            command: line.to_string(),
        });
    }
    let (ts, cmd) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| EngineError::Usage(format!("trace line {line:?} is missing a timestamp")))?;
    let at: f64 = ts
        .parse()
        .map_err(|_| EngineError::Usage(format!("invalid trace timestamp {ts:?}")))?;
    Ok(TraceLine {
        at,
        command: cmd.trim().to_string(),
    })
}

/// Lines to skip entirely when reading a command stream: blank lines and
/// `#`-prefixed comments.
pub fn is_ignorable_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_suffixes_match_the_documented_table() {
        assert_eq!(parse_size("4k").unwrap(), 4_000);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("2m").unwrap(), 2_000_000);
        assert_eq!(parse_size("2M").unwrap(), 2 * (1 << 20));
        assert_eq!(parse_size("1g").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_size("512").unwrap(), 512);
    }

    #[test]
    fn wctl_add_parses_class_and_attrs() {
        let cmd = Command::parse("wctl add cpu load=50,label=c1").unwrap();
        match cmd {
            Command::Wctl { op, class, attrs } => {
                assert_eq!(op, WctlOp::Add);
                assert_eq!(class, Class::Cpu);
                assert_eq!(attrs.get("load"), Some("50"));
                assert_eq!(attrs.get("label"), Some("c1"));
            }
            _ => panic!("expected Wctl"),
        }
    }

    #[test]
    fn repeatable_after_accumulates() {
        let attrs = Attrs::parse("load=10,after=a,after=b").unwrap();
        assert_eq!(attrs.after, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn duplicate_non_after_key_is_rejected() {
        let err = Attrs::parse("load=10,load=20");
        assert!(err.is_err());
    }

    #[test]
    fn link_queue_parses_members_with_size_suffixes() {
        let cmd = Command::parse("link queue ring1 w1=4k,w2=1M").unwrap();
        match cmd {
            Command::Link { op, label, members } => {
                assert_eq!(op, LinkOp::Queue);
                assert_eq!(label, "ring1");
                assert_eq!(members.len(), 2);
                assert_eq!(members[0].quantum, 4000);
                assert_eq!(members[1].quantum, 1 << 20);
            }
            _ => panic!("expected Link"),
        }
    }

    #[test]
    fn trace_line_with_timestamp_splits_time_and_command() {
        let tl = parse_trace_line("1.5 wctl add cpu load=10", true).unwrap();
        assert_eq!(tl.at, 1.5);
        assert_eq!(tl.command, "wctl add cpu load=10");
    }

    #[test]
    fn comments_and_blank_lines_are_ignorable() {
        assert!(is_ignorable_line(""));
        assert!(is_ignorable_line("   "));
        assert!(is_ignorable_line("# a comment"));
        assert!(!is_ignorable_line("helo"));
    }

    #[test]
    fn unknown_command_is_a_usage_error() {
        assert!(Command::parse("frobnicate").is_err());
    }
}
