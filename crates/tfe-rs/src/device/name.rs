//! Device name grammar: `/job:J/replica:R/task:T/device:TYPE:ID`.
//!
//! Every component is optional and may be the wildcard `*`. The legacy forms `/cpu:N` and
//! `/gpu:N` are accepted and normalized to upper-case device types, and the short local form
//! `TYPE:ID` is accepted wherever a name is completed against a fully-specified base name.

use std::fmt;

use crate::status::{Status, StatusResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ParsedName {
    pub job: Option<String>,
    pub replica: Option<u32>,
    pub task: Option<u32>,
    pub device_type: Option<String>,
    pub id: Option<u32>,
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic()
}

fn is_word(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn consume_prefix(&mut self, prefix: &str) -> bool {
        match self.rest.strip_prefix(prefix) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    /// Identifier starting with a letter and continuing with `[A-Za-z0-9_]` up to `stop`.
    fn consume_word(&mut self, stop: &[u8]) -> Option<&'a str> {
        let bytes = self.rest.as_bytes();
        if bytes.is_empty() || !is_alpha(bytes[0]) {
            return None;
        }
        let mut end = 1;
        while end < bytes.len() {
            let c = bytes[end];
            if stop.contains(&c) {
                break;
            }
            if !is_word(c) {
                return None;
            }
            end += 1;
        }
        let (word, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(word)
    }

    fn consume_number(&mut self) -> Option<u32> {
        let end = self
            .rest
            .bytes()
            .position(|c| !c.is_ascii_digit())
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let (digits, rest) = self.rest.split_at(end);
        let value = digits.parse().ok()?;
        self.rest = rest;
        Some(value)
    }

    /// `*` yields `Some(None)`; a value yields `Some(Some(v))`; garbage yields `None`.
    fn consume_wild<T>(&mut self, parse: impl FnOnce(&mut Self) -> Option<T>) -> Option<Option<T>> {
        if self.consume_prefix("*") {
            return Some(None);
        }
        parse(self).map(Some)
    }
}

impl ParsedName {
    /// Parses a (possibly partial) full device name. Returns `None` on malformed input.
    pub fn parse_full(name: &str) -> Option<ParsedName> {
        let mut parsed = ParsedName::default();
        if name == "/" {
            return Some(parsed);
        }
        let mut cursor = Cursor { rest: name };
        while !cursor.rest.is_empty() {
            let mut progress = false;
            if cursor.consume_prefix("/job:") {
                parsed.job = cursor.consume_wild(|c| c.consume_word(b"/").map(str::to_string))?;
                progress = true;
            }
            if cursor.consume_prefix("/replica:") {
                parsed.replica = cursor.consume_wild(Cursor::consume_number)?;
                progress = true;
            }
            if cursor.consume_prefix("/task:") {
                parsed.task = cursor.consume_wild(Cursor::consume_number)?;
                progress = true;
            }
            if cursor.consume_prefix("/device:") {
                parsed.device_type =
                    cursor.consume_wild(|c| c.consume_word(b"/:").map(str::to_string))?;
                parsed.id = if cursor.consume_prefix(":") {
                    cursor.consume_wild(Cursor::consume_number)?
                } else {
                    None
                };
                progress = true;
            }
            for (legacy, device_type) in [("/cpu:", "CPU"), ("/CPU:", "CPU"), ("/gpu:", "GPU"), ("/GPU:", "GPU")] {
                if cursor.consume_prefix(legacy) {
                    parsed.device_type = Some(device_type.to_string());
                    parsed.id = cursor.consume_wild(Cursor::consume_number)?;
                    progress = true;
                }
            }
            if !progress {
                return None;
            }
        }
        Some(parsed)
    }

    /// Parses the short local form `TYPE:ID`.
    pub fn parse_local(name: &str) -> Option<ParsedName> {
        let mut cursor = Cursor { rest: name };
        let device_type = cursor.consume_word(b":")?.to_string();
        if !cursor.consume_prefix(":") {
            return None;
        }
        let id = cursor.consume_number()?;
        if !cursor.rest.is_empty() {
            return None;
        }
        let device_type = match device_type.as_str() {
            "cpu" => "CPU".to_string(),
            "gpu" => "GPU".to_string(),
            _ => device_type,
        };
        Some(ParsedName {
            device_type: Some(device_type),
            id: Some(id),
            ..ParsedName::default()
        })
    }

    /// Parses either form, reporting malformed names as InvalidArgument.
    pub fn parse(name: &str) -> StatusResult<ParsedName> {
        Self::parse_full(name)
            .or_else(|| Self::parse_local(name))
            .ok_or_else(|| {
                Status::invalid_argument(format!(
                    "Could not parse {name} into a device specification."
                ))
            })
    }

    pub fn full(job: &str, replica: u32, task: u32, device_type: &str, id: u32) -> ParsedName {
        ParsedName {
            job: Some(job.to_string()),
            replica: Some(replica),
            task: Some(task),
            device_type: Some(device_type.to_string()),
            id: Some(id),
        }
    }

    pub fn is_fully_specified(&self) -> bool {
        self.job.is_some()
            && self.replica.is_some()
            && self.task.is_some()
            && self.device_type.is_some()
            && self.id.is_some()
    }

    /// Fills every unspecified component from `base`.
    pub fn complete_from(&mut self, base: &ParsedName) {
        if self.job.is_none() {
            self.job = base.job.clone();
        }
        if self.replica.is_none() {
            self.replica = base.replica;
        }
        if self.task.is_none() {
            self.task = base.task;
        }
        if self.device_type.is_none() {
            self.device_type = base.device_type.clone();
        }
        if self.id.is_none() {
            self.id = base.id;
        }
    }

    /// True when every component this name specifies agrees with `other`.
    pub fn matches(&self, other: &ParsedName) -> bool {
        fn agree<T: PartialEq>(pattern: &Option<T>, value: &Option<T>) -> bool {
            match pattern {
                None => true,
                Some(expected) => value.as_ref() == Some(expected),
            }
        }
        agree(&self.job, &other.job)
            && agree(&self.replica, &other.replica)
            && agree(&self.task, &other.task)
            && agree(&self.device_type, &other.device_type)
            && agree(&self.id, &other.id)
    }

    /// True when both names address the same job, replica and task.
    pub fn same_address_space(&self, other: &ParsedName) -> bool {
        self.job == other.job && self.replica == other.replica && self.task == other.task
    }
}

impl fmt::Display for ParsedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(job) = &self.job {
            write!(f, "/job:{job}")?;
        }
        if let Some(replica) = self.replica {
            write!(f, "/replica:{replica}")?;
        }
        if let Some(task) = self.task {
            write!(f, "/task:{task}")?;
        }
        if let Some(device_type) = &self.device_type {
            write!(f, "/device:{device_type}:")?;
            match self.id {
                Some(id) => write!(f, "{id}")?,
                None => f.write_str("*")?,
            }
        }
        Ok(())
    }
}

pub fn full_name(job: &str, replica: u32, task: u32, device_type: &str, id: u32) -> String {
    ParsedName::full(job, replica, task, device_type, id).to_string()
}

/// Completes `name` against the fully specified `basename` and prints it canonically.
pub fn canonicalize(name: &str, basename: &str) -> StatusResult<String> {
    let base = ParsedName::parse_full(basename).ok_or_else(|| {
        Status::invalid_argument(format!(
            "Could not parse basename: {basename} into a device specification."
        ))
    })?;
    if !base.is_fully_specified() {
        return Err(Status::invalid_argument(format!(
            "Basename: {basename} should be fully specified."
        )));
    }
    let mut parsed = ParsedName::parse(name)?;
    parsed.complete_from(&base);
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_and_legacy_forms() {
        let parsed = ParsedName::parse_full("/job:worker/replica:0/task:3/device:XLA_CPU:1")
            .expect("full name");
        assert_eq!(parsed, ParsedName::full("worker", 0, 3, "XLA_CPU", 1));

        let legacy = ParsedName::parse_full("/job:localhost/cpu:2").expect("legacy name");
        assert_eq!(legacy.device_type.as_deref(), Some("CPU"));
        assert_eq!(legacy.id, Some(2));
        assert_eq!(legacy.task, None);
    }

    #[test]
    fn wildcards_leave_components_unset() {
        let parsed = ParsedName::parse_full("/job:*/replica:*/task:1/device:GPU:*")
            .expect("wildcards");
        assert_eq!(parsed.job, None);
        assert_eq!(parsed.task, Some(1));
        assert_eq!(parsed.id, None);
        assert_eq!(parsed.to_string(), "/task:1/device:GPU:*");
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(ParsedName::parse_full("/job:1abc").is_none());
        assert!(ParsedName::parse_full("/task:x").is_none());
        assert!(ParsedName::parse_full("device:CPU:0").is_none());
        assert!(ParsedName::parse("nonsense").is_err());
    }

    #[test]
    fn canonicalizes_local_names_against_basename() {
        let base = "/job:localhost/replica:0/task:0/device:CPU:0";
        assert_eq!(
            canonicalize("GPU:1", base).expect("local"),
            "/job:localhost/replica:0/task:0/device:GPU:1"
        );
        assert_eq!(
            canonicalize("/task:2/device:CPU:0", base).expect("partial"),
            "/job:localhost/replica:0/task:2/device:CPU:0"
        );
        assert!(canonicalize("CPU:0", "/job:localhost").is_err());
    }

    #[test]
    fn partial_names_match_complete_ones() {
        let complete = ParsedName::full("worker", 0, 1, "CPU", 0);
        let pattern = ParsedName::parse("/job:worker/task:1").expect("pattern");
        assert!(pattern.matches(&complete));
        let other = ParsedName::parse("/task:0").expect("pattern");
        assert!(!other.matches(&complete));
    }
}
