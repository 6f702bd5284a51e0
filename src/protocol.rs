//! Wire format of the testbed control protocol.
//!
//! One request per line on the backend's stdin, one reply per line on its
//! stdout. Every word is percent-encoded so paths and argv elements survive
//! the space-separated framing.
//!
//! ```text
//! > open
//! < ok /tmp/reprocheck.Xb3k
//! > capabilities
//! < ok revert root-on-testbed downtmp-host=/tmp/reprocheck.Xb3k
//! > revert
//! < error `revert'%20when%20`revert'%20not%20advertised
//! ```
use crate::error::{TestbedError, TestbedResult};
use std::fmt::Write as _;

/// Status word that starts every reply line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    BadPkg,
    Error,
}

impl ReplyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::BadPkg => "bad-pkg",
            ReplyStatus::Error => "error",
        }
    }
}

/// A parsed reply line with its fields already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub fields: Vec<String>,
}

impl Reply {
    pub fn ok(fields: Vec<String>) -> Self {
        Reply {
            status: ReplyStatus::Ok,
            fields,
        }
    }

    /// Render the reply as a protocol line without the trailing newline.
    pub fn encode(&self) -> String {
        let mut line = self.status.as_str().to_string();
        for field in &self.fields {
            line.push(' ');
            line.push_str(&quote(field));
        }
        line
    }

    /// Turn a non-`ok` reply into the matching error.
    pub fn into_result(self) -> TestbedResult<Vec<String>> {
        match self.status {
            ReplyStatus::Ok => Ok(self.fields),
            ReplyStatus::BadPkg => Err(TestbedError::BadRequest(self.fields.join(" "))),
            ReplyStatus::Error => Err(TestbedError::Backend(self.fields.join(" "))),
        }
    }
}

/// Parse one reply line as sent by a backend.
pub fn parse_reply(line: &str) -> TestbedResult<Reply> {
    let mut words = line.split_whitespace();
    let Some(keyword) = words.next() else {
        return Err(TestbedError::Protocol(
            "unexpected whitespace-only line from the testbed".to_string(),
        ));
    };
    let status = match keyword {
        "ok" => ReplyStatus::Ok,
        "bad-pkg" => ReplyStatus::BadPkg,
        "error" => ReplyStatus::Error,
        other => {
            return Err(TestbedError::Protocol(format!(
                "got `{line}', expected ok/bad-pkg/error (keyword `{other}')"
            )))
        }
    };
    let fields = words.map(unquote).collect::<TestbedResult<Vec<_>>>()?;
    Ok(Reply { status, fields })
}

/// Encode a request: command word followed by quoted arguments.
pub fn encode_request(command: &str, args: &[&str]) -> String {
    let mut line = command.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&quote(arg));
    }
    line
}

/// Split a request line into its command and decoded arguments.
pub fn parse_request(line: &str) -> TestbedResult<(String, Vec<String>)> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Err(TestbedError::BadRequest(
            "empty commands are not permitted".to_string(),
        ));
    };
    let args = words.map(unquote).collect::<TestbedResult<Vec<_>>>()?;
    Ok((unquote(command)?, args))
}

/// Join an argv into one protocol word: each element quoted, comma separated.
pub fn encode_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| quote(arg))
        .collect::<Vec<_>>()
        .join(",")
}

/// Inverse of [`encode_argv`]. An empty word is an empty argv.
pub fn decode_argv(word: &str) -> TestbedResult<Vec<String>> {
    if word.is_empty() {
        return Ok(Vec::new());
    }
    word.split(',').map(unquote).collect()
}

/// Percent-encode everything outside the RFC 3986 unreserved set and `/`.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~' | b'/') {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

pub fn unquote(text: &str) -> TestbedResult<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = bytes
                .get(idx + 1..idx + 3)
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| {
                    TestbedError::Protocol(format!("bad percent escape in `{text}'"))
                })?;
            out.push(hex);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| TestbedError::Protocol(format!("non UTF-8 word `{text}'")))
}
