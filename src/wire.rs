//! # Wire Codec Module
//!
//! ASCII verb formatting and parsing for the fixture link.
//!
//! Every frame on the air is a human-readable, space-delimited, NUL-terminated
//! string. Reliable frames carry a trailing ` ID=<dec>` token; ACK frames are
//! `ACK <dec>` and are never themselves acknowledged. Hub-to-station frames
//! that carry state end with the sender's 17-character MAC token.
//!
//! Parsing is pull-style over borrowed string slices: no in-place mutation,
//! no allocation. Numeric parses reject anything that is not a pure decimal
//! integer, including MAC-shaped tokens.

use core::fmt::Write;

use crate::channel_model::ChannelClass;
use crate::{CHANNEL_COUNT, CSV_BUF_CAP, FRAMED_MAX_LEN, MAX_PAYLOAD_LEN};

/// 6-byte radio address of a node.
///
/// The wire form is the uppercase `HH:HH:HH:HH:HH:HH` rendering produced by
/// [`core::fmt::Display`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub const ZERO: Mac = Mac([0; 6]);
    pub const BROADCAST: Mac = Mac([0xFF; 6]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }

    /// Parses the 17-character `HH:HH:HH:HH:HH:HH` form, case-insensitive.
    pub fn parse(s: &str) -> Option<Mac> {
        let b = s.as_bytes();
        if b.len() != 17 {
            return None;
        }
        let mut out = [0u8; 6];
        for i in 0..6 {
            if i < 5 && b[i * 3 + 2] != b':' {
                return None;
            }
            let hi = hex_value(b[i * 3])?;
            let lo = hex_value(b[i * 3 + 1])?;
            out[i] = (hi << 4) | lo;
        }
        Some(Mac(out))
    }
}

impl core::fmt::Display for Mac {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Payload text of a single frame, before ` ID=` framing.
pub type Payload = heapless::String<MAX_PAYLOAD_LEN>;

/// Payload text including the ` ID=<dec>` suffix.
pub type FramedPayload = heapless::String<FRAMED_MAX_LEN>;

/// Returns `true` for a token shaped like a 17-character MAC address.
pub fn is_mac_token(tok: &str) -> bool {
    let b = tok.as_bytes();
    if b.len() != 17 {
        return false;
    }
    for (i, &c) in b.iter().enumerate() {
        if i % 3 == 2 {
            if c != b':' {
                return false;
            }
        } else if hex_value(c).is_none() {
            return false;
        }
    }
    true
}

/// Parses a pure decimal channel number `1..=40`, returning the 0-based index.
///
/// MAC-shaped tokens and anything with a non-digit byte are rejected.
pub fn parse_pure_channel(tok: &str) -> Option<usize> {
    if is_mac_token(tok) {
        return None;
    }
    let v = parse_count(tok)? as usize;
    if (1..=CHANNEL_COUNT).contains(&v) {
        Some(v - 1)
    } else {
        None
    }
}

/// Parses a pure decimal integer (digits only, non-empty).
pub fn parse_count(tok: &str) -> Option<u16> {
    if tok.is_empty() || !tok.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    tok.parse().ok()
}

/// Extracts the numeric suffix after the literal ` ID=` token.
///
/// Digits run to end-of-string or the first non-digit byte. Absence means
/// the frame is fire-and-forget.
pub fn extract_id(text: &str) -> Option<u32> {
    let pos = text.find(" ID=")?;
    let digits = &text[pos + 4..];
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    digits[..end].parse().ok()
}

/// Parses the leading decimal digits of a token, `strtoul`-style.
pub fn parse_leading_digits(tok: &str) -> Option<u32> {
    let end = tok
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(tok.len());
    if end == 0 {
        return None;
    }
    tok[..end].parse().ok()
}

/// Splits the first whitespace-delimited token from the rest of the text.
pub fn split_verb(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(|c: char| c.is_ascii_whitespace()) {
        Some(i) => (&text[..i], text[i..].trim_start()),
        None => (text, ""),
    }
}

/// Pull tokenizer over a borrowed slice.
///
/// The delimiter set is chosen per grammar: the MONITOR payload additionally
/// splits on the decoration characters of the `normal(2)=[1,2]` form.
pub(crate) struct Tokens<'a> {
    rest: &'a str,
    delims: &'static str,
}

const MONITOR_DELIMS: &str = " \t,[]()=";
const CSV_DELIMS: &str = " \t,";

impl<'a> Tokens<'a> {
    pub(crate) fn monitor(s: &'a str) -> Self {
        Tokens {
            rest: s,
            delims: MONITOR_DELIMS,
        }
    }

    pub(crate) fn csv(s: &'a str) -> Self {
        Tokens {
            rest: s,
            delims: CSV_DELIMS,
        }
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let delims = self.delims;
        let s = self.rest.trim_start_matches(|c| delims.contains(c));
        if s.is_empty() {
            self.rest = s;
            return None;
        }
        let end = s.find(|c| delims.contains(c)).unwrap_or(s.len());
        let (tok, rest) = s.split_at(end);
        self.rest = rest;
        Some(tok)
    }
}

/// Iterator over the `(channel, class)` assignments of a MONITOR payload.
///
/// Grammar: `( NORMAL | (CONTACTLESS|LATCH) count chan* )*`, case-insensitive.
/// The count token after a class keyword is skipped (the channel list that
/// follows is authoritative), and non-channel tokens such as a trailing MAC
/// are ignored. Channels named before any class keyword default to normal.
pub struct MonitorAssignments<'a> {
    tokens: Tokens<'a>,
    class: ChannelClass,
    skip_count: bool,
}

/// Yields assignments from the MONITOR argument text (verb already stripped).
pub fn monitor_assignments(args: &str) -> MonitorAssignments<'_> {
    MonitorAssignments {
        tokens: Tokens::monitor(args),
        class: ChannelClass::Normal,
        skip_count: false,
    }
}

impl<'a> Iterator for MonitorAssignments<'a> {
    type Item = (usize, ChannelClass);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let tok = self.tokens.next()?;
            if tok.eq_ignore_ascii_case("NORMAL") {
                self.class = ChannelClass::Normal;
                self.skip_count = true;
                continue;
            }
            if tok.eq_ignore_ascii_case("LATCH") || tok.eq_ignore_ascii_case("CONTACTLESS") {
                self.class = ChannelClass::Latch;
                self.skip_count = true;
                continue;
            }
            if self.skip_count {
                self.skip_count = false;
                continue;
            }
            if let Some(ch) = parse_pure_channel(tok) {
                return Some((ch, self.class));
            }
        }
    }
}

/// Parses a CHECK selection list (verb already stripped).
///
/// Returns the selection mask and whether any channel was named; an empty
/// selection means "evaluate all tracked, non-ignored channels". Non-channel
/// tokens (the trailing MAC in particular) are ignored.
pub fn parse_check_selection(args: &str) -> ([bool; CHANNEL_COUNT], bool) {
    let mut select = [false; CHANNEL_COUNT];
    let mut any = false;
    for tok in Tokens::csv(args) {
        if let Some(ch) = parse_pure_channel(tok) {
            select[ch] = true;
            any = true;
        }
    }
    (select, any)
}

/// Live-event kind carried in `EV` frames.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    /// Debounced pressed level changed.
    Pressed,
    /// Latch memory went high.
    Latched,
}

impl EventKind {
    fn letter(self) -> char {
        match self {
            EventKind::Pressed => 'P',
            EventKind::Latched => 'L',
        }
    }
}

pub fn ack_frame(id: u32) -> Payload {
    let mut out = Payload::new();
    let _ = write!(out, "ACK {}", id);
    out
}

/// `EV P|L <ch> <0|1> <MAC>` with the 1-based wire channel number.
pub fn event_frame(kind: EventKind, ch: usize, active: bool, mac: &Mac) -> Payload {
    let mut out = Payload::new();
    let _ = write!(
        out,
        "EV {} {} {} {}",
        kind.letter(),
        ch + 1,
        if active { 1 } else { 0 },
        mac
    );
    out
}

pub fn monitor_start_frame(mac: &Mac) -> Payload {
    let mut out = Payload::new();
    let _ = write!(out, "MONITOR-START {}", mac);
    out
}

pub fn auto_final_frame(mac: &Mac) -> Payload {
    let mut out = Payload::new();
    let _ = write!(out, "AUTO-FINAL {}", mac);
    out
}

pub fn result_success_frame(mac: &Mac) -> Payload {
    let mut out = Payload::new();
    let _ = write!(out, "RESULT SUCCESS {}", mac);
    out
}

/// `RESULT FAILURE [MISSING a,b][;EXTRA c] <MAC>`.
///
/// Either list may be absent. The core text is capped so the trailing MAC
/// always fits; overflow truncates the lists silently.
pub fn result_failure_frame(missing: &str, extra: &str, mac: &Mac) -> Payload {
    // Leave room for " <MAC>" inside the payload cap.
    let mut core_text: heapless::String<{ MAX_PAYLOAD_LEN - 20 }> = heapless::String::new();
    push_truncating(&mut core_text, "RESULT FAILURE");
    if !missing.is_empty() {
        push_truncating(&mut core_text, " MISSING ");
        push_truncating(&mut core_text, missing);
    }
    if !extra.is_empty() {
        push_truncating(&mut core_text, if missing.is_empty() { " EXTRA " } else { ";EXTRA " });
        push_truncating(&mut core_text, extra);
    }
    let mut out = Payload::new();
    let _ = write!(out, "{} {}", core_text, mac);
    out
}

/// Appends the ` ID=<dec>` suffix. Fails when the payload exceeds the cap.
pub fn frame_with_id(payload: &str, id: u32) -> Option<FramedPayload> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return None;
    }
    let mut out = FramedPayload::new();
    write!(out, "{} ID={}", payload, id).ok()?;
    Some(out)
}

fn push_truncating<const N: usize>(buf: &mut heapless::String<N>, s: &str) {
    for c in s.chars() {
        if buf.push(c).is_err() {
            return;
        }
    }
}

/// Bounded comma-separated channel list used for FAILURE reporting.
///
/// Entries are appended as `<n>,`; the trailing comma is trimmed before the
/// list is serialized. Overflow past the cap truncates silently.
pub struct CsvList {
    buf: heapless::String<CSV_BUF_CAP>,
}

impl CsvList {
    pub const fn new() -> Self {
        CsvList {
            buf: heapless::String::new(),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn push_channel(&mut self, one_based: usize) {
        if self.buf.len() >= CSV_BUF_CAP - 2 {
            return;
        }
        let mut item: heapless::String<8> = heapless::String::new();
        let _ = write!(item, "{},", one_based);
        push_truncating(&mut self.buf, item.as_str());
    }

    /// Removes the trailing comma left by [`push_channel`](Self::push_channel).
    pub fn trim(&mut self) {
        if self.buf.ends_with(',') {
            let _ = self.buf.pop();
        }
    }

    pub fn as_str(&self) -> &str {
        self.buf.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
