//! # Incremental Ads Envelope Decoder
//!
//! Channels answer with one large JSON object:
//!
//! ```json
//! { "err_msg": "success", "ads": [ { ... }, { ... } ] }
//! ```
//!
//! The decoder consumes that object chunk by chunk without buffering the whole
//! body. Only one element of `ads` is held in memory at a time, and each
//! element is decoded on its own so a malformed offer does not poison the
//! rest of the response. Keys other than `err_msg` and `ads` are skipped.

use std::ops::ControlFlow;

use thiserror::Error;

use crate::inventory::RawOffer;

/// Largest single value (one offer, or one skipped field) the decoder buffers.
pub const MAX_ELEMENT_BYTES: usize = 4 * 1024 * 1024;

const ADS_KEY: &str = "ads";
const STATUS_KEY: &str = "err_msg";

/// Something the decoder found in the stream.
#[derive(Debug)]
pub enum AdsEvent {
    /// The value of `err_msg`.
    Status(String),
    /// One element of `ads` that decoded into an offer.
    Record(Box<RawOffer>),
    /// One element of `ads` that was well-formed JSON structurally but did not
    /// decode into an offer.
    Malformed(serde_json::Error),
}

/// Structural corruption of the envelope. Unlike a malformed element, these
/// end the stream.
#[derive(Debug, Error)]
pub enum AdsStreamError {
    #[error("unexpected byte {found:?} at offset {offset}, expected {expected}")]
    Unexpected {
        found: char,
        offset: u64,
        expected: &'static str,
    },

    #[error("invalid object key ending at offset {offset}")]
    InvalidKey { offset: u64 },

    #[error("value at offset {offset} exceeds {limit} bytes")]
    Oversized { offset: u64, limit: usize },

    #[error("stream ended before the envelope was closed")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    KeyOrEnd,
    Key,
    KeyString,
    Colon,
    ValueStart,
    Value,
    AfterValue,
    ElementOrEnd,
    Element,
    InElement,
    AfterElement,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Container,
    String,
    Scalar,
}

/// Outcome of pushing one byte into a [`ValueScan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// The value continues.
    Pending,
    /// The byte closed the value.
    Closed,
    /// The value ended just before this byte, which belongs to the envelope.
    EndedBefore,
}

/// Tracks where one JSON value ends, without interpreting it.
#[derive(Debug, Default)]
struct ValueScan {
    kind: Option<ValueKind>,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

impl ValueScan {
    fn push(&mut self, byte: u8) -> Scan {
        let Some(kind) = self.kind else {
            self.kind = Some(match byte {
                b'{' | b'[' => {
                    self.depth = 1;
                    ValueKind::Container
                }
                b'"' => {
                    self.in_string = true;
                    ValueKind::String
                }
                _ => ValueKind::Scalar,
            });
            return Scan::Pending;
        };

        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
                if kind == ValueKind::String {
                    return Scan::Closed;
                }
            }
            return Scan::Pending;
        }

        match kind {
            ValueKind::Scalar if is_delimiter(byte) => Scan::EndedBefore,
            ValueKind::Scalar => Scan::Pending,
            // A string is closed by its quote above; nothing follows it.
            ValueKind::String => Scan::EndedBefore,
            ValueKind::Container => match byte {
                b'"' => {
                    self.in_string = true;
                    Scan::Pending
                }
                b'{' | b'[' => {
                    self.depth += 1;
                    Scan::Pending
                }
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        Scan::Closed
                    } else {
                        Scan::Pending
                    }
                }
                _ => Scan::Pending,
            },
        }
    }
}

fn is_delimiter(byte: u8) -> bool {
    byte.is_ascii_whitespace() || matches!(byte, b',' | b'}' | b']')
}

fn is_structural(byte: u8) -> bool {
    matches!(byte, b',' | b':' | b'}' | b']')
}

/// What the main loop does with the current byte after one step.
enum Step {
    Consumed,
    Reprocess,
    Stop,
}

/// Push-style decoder for the `{ "err_msg": ..., "ads": [...] }` envelope.
#[derive(Debug)]
pub struct AdsStreamDecoder {
    phase: Phase,
    scan: ValueScan,
    buf: Vec<u8>,
    key: String,
    capture: bool,
    offset: u64,
}

impl Default for AdsStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AdsStreamDecoder {
    pub fn new() -> Self {
        Self {
            phase: Phase::Start,
            scan: ValueScan::default(),
            buf: Vec::new(),
            key: String::new(),
            capture: false,
            offset: 0,
        }
    }

    /// True once the closing brace of the envelope has been read.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Feeds the next chunk of the body, calling `on_event` for everything
    /// found in it. When `on_event` breaks, decoding stops immediately and the
    /// rest of the chunk is left unread.
    ///
    /// # Errors
    ///
    /// Returns an error when the envelope itself is corrupt.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_event: F) -> Result<ControlFlow<()>, AdsStreamError>
    where
        F: FnMut(AdsEvent) -> ControlFlow<()>,
    {
        let mut i = 0;
        while i < chunk.len() {
            match self.step(chunk[i], &mut on_event)? {
                Step::Consumed => {
                    i += 1;
                    self.offset += 1;
                }
                Step::Reprocess => {}
                Step::Stop => {
                    self.offset += 1;
                    return Ok(ControlFlow::Break(()));
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Checks that the stream ended on a complete envelope.
    ///
    /// # Errors
    ///
    /// Returns `AdsStreamError::Truncated` otherwise.
    pub fn finish(&self) -> Result<(), AdsStreamError> {
        if self.is_done() {
            Ok(())
        } else {
            Err(AdsStreamError::Truncated)
        }
    }

    fn unexpected(&self, byte: u8, expected: &'static str) -> AdsStreamError {
        AdsStreamError::Unexpected {
            found: char::from(byte),
            offset: self.offset,
            expected,
        }
    }

    fn push_buf(&mut self, byte: u8) -> Result<(), AdsStreamError> {
        if self.buf.len() >= MAX_ELEMENT_BYTES {
            return Err(AdsStreamError::Oversized {
                offset: self.offset,
                limit: MAX_ELEMENT_BYTES,
            });
        }
        self.buf.push(byte);
        Ok(())
    }

    fn begin_value(&mut self, byte: u8, capture: bool) -> Result<(), AdsStreamError> {
        self.buf.clear();
        self.scan = ValueScan::default();
        self.capture = capture;
        self.scan.push(byte);
        if capture {
            self.push_buf(byte)?;
        }
        Ok(())
    }

    fn step<F>(&mut self, byte: u8, on_event: &mut F) -> Result<Step, AdsStreamError>
    where
        F: FnMut(AdsEvent) -> ControlFlow<()>,
    {
        let ws = byte.is_ascii_whitespace();
        match self.phase {
            Phase::Start => match byte {
                _ if ws => {}
                b'{' => self.phase = Phase::KeyOrEnd,
                _ => return Err(self.unexpected(byte, "'{'")),
            },

            Phase::KeyOrEnd | Phase::Key => match byte {
                _ if ws => {}
                b'"' => {
                    self.begin_value(byte, true)?;
                    self.phase = Phase::KeyString;
                }
                b'}' if self.phase == Phase::KeyOrEnd => self.phase = Phase::Done,
                _ => return Err(self.unexpected(byte, "object key")),
            },

            Phase::KeyString => {
                self.push_buf(byte)?;
                if self.scan.push(byte) == Scan::Closed {
                    self.key = serde_json::from_slice(&self.buf)
                        .map_err(|_| AdsStreamError::InvalidKey { offset: self.offset })?;
                    self.phase = Phase::Colon;
                }
            }

            Phase::Colon => match byte {
                _ if ws => {}
                b':' => self.phase = Phase::ValueStart,
                _ => return Err(self.unexpected(byte, "':'")),
            },

            Phase::ValueStart => match byte {
                _ if ws => {}
                b'[' if self.key == ADS_KEY => self.phase = Phase::ElementOrEnd,
                _ if is_structural(byte) => return Err(self.unexpected(byte, "value")),
                _ => {
                    let capture = self.key == STATUS_KEY;
                    self.begin_value(byte, capture)?;
                    self.phase = Phase::Value;
                }
            },

            Phase::Value => match self.scan.push(byte) {
                Scan::Pending => {
                    if self.capture {
                        self.push_buf(byte)?;
                    }
                }
                Scan::Closed => {
                    if self.capture {
                        self.push_buf(byte)?;
                    }
                    self.phase = Phase::AfterValue;
                    if self.emit_status(on_event).is_break() {
                        return Ok(Step::Stop);
                    }
                }
                Scan::EndedBefore => {
                    self.phase = Phase::AfterValue;
                    if self.emit_status(on_event).is_break() {
                        return Ok(Step::Stop);
                    }
                    return Ok(Step::Reprocess);
                }
            },

            Phase::AfterValue => match byte {
                _ if ws => {}
                b',' => self.phase = Phase::Key,
                b'}' => self.phase = Phase::Done,
                _ => return Err(self.unexpected(byte, "',' or '}'")),
            },

            Phase::ElementOrEnd | Phase::Element => match byte {
                _ if ws => {}
                b']' if self.phase == Phase::ElementOrEnd => self.phase = Phase::AfterValue,
                _ if is_structural(byte) => return Err(self.unexpected(byte, "array element")),
                _ => {
                    self.begin_value(byte, true)?;
                    self.phase = Phase::InElement;
                }
            },

            Phase::InElement => match self.scan.push(byte) {
                Scan::Pending => self.push_buf(byte)?,
                Scan::Closed => {
                    self.push_buf(byte)?;
                    self.phase = Phase::AfterElement;
                    if on_event(self.decode_element()).is_break() {
                        return Ok(Step::Stop);
                    }
                }
                Scan::EndedBefore => {
                    self.phase = Phase::AfterElement;
                    if on_event(self.decode_element()).is_break() {
                        return Ok(Step::Stop);
                    }
                    return Ok(Step::Reprocess);
                }
            },

            Phase::AfterElement => match byte {
                _ if ws => {}
                b',' => self.phase = Phase::Element,
                b']' => self.phase = Phase::AfterValue,
                _ => return Err(self.unexpected(byte, "',' or ']'")),
            },

            Phase::Done => {
                if !ws {
                    return Err(self.unexpected(byte, "end of stream"));
                }
            }
        }
        Ok(Step::Consumed)
    }

    fn emit_status<F>(&mut self, on_event: &mut F) -> ControlFlow<()>
    where
        F: FnMut(AdsEvent) -> ControlFlow<()>,
    {
        if !self.capture {
            return ControlFlow::Continue(());
        }
        let status = match serde_json::from_slice::<serde_json::Value>(&self.buf) {
            Ok(serde_json::Value::String(s)) => s,
            Ok(other) => other.to_string(),
            Err(_) => String::from_utf8_lossy(&self.buf).into_owned(),
        };
        self.buf.clear();
        on_event(AdsEvent::Status(status))
    }

    fn decode_element(&mut self) -> AdsEvent {
        let event = match serde_json::from_slice::<RawOffer>(&self.buf) {
            Ok(raw) => AdsEvent::Record(Box::new(raw)),
            Err(e) => AdsEvent::Malformed(e),
        };
        self.buf.clear();
        event
    }
}
