//! Incremental parser for the INDI command stream
//!
//! The server sends a sequence of top-level XML elements with no enclosing
//! document. Reads can split an element at any byte, so the parser is a push
//! state machine fed one byte at a time. It only tracks element framing
//! (tags, quoted attribute values, comments, CDATA); once the root element
//! closes, its bytes are turned into an [`XmlElement`] tree by quick-xml.
//!
//! Errors are recoverable: each one is reported once, the partial element is
//! discarded, and input is skipped quietly until the next start tag. An
//! element over the size limit is framed to its end without being buffered.

use thiserror::Error;
use tracing::trace;

use crate::xml::XmlElement;

/// Default upper bound on the size of one top-level element
pub const DEFAULT_MAX_ELEMENT_LEN: usize = 64 * 1024 * 1024;

/// Bytes kept while skipping an oversized element, enough to match `<![CDATA[`
const DISCARD_TAIL_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected character {0:?} between elements")]
    UnexpectedCharacter(char),
    #[error("invalid character {0:?} in tag")]
    InvalidTag(char),
    #[error("closing tag </{found}> does not match <{expected}>")]
    MismatchedTag { expected: String, found: String },
    #[error("element exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("malformed element: {0}")]
    Markup(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Between top-level elements
    Idle,
    /// Just after `<`
    TagOpen,
    /// Reading the name of a start tag
    OpenName,
    /// Inside a start tag, after its name
    InTag,
    /// Inside a quoted attribute value
    AttrValue(u8),
    /// After `/` in a start tag
    EmptyClose,
    /// Character data inside an element
    Content,
    /// Reading the name of an end tag
    CloseName,
    /// After `<!`, not yet known to be a comment or CDATA
    Bang,
    Comment,
    CData,
    /// Inside `<? ... ?>`
    Instruction,
    /// Skipping input after an error until the next `<`
    Resync,
    /// Just after `<` while resyncing; only a start tag ends the skip
    ResyncTag,
}

enum Step {
    Continue,
    Complete,
    Discard,
}

/// Push parser reconstructing top-level elements across reads
#[derive(Debug)]
pub struct StreamParser {
    state: State,
    /// Raw bytes of the element being accumulated
    buf: Vec<u8>,
    /// Name of the tag currently being read
    name: Vec<u8>,
    /// Names of the open elements, innermost last
    open: Vec<Vec<u8>>,
    max_element_len: usize,
    /// The current element went over the limit and will be dropped
    discarding: bool,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self::with_max_element_len(DEFAULT_MAX_ELEMENT_LEN)
    }

    pub fn with_max_element_len(max_element_len: usize) -> Self {
        Self {
            state: State::Idle,
            buf: Vec::new(),
            name: Vec::new(),
            open: Vec::new(),
            max_element_len,
            discarding: false,
        }
    }

    /// True when no partial element is buffered
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle | State::Resync | State::ResyncTag)
    }

    /// Number of bytes buffered for the element in progress
    pub fn pending_len(&self) -> usize {
        if self.is_idle() {
            0
        } else {
            self.buf.len()
        }
    }

    /// Drop any partial element
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.buf.clear();
        self.name.clear();
        self.open.clear();
        self.discarding = false;
    }

    /// Feed a slice, collecting every element or error it completes
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<XmlElement, ParseError>> {
        bytes.iter().filter_map(|&b| self.feed_byte(b)).collect()
    }

    /// Feed one byte. Returns `Some` when the byte completes an element or
    /// makes the markup invalid.
    pub fn feed_byte(&mut self, byte: u8) -> Option<Result<XmlElement, ParseError>> {
        match self.state {
            State::Idle => {
                if byte.is_ascii_whitespace() {
                    return None;
                }
                if byte != b'<' {
                    self.state = State::Resync;
                    return Some(Err(ParseError::UnexpectedCharacter(byte as char)));
                }
                self.buf.clear();
            }
            State::Resync => {
                if byte == b'<' {
                    self.state = State::ResyncTag;
                }
                return None;
            }
            State::ResyncTag => {
                if byte == b'<' {
                    return None;
                }
                if !is_name_start(byte) {
                    self.state = State::Resync;
                    return None;
                }
                self.buf.clear();
                self.buf.push(b'<');
                self.state = State::TagOpen;
            }
            _ => {}
        }

        let mut overflow = None;
        if !self.discarding && self.buf.len() >= self.max_element_len {
            trace!(limit = self.max_element_len, "Element too large, skipping to its end");
            self.discarding = true;
            overflow = Some(ParseError::TooLarge {
                limit: self.max_element_len,
            });
        }
        if self.discarding && self.buf.len() >= DISCARD_TAIL_LEN {
            self.buf.drain(..self.buf.len() + 1 - DISCARD_TAIL_LEN);
        }
        self.buf.push(byte);

        let discarding = self.discarding;
        let outcome = match self.step(byte) {
            Ok(Step::Continue) => None,
            Ok(Step::Discard) => {
                self.reset();
                None
            }
            Ok(Step::Complete) => {
                let bytes = std::mem::take(&mut self.buf);
                self.reset();
                if discarding {
                    None
                } else {
                    trace!(len = bytes.len(), "Element complete");
                    Some(XmlElement::from_bytes(&bytes))
                }
            }
            Err(e) => {
                self.reset();
                if byte == b'<' {
                    // a truncated element followed by a new one
                    self.buf.push(b'<');
                    self.state = State::TagOpen;
                } else {
                    self.state = State::Resync;
                }
                (!discarding).then_some(Err(e))
            }
        };
        overflow.map(Err).or(outcome)
    }

    fn step(&mut self, byte: u8) -> Result<Step, ParseError> {
        match self.state {
            State::Idle => self.state = State::TagOpen,
            State::Resync | State::ResyncTag => {}
            State::TagOpen => match byte {
                b'/' if !self.open.is_empty() => {
                    self.name.clear();
                    self.state = State::CloseName;
                }
                b'?' => self.state = State::Instruction,
                b'!' => self.state = State::Bang,
                b if is_name_start(b) => {
                    self.name.clear();
                    self.name.push(b);
                    self.state = State::OpenName;
                }
                _ => return Err(ParseError::InvalidTag(byte as char)),
            },
            State::OpenName => match byte {
                b'>' => return Ok(self.open_element()),
                b'/' => self.state = State::EmptyClose,
                b if b.is_ascii_whitespace() => self.state = State::InTag,
                b if is_name_char(b) => self.name.push(b),
                _ => return Err(ParseError::InvalidTag(byte as char)),
            },
            State::InTag => match byte {
                b'>' => return Ok(self.open_element()),
                b'/' => self.state = State::EmptyClose,
                b'"' | b'\'' => self.state = State::AttrValue(byte),
                b'<' => return Err(ParseError::InvalidTag('<')),
                _ => {}
            },
            State::AttrValue(quote) => match byte {
                b'<' => return Err(ParseError::InvalidTag('<')),
                b if b == quote => self.state = State::InTag,
                _ => {}
            },
            State::EmptyClose => {
                if byte != b'>' {
                    return Err(ParseError::InvalidTag(byte as char));
                }
                return Ok(self.after_close());
            }
            State::Content => {
                if byte == b'<' {
                    self.state = State::TagOpen;
                }
            }
            State::CloseName => {
                if byte != b'>' {
                    self.name.push(byte);
                    return Ok(Step::Continue);
                }
                let found = self.name.trim_ascii();
                let expected = self.open.pop().unwrap_or_default();
                if found != expected.as_slice() {
                    return Err(ParseError::MismatchedTag {
                        expected: String::from_utf8_lossy(&expected).into_owned(),
                        found: String::from_utf8_lossy(found).into_owned(),
                    });
                }
                return Ok(self.after_close());
            }
            State::Bang => {
                if self.buf.ends_with(b"<!--") {
                    self.state = State::Comment;
                } else if self.buf.ends_with(b"<![CDATA[") {
                    self.state = State::CData;
                } else if byte == b'>' {
                    return Ok(self.after_markup());
                }
            }
            State::Comment => {
                if byte == b'>' && self.buf.ends_with(b"-->") {
                    return Ok(self.after_markup());
                }
            }
            State::CData => {
                if byte == b'>' && self.buf.ends_with(b"]]>") {
                    self.state = State::Content;
                }
            }
            State::Instruction => {
                if byte == b'>' && self.buf.ends_with(b"?>") {
                    return Ok(self.after_markup());
                }
            }
        }
        Ok(Step::Continue)
    }

    fn open_element(&mut self) -> Step {
        self.open.push(std::mem::take(&mut self.name));
        self.state = State::Content;
        Step::Continue
    }

    /// An element was closed, either `/>` or a matching end tag
    fn after_close(&mut self) -> Step {
        if self.open.is_empty() {
            Step::Complete
        } else {
            self.state = State::Content;
            Step::Continue
        }
    }

    /// A comment, declaration or processing instruction ended
    fn after_markup(&mut self) -> Step {
        if self.open.is_empty() {
            Step::Discard
        } else {
            self.state = State::Content;
            Step::Continue
        }
    }
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':' || b >= 0x80
}

fn is_name_char(b: u8) -> bool {
    is_name_start(b) || b.is_ascii_digit() || b == b'-' || b == b'.'
}
