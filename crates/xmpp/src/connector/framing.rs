//! Incremental framing of the inbound XML stream.
//!
//! The [`Framer`] buffers raw bytes and cuts them into the stream header,
//! complete top-level elements and the closing `</stream:stream>`. Each
//! top-level element is parsed on its own inside a synthetic stream wrapper so
//! the `stream:` prefix and the default `jabber:client` namespace resolve the
//! same way they do on the wire.

use minidom::Element;
use quick_xml::Reader;
use quick_xml::errors::SyntaxError;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use crate::error::ConnectionError;
use crate::ns;

/// Largest amount of unparsed data held while waiting for an element to end.
pub const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

const STREAM_CLOSE: &[u8] = b"</stream:stream>";

/// Attributes of the server's `<stream:stream>` open tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub id: Option<String>,
    pub from: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    StreamOpen(StreamHeader),
    Element(Element),
    StreamClose,
}

enum RawFrame {
    Open(StreamHeader),
    Fragment(usize, usize),
    Close,
}

#[derive(Debug, Default)]
pub struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drop everything buffered; used on every stream restart.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, or `None` when more data is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        let leading = self
            .buffer
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.buffer.drain(..leading);
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match extract(&self.buffer)? {
            Some((raw, consumed)) => {
                let frame = match raw {
                    RawFrame::Open(header) => Frame::StreamOpen(header),
                    RawFrame::Close => Frame::StreamClose,
                    RawFrame::Fragment(start, end) => {
                        Frame::Element(parse_fragment(&self.buffer[start..end])?)
                    }
                };
                self.buffer.drain(..consumed);
                Ok(Some(frame))
            }
            None if self.buffer.len() > MAX_BUFFERED_BYTES => Err(ConnectionError::XmlError(
                format!("element exceeds {MAX_BUFFERED_BYTES} bytes"),
            )),
            None => Ok(None),
        }
    }
}

fn is_stream_tag(start: &BytesStart<'_>) -> bool {
    start.name().as_ref() == b"stream:stream" || start.local_name().as_ref() == b"stream"
}

fn header_from(start: &BytesStart<'_>) -> StreamHeader {
    let mut header = StreamHeader::default();
    for attr in start.attributes().flatten() {
        let value = match attr.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        };
        match attr.key.as_ref() {
            b"id" => header.id = Some(value),
            b"from" => header.from = Some(value),
            b"version" => header.version = Some(value),
            b"xml:lang" => header.lang = Some(value),
            _ => {}
        }
    }
    header
}

fn extract(buffer: &[u8]) -> Result<Option<(RawFrame, usize)>, ConnectionError> {
    if buffer.starts_with(STREAM_CLOSE) {
        return Ok(Some((RawFrame::Close, STREAM_CLOSE.len())));
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut start: Option<usize> = None;

    loop {
        let position = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_)) => {}
            Ok(Event::Start(e)) => {
                if start.is_none() && is_stream_tag(&e) {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((RawFrame::Open(header_from(&e)), end)));
                }
                if depth == 0 {
                    start = Some(position);
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                if start.is_none() && is_stream_tag(&e) {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((RawFrame::Open(header_from(&e)), end)));
                }
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((RawFrame::Fragment(position, end), end)));
                }
            }
            Ok(Event::Text(_) | Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 {
                    if e.local_name().as_ref() == b"stream" {
                        let end = reader.buffer_position() as usize;
                        return Ok(Some((RawFrame::Close, end)));
                    }
                    return Err(ConnectionError::XmlError(format!(
                        "unexpected closing tag </{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                depth -= 1;
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    let begin = start.unwrap_or(0);
                    return Ok(Some((RawFrame::Fragment(begin, end), end)));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            // partial tag at the end of the buffer
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag))
            | Err(quick_xml::Error::Syntax(SyntaxError::UnclosedPIOrXmlDecl))
            | Err(quick_xml::Error::Syntax(SyntaxError::UnclosedComment))
            | Err(quick_xml::Error::Syntax(SyntaxError::UnclosedCData)) => return Ok(None),
            Err(e) => return Err(ConnectionError::XmlError(e.to_string())),
        }
    }
}

fn parse_fragment(fragment: &[u8]) -> Result<Element, ConnectionError> {
    let fragment = std::str::from_utf8(fragment)
        .map_err(|e| ConnectionError::XmlError(format!("invalid UTF-8: {e}")))?;
    let wrapped = format!(
        "<stream:stream xmlns='{}' xmlns:stream='{}'>{}</stream:stream>",
        ns::JABBER_CLIENT,
        ns::STREAM,
        fragment
    );
    let root: Element = wrapped
        .parse()
        .map_err(|e: minidom::Error| ConnectionError::XmlError(e.to_string()))?;
    root.children()
        .next()
        .cloned()
        .ok_or_else(|| ConnectionError::XmlError("empty element".to_string()))
}

/// The client's stream open tag.
pub fn stream_header(to: &str, from: Option<&str>, lang: Option<&str>) -> String {
    let mut header = format!(
        "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' version='1.0' to='{}'",
        ns::JABBER_CLIENT,
        ns::STREAM,
        escape(to)
    );
    if let Some(from) = from {
        header.push_str(&format!(" from='{}'", escape(from)));
    }
    if let Some(lang) = lang {
        header.push_str(&format!(" xml:lang='{}'", escape(lang)));
    }
    header.push('>');
    header
}
