//! PAM (portable arbitrary map) stream decoder.
//!
//! The transcoder writes an endless sequence of
//!
//! ```text
//! P7\nWIDTH 640\nHEIGHT 360\nDEPTH 4\nMAXVAL 255\nTUPLTYPE RGB_ALPHA\nENDHDR\n<raw RGBA>
//! ```
//!
//! records to stdout. `PamDecoder` turns that byte stream into `Frame`s. A bad
//! record yields one `Err` item and decoding resumes at the next `P7` header,
//! so one corrupt frame never stops the stream.

use anyhow::{anyhow, Context, Result};
use std::io::Read;

use crate::frame::{rgba_len, Frame, FRAME_CHANNELS};

const MAGIC: &[u8] = b"P7\n";
/// Start of a record as the transcoder writes it. Used to spot a record
/// boundary inside a header or body.
const RECORD_START: &[u8] = b"P7\nWIDTH ";
const END_OF_HEADER: &[u8] = b"ENDHDR\n";
const MAX_HEADER_BYTES: usize = 1024;
const MAX_DIMENSION: u32 = 8192;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PamHeader {
    width: u32,
    height: u32,
}

/// Lazy, unbounded frame iterator over one transcoder connection.
///
/// Yields `Ok(Frame)` for every well-formed record and `Err` for every
/// malformed one. Returns `None` once the underlying reader reaches EOF.
pub struct PamDecoder<R: Read> {
    reader: R,
    buffer: Vec<u8>,
    eof: bool,
    /// Set after a rejected header: bytes up to the next header belong to
    /// that record and are dropped without a second error.
    resync: bool,
    frames_decoded: u64,
    failures: u64,
}

impl<R: Read> PamDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(READ_CHUNK),
            eof: false,
            resync: false,
            frames_decoded: 0,
            failures: 0,
        }
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Reads more bytes into the buffer. Returns false at EOF.
    fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let mut chunk = vec![0u8; READ_CHUNK];
        let read = loop {
            match self.reader.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("read pam stream"),
            }
        };
        if read == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(true)
    }

    fn next_record(&mut self) -> Option<Result<Frame>> {
        // Align on a header.
        let start = loop {
            if let Some(pos) = find(&self.buffer, MAGIC, 0) {
                break pos;
            }
            if self.buffer.len() > MAX_HEADER_BYTES {
                let keep = MAGIC.len() - 1;
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
            match self.fill() {
                Ok(true) => continue,
                Ok(false) => {
                    let stray = !self.buffer_is_whitespace() && !self.resync;
                    let len = self.buffer.len();
                    self.buffer.clear();
                    self.resync = false;
                    if stray {
                        return Some(Err(anyhow!("pam stream ended with {} stray bytes", len)));
                    }
                    return None;
                }
                Err(e) => return Some(Err(e)),
            }
        };
        if start > 0 {
            self.buffer.drain(..start);
            if !std::mem::take(&mut self.resync) {
                return Some(Err(anyhow!(
                    "skipped {} bytes of non-PAM data before header",
                    start
                )));
            }
        }
        self.resync = false;

        // Complete header, which must end before any following record begins.
        let header_end = loop {
            let limit = self.buffer.len().min(MAX_HEADER_BYTES);
            if let Some(pos) = find(&self.buffer[..limit], END_OF_HEADER, MAGIC.len()) {
                let end = pos + END_OF_HEADER.len();
                if let Some(next) = find(&self.buffer[..end], RECORD_START, 1) {
                    self.buffer.drain(..next);
                    return Some(Err(anyhow!(
                        "pam header cut off after {} bytes by the next record",
                        next
                    )));
                }
                break end;
            }
            if self.buffer.len() >= MAX_HEADER_BYTES {
                self.buffer.drain(..MAGIC.len());
                self.resync = true;
                return Some(Err(anyhow!(
                    "pam header exceeds {} bytes without ENDHDR",
                    MAX_HEADER_BYTES
                )));
            }
            match self.fill() {
                Ok(true) => continue,
                Ok(false) => {
                    self.buffer.clear();
                    return Some(Err(anyhow!("pam stream ended inside a header")));
                }
                Err(e) => return Some(Err(e)),
            }
        };

        let header = match parse_header(&self.buffer[MAGIC.len()..header_end]) {
            Ok(header) => header,
            Err(e) => {
                self.buffer.drain(..header_end);
                self.resync = true;
                return Some(Err(e));
            }
        };
        let body_len = match rgba_len(header.width, header.height) {
            Ok(len) => len,
            Err(e) => {
                self.buffer.drain(..header_end);
                self.resync = true;
                return Some(Err(e));
            }
        };

        // Body. Pixel data may contain a record start by chance, so an early
        // record start only ends the body when a valid header follows it.
        let record_end = header_end + body_len;
        let mut scan_from = header_end;
        loop {
            let mut pending = false;
            while let Some(pos) =
                find(&self.buffer, RECORD_START, scan_from).filter(|pos| *pos < record_end)
            {
                match check_header(&self.buffer[pos..]) {
                    HeaderCheck::Valid => {
                        self.buffer.drain(..pos);
                        return Some(Err(anyhow!(
                            "pam body truncated: {} of {} bytes before next header",
                            pos - header_end,
                            body_len
                        )));
                    }
                    HeaderCheck::Incomplete if !self.eof => {
                        pending = true;
                        break;
                    }
                    HeaderCheck::Invalid | HeaderCheck::Incomplete => scan_from = pos + 1,
                }
            }
            if !pending {
                scan_from = self
                    .buffer
                    .len()
                    .saturating_sub(RECORD_START.len() - 1)
                    .max(scan_from);
                if self.buffer.len() >= record_end {
                    break;
                }
            }
            match self.fill() {
                Ok(true) => continue,
                Ok(false) if self.buffer.len() >= record_end => continue,
                Ok(false) => {
                    let got = self.buffer.len() - header_end;
                    self.buffer.clear();
                    return Some(Err(anyhow!(
                        "pam stream ended inside a body: {} of {} bytes",
                        got,
                        body_len
                    )));
                }
                Err(e) => return Some(Err(e)),
            }
        }

        let pixels = self.buffer[header_end..record_end].to_vec();
        self.buffer.drain(..record_end);
        Some(Frame::new(header.width, header.height, pixels))
    }

    fn buffer_is_whitespace(&self) -> bool {
        self.buffer.iter().all(|b| b.is_ascii_whitespace())
    }
}

impl<R: Read> Iterator for PamDecoder<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.next_record()?;
        match &item {
            Ok(_) => self.frames_decoded += 1,
            Err(_) => self.failures += 1,
        }
        Some(item)
    }
}

enum HeaderCheck {
    Valid,
    Invalid,
    /// More bytes are needed to decide.
    Incomplete,
}

/// Whether `bytes` (starting at a record start) begin with a complete, valid header.
fn check_header(bytes: &[u8]) -> HeaderCheck {
    let limit = bytes.len().min(MAX_HEADER_BYTES);
    match find(&bytes[..limit], END_OF_HEADER, MAGIC.len()) {
        Some(pos) => {
            let end = pos + END_OF_HEADER.len();
            if find(&bytes[..end], RECORD_START, 1).is_some() {
                return HeaderCheck::Invalid;
            }
            match parse_header(&bytes[MAGIC.len()..end]) {
                Ok(_) => HeaderCheck::Valid,
                Err(_) => HeaderCheck::Invalid,
            }
        }
        None if bytes.len() >= MAX_HEADER_BYTES => HeaderCheck::Invalid,
        None => HeaderCheck::Incomplete,
    }
}

fn parse_header(text: &[u8]) -> Result<PamHeader> {
    let text = std::str::from_utf8(text).context("pam header is not ASCII")?;
    let mut width = None;
    let mut height = None;
    let mut depth = None;
    let mut maxval = None;
    let mut tupltype = None;
    let mut ended = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let value = value.trim();
        match key {
            "WIDTH" => width = Some(parse_number(key, value)?),
            "HEIGHT" => height = Some(parse_number(key, value)?),
            "DEPTH" => depth = Some(parse_number(key, value)?),
            "MAXVAL" => maxval = Some(parse_number(key, value)?),
            "TUPLTYPE" => tupltype = Some(value.to_string()),
            "ENDHDR" => {
                ended = true;
                break;
            }
            other => return Err(anyhow!("unknown pam header token '{}'", other)),
        }
    }

    if !ended {
        return Err(anyhow!("pam header missing ENDHDR"));
    }
    let width = width.ok_or_else(|| anyhow!("pam header missing WIDTH"))?;
    let height = height.ok_or_else(|| anyhow!("pam header missing HEIGHT"))?;
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(anyhow!("pam dimensions {}x{} out of range", width, height));
    }
    if depth != Some(FRAME_CHANNELS as u32) {
        return Err(anyhow!("pam DEPTH must be 4, got {:?}", depth));
    }
    if maxval != Some(255) {
        return Err(anyhow!("pam MAXVAL must be 255, got {:?}", maxval));
    }
    if tupltype.as_deref() != Some("RGB_ALPHA") {
        return Err(anyhow!(
            "pam TUPLTYPE must be RGB_ALPHA, got {:?}",
            tupltype
        ));
    }
    Ok(PamHeader { width, height })
}

fn parse_number(key: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| anyhow!("pam {} value '{}' is not a number", key, value))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || haystack.len() - from < needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// Serialises a frame as one PAM record, byte-compatible with the transcoder output.
pub fn encode_pam(width: u32, height: u32, pixels: &[u8]) -> Vec<u8> {
    let header = format!(
        "P7\nWIDTH {}\nHEIGHT {}\nDEPTH 4\nMAXVAL 255\nTUPLTYPE RGB_ALPHA\nENDHDR\n",
        width, height
    );
    let mut out = Vec::with_capacity(header.len() + pixels.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(pixels);
    out
}
