//! Basic Encoding Rules (BER) primitives for Z39.50 APDUs.
//!
//! [`BerReader`] walks a `&[u8]` slice and yields [`Tlv`] values; [`BerWriter`]
//! accumulates definite-length encodings into a [`BytesMut`] buffer.
//!
//! Only the subset Z39.50 needs is supported:
//!
//! - all four tag classes, low- and high-tag-number forms
//! - definite lengths (short and long form, up to 4 length octets)
//! - indefinite lengths on constructed values, decode only
//! - INTEGER, BOOLEAN, NULL, OCTET STRING, BIT STRING, OBJECT IDENTIFIER and
//!   the character string types treated as UTF-8
//!
//! A short buffer is reported as [`CodecError::Incomplete`] so callers can read
//! more and retry; everything else that cannot be decoded is
//! [`CodecError::Malformed`].

use bytes::{BufMut, BytesMut};
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding BER input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ends before the value it declares; at least `needed` more
    /// bytes are required.
    #[error("incomplete message: need at least {needed} more bytes")]
    Incomplete {
        /// Lower bound on the missing byte count.
        needed: usize,
    },

    /// The input can never decode, however much more is read.
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Convenience alias for codec results.
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Tag class bits (top two bits of the identifier octet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
    /// Built-in ASN.1 types
    Universal,
    /// Application-wide tags
    Application,
    /// Context-specific tags, used throughout Z39.50
    Context,
    /// Private-use tags
    Private,
}

impl TagClass {
    fn bits(self) -> u8 {
        match self {
            TagClass::Universal => 0x00,
            TagClass::Application => 0x40,
            TagClass::Context => 0x80,
            TagClass::Private => 0xC0,
        }
    }

    fn from_bits(byte: u8) -> Self {
        match byte & 0xC0 {
            0x00 => TagClass::Universal,
            0x40 => TagClass::Application,
            0x80 => TagClass::Context,
            _ => TagClass::Private,
        }
    }
}

/// A BER identifier: class, primitive/constructed flag and tag number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    /// Tag class
    pub class: TagClass,
    /// Constructed encoding (contents are nested TLVs)
    pub constructed: bool,
    /// Tag number
    pub number: u32,
}

impl Tag {
    /// Context-specific primitive tag `[n] IMPLICIT`.
    #[must_use]
    pub const fn context(number: u32) -> Self {
        Tag {
            class: TagClass::Context,
            constructed: false,
            number,
        }
    }

    /// Context-specific constructed tag.
    #[must_use]
    pub const fn context_constructed(number: u32) -> Self {
        Tag {
            class: TagClass::Context,
            constructed: true,
            number,
        }
    }

    /// Universal primitive tag.
    #[must_use]
    pub const fn universal(number: u32) -> Self {
        Tag {
            class: TagClass::Universal,
            constructed: false,
            number,
        }
    }

    /// Universal constructed tag.
    #[must_use]
    pub const fn universal_constructed(number: u32) -> Self {
        Tag {
            class: TagClass::Universal,
            constructed: true,
            number,
        }
    }

    /// True when class and number match, whatever the constructed flag.
    #[must_use]
    pub fn is(&self, class: TagClass, number: u32) -> bool {
        self.class == class && self.number == number
    }

    /// Shorthand for a context-specific class/number match.
    #[must_use]
    pub fn is_context(&self, number: u32) -> bool {
        self.is(TagClass::Context, number)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = match self.class {
            TagClass::Universal => "UNIVERSAL ",
            TagClass::Application => "APPLICATION ",
            TagClass::Context => "",
            TagClass::Private => "PRIVATE ",
        };
        write!(f, "[{class}{}]", self.number)
    }
}

/// Universal tag numbers used by Z39.50.
pub mod universal {
    /// BOOLEAN
    pub const BOOLEAN: u32 = 1;
    /// INTEGER
    pub const INTEGER: u32 = 2;
    /// BIT STRING
    pub const BIT_STRING: u32 = 3;
    /// OCTET STRING
    pub const OCTET_STRING: u32 = 4;
    /// NULL
    pub const NULL: u32 = 5;
    /// OBJECT IDENTIFIER
    pub const OBJECT_IDENTIFIER: u32 = 6;
    /// EXTERNAL
    pub const EXTERNAL: u32 = 8;
    /// SEQUENCE / SEQUENCE OF
    pub const SEQUENCE: u32 = 16;
    /// VisibleString
    pub const VISIBLE_STRING: u32 = 26;
    /// GeneralString (InternationalString)
    pub const GENERAL_STRING: u32 = 27;
}

/// An object identifier as its arc list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Oid(Vec<u32>);

impl Oid {
    /// Build an OID from its arcs.
    #[must_use]
    pub fn new(arcs: &[u32]) -> Self {
        Oid(arcs.to_vec())
    }

    /// The arcs, most significant first.
    #[must_use]
    pub fn arcs(&self) -> &[u32] {
        &self.0
    }
}

impl PartialEq<[u32]> for Oid {
    fn eq(&self, other: &[u32]) -> bool {
        self.0 == other
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arcs: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", arcs.join("."))
    }
}

/// One decoded tag-length-value triple borrowing its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    /// Identifier
    pub tag: Tag,
    /// Contents octets (end-of-contents marker excluded for indefinite lengths)
    pub contents: &'a [u8],
}

impl<'a> Tlv<'a> {
    /// Reader over the nested values of a constructed TLV.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if the TLV is primitive.
    pub fn children(&self) -> CodecResult<BerReader<'a>> {
        if !self.tag.constructed {
            return Err(CodecError::Malformed(format!(
                "expected constructed encoding for {}",
                self.tag
            )));
        }
        Ok(BerReader::new(self.contents))
    }

    /// Contents of a primitive TLV.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if the TLV is constructed.
    pub fn primitive(&self) -> CodecResult<&'a [u8]> {
        if self.tag.constructed {
            return Err(CodecError::Malformed(format!(
                "expected primitive encoding for {}",
                self.tag
            )));
        }
        Ok(self.contents)
    }

    /// Decode as INTEGER.
    ///
    /// # Errors
    ///
    /// Malformed when empty, constructed, or wider than 64 bits.
    pub fn integer(&self) -> CodecResult<i64> {
        decode_integer(self.primitive()?)
    }

    /// Decode as BOOLEAN.
    ///
    /// # Errors
    ///
    /// Malformed unless the contents are exactly one octet.
    pub fn boolean(&self) -> CodecResult<bool> {
        match self.primitive()? {
            [b] => Ok(*b != 0),
            other => Err(CodecError::Malformed(format!(
                "BOOLEAN must be 1 octet, got {}",
                other.len()
            ))),
        }
    }

    /// Decode an octet or character string as text, replacing invalid UTF-8.
    ///
    /// # Errors
    ///
    /// Malformed when the TLV is constructed.
    pub fn string(&self) -> CodecResult<String> {
        Ok(String::from_utf8_lossy(self.primitive()?).into_owned())
    }

    /// Decode as OBJECT IDENTIFIER.
    ///
    /// # Errors
    ///
    /// Malformed when empty or when an arc overflows 32 bits.
    pub fn oid(&self) -> CodecResult<Oid> {
        decode_oid(self.primitive()?)
    }

    /// Decode as BIT STRING.
    ///
    /// # Errors
    ///
    /// Malformed when empty or the unused-bit count exceeds 7.
    pub fn bit_string(&self) -> CodecResult<BitString> {
        BitString::decode(self.primitive()?)
    }
}

/// Sequential BER reader over a byte slice.
///
/// Every read either yields a complete TLV or fails without moving the
/// offset, so a caller that receives [`CodecError::Incomplete`] can retry the
/// same reader position once more bytes are available.
#[derive(Debug, Clone)]
pub struct BerReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> BerReader<'a> {
    /// Create a reader at offset 0.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Current offset into the buffer.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// True once every byte has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offset >= self.buf.len()
    }

    /// Read the next TLV.
    ///
    /// # Errors
    ///
    /// [`CodecError::Incomplete`] if the buffer ends inside the TLV,
    /// [`CodecError::Malformed`] for invalid identifiers or lengths.
    pub fn read_tlv(&mut self) -> CodecResult<Tlv<'a>> {
        let (tlv, consumed) = parse_tlv(&self.buf[self.offset..])?;
        self.offset += consumed;
        Ok(tlv)
    }

    /// Read the next TLV if any bytes remain.
    ///
    /// # Errors
    ///
    /// As [`read_tlv`](Self::read_tlv).
    pub fn next_tlv(&mut self) -> CodecResult<Option<Tlv<'a>>> {
        if self.is_empty() {
            Ok(None)
        } else {
            self.read_tlv().map(Some)
        }
    }
}

/// Deepest nesting of indefinite-length values accepted by [`parse_tlv`].
pub const MAX_INDEFINITE_DEPTH: usize = 64;

/// Parse one TLV from the start of `buf`, returning it with the bytes consumed.
///
/// # Errors
///
/// See [`BerReader::read_tlv`]. Indefinite-length values nested more than
/// [`MAX_INDEFINITE_DEPTH`] deep are [`CodecError::Malformed`].
pub fn parse_tlv(buf: &[u8]) -> CodecResult<(Tlv<'_>, usize)> {
    parse_tlv_at(buf, 0)
}

// Finding the end of an indefinite value means walking its children, so
// `depth` counts the enclosing indefinite values.
fn parse_tlv_at(buf: &[u8], depth: usize) -> CodecResult<(Tlv<'_>, usize)> {
    let (tag, tag_len) = parse_identifier(buf)?;
    let (length, len_len) = parse_length(&buf[tag_len..])?;
    let header = tag_len + len_len;

    match length {
        Some(length) => {
            let total = header
                .checked_add(length)
                .ok_or_else(|| CodecError::Malformed("length overflow".to_string()))?;
            if buf.len() < total {
                return Err(CodecError::Incomplete {
                    needed: total - buf.len(),
                });
            }
            Ok((
                Tlv {
                    tag,
                    contents: &buf[header..total],
                },
                total,
            ))
        },
        None => {
            if !tag.constructed {
                return Err(CodecError::Malformed(format!(
                    "indefinite length on primitive {tag}"
                )));
            }
            if depth >= MAX_INDEFINITE_DEPTH {
                return Err(CodecError::Malformed(format!(
                    "indefinite lengths nested deeper than {MAX_INDEFINITE_DEPTH}"
                )));
            }
            let body = &buf[header..];
            let mut pos = 0;
            loop {
                match body.get(pos..pos + 2) {
                    Some([0, 0]) => break,
                    Some(_) => pos += parse_tlv_at(&body[pos..], depth + 1)?.1,
                    None => {
                        return Err(CodecError::Incomplete {
                            needed: pos + 2 - body.len(),
                        })
                    },
                }
            }
            Ok((
                Tlv {
                    tag,
                    contents: &body[..pos],
                },
                header + pos + 2,
            ))
        },
    }
}

fn parse_identifier(buf: &[u8]) -> CodecResult<(Tag, usize)> {
    let first = *buf.first().ok_or(CodecError::Incomplete { needed: 1 })?;
    let class = TagClass::from_bits(first);
    let constructed = first & 0x20 != 0;

    if first & 0x1F != 0x1F {
        return Ok((
            Tag {
                class,
                constructed,
                number: u32::from(first & 0x1F),
            },
            1,
        ));
    }

    let mut number: u32 = 0;
    for (i, &byte) in buf[1..].iter().enumerate() {
        if i == 4 {
            return Err(CodecError::Malformed("tag number too large".to_string()));
        }
        number = number
            .checked_mul(128)
            .ok_or_else(|| CodecError::Malformed("tag number too large".to_string()))?
            | u32::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Ok((
                Tag {
                    class,
                    constructed,
                    number,
                },
                i + 2,
            ));
        }
    }
    Err(CodecError::Incomplete { needed: 1 })
}

// `None` length means indefinite form.
fn parse_length(buf: &[u8]) -> CodecResult<(Option<usize>, usize)> {
    let first = *buf.first().ok_or(CodecError::Incomplete { needed: 1 })?;
    if first < 0x80 {
        return Ok((Some(usize::from(first)), 1));
    }
    if first == 0x80 {
        return Ok((None, 1));
    }
    let count = usize::from(first & 0x7F);
    if count > 4 {
        return Err(CodecError::Malformed(format!(
            "length uses {count} octets, at most 4 supported"
        )));
    }
    if buf.len() < 1 + count {
        return Err(CodecError::Incomplete {
            needed: 1 + count - buf.len(),
        });
    }
    let length = buf[1..=count]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
    Ok((Some(length), 1 + count))
}

/// Decode a two's-complement INTEGER.
///
/// # Errors
///
/// Malformed when empty or wider than 8 octets.
pub fn decode_integer(contents: &[u8]) -> CodecResult<i64> {
    if contents.is_empty() || contents.len() > 8 {
        return Err(CodecError::Malformed(format!(
            "INTEGER of {} octets",
            contents.len()
        )));
    }
    let negative = contents[0] & 0x80 != 0;
    let mut value: i64 = if negative { -1 } else { 0 };
    for &byte in contents {
        value = (value << 8) | i64::from(byte);
    }
    Ok(value)
}

/// Decode OBJECT IDENTIFIER contents.
///
/// # Errors
///
/// Malformed when empty, truncated mid-arc, or an arc overflows 32 bits.
pub fn decode_oid(contents: &[u8]) -> CodecResult<Oid> {
    if contents.is_empty() {
        return Err(CodecError::Malformed("empty OBJECT IDENTIFIER".to_string()));
    }
    let mut arcs = Vec::new();
    let mut value: u32 = 0;
    for (i, &byte) in contents.iter().enumerate() {
        value = value
            .checked_mul(128)
            .ok_or_else(|| CodecError::Malformed("OID arc overflow".to_string()))?
            | u32::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (value / 40).min(2);
                arcs.push(first);
                arcs.push(value - first * 40);
            } else {
                arcs.push(value);
            }
            value = 0;
        } else if i == contents.len() - 1 {
            return Err(CodecError::Malformed("OID ends mid-arc".to_string()));
        }
    }
    Ok(Oid(arcs))
}

/// A BIT STRING as a vector of flags, bit 0 first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitString(Vec<bool>);

impl BitString {
    /// A bit string of `len` bits with the given positions set.
    #[must_use]
    pub fn with_bits(len: usize, set: &[usize]) -> Self {
        let mut bits = vec![false; len];
        for &bit in set {
            if bit < len {
                bits[bit] = true;
            }
        }
        BitString(bits)
    }

    /// Whether bit `n` is set; bits past the end read as unset.
    #[must_use]
    pub fn is_set(&self, n: usize) -> bool {
        self.0.get(n).copied().unwrap_or(false)
    }

    /// Number of bits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the string holds no bits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn encode(&self) -> Vec<u8> {
        let unused = (8 - self.0.len() % 8) % 8;
        let mut out = vec![u8::try_from(unused).unwrap_or(0)];
        for chunk in self.0.chunks(8) {
            let mut byte = 0u8;
            for (i, &bit) in chunk.iter().enumerate() {
                if bit {
                    byte |= 0x80 >> i;
                }
            }
            out.push(byte);
        }
        out
    }

    fn decode(contents: &[u8]) -> CodecResult<Self> {
        let (&unused, data) = contents
            .split_first()
            .ok_or_else(|| CodecError::Malformed("empty BIT STRING".to_string()))?;
        if unused > 7 || (data.is_empty() && unused != 0) {
            return Err(CodecError::Malformed(format!(
                "BIT STRING with {unused} unused bits"
            )));
        }
        let len = data.len() * 8 - usize::from(unused);
        let bits = (0..len).map(|i| data[i / 8] & (0x80 >> (i % 8)) != 0).collect();
        Ok(BitString(bits))
    }
}

/// Definite-length BER writer.
#[derive(Debug, Default)]
pub struct BerWriter {
    buf: BytesMut,
}

impl BerWriter {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer and return its bytes.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    /// Write a primitive TLV with raw contents.
    pub fn primitive(&mut self, tag: Tag, contents: &[u8]) {
        write_identifier(&mut self.buf, tag);
        write_length(&mut self.buf, contents.len());
        self.buf.put_slice(contents);
    }

    /// Write a constructed TLV whose contents are produced by `body`.
    pub fn constructed(&mut self, tag: Tag, body: impl FnOnce(&mut BerWriter)) {
        let mut inner = BerWriter::new();
        body(&mut inner);
        let tag = Tag {
            constructed: true,
            ..tag
        };
        write_identifier(&mut self.buf, tag);
        write_length(&mut self.buf, inner.buf.len());
        self.buf.put_slice(&inner.buf);
    }

    /// Write an INTEGER in minimal two's-complement form.
    pub fn integer(&mut self, tag: Tag, value: i64) {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < 7 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        self.primitive(tag, &bytes[start..]);
    }

    /// Write a BOOLEAN (0xFF for true).
    pub fn boolean(&mut self, tag: Tag, value: bool) {
        self.primitive(tag, &[if value { 0xFF } else { 0x00 }]);
    }

    /// Write a NULL.
    pub fn null(&mut self, tag: Tag) {
        self.primitive(tag, &[]);
    }

    /// Write a string's UTF-8 bytes.
    pub fn string(&mut self, tag: Tag, value: &str) {
        self.primitive(tag, value.as_bytes());
    }

    /// Write an OBJECT IDENTIFIER.
    pub fn oid(&mut self, tag: Tag, oid: &Oid) {
        let arcs = oid.arcs();
        let mut contents = Vec::new();
        if arcs.len() >= 2 {
            push_base128(&mut contents, arcs[0] * 40 + arcs[1]);
            for &arc in &arcs[2..] {
                push_base128(&mut contents, arc);
            }
        } else if let Some(&only) = arcs.first() {
            push_base128(&mut contents, only * 40);
        }
        self.primitive(tag, &contents);
    }

    /// Write a BIT STRING.
    pub fn bit_string(&mut self, tag: Tag, bits: &BitString) {
        self.primitive(tag, &bits.encode());
    }
}

fn write_identifier(buf: &mut BytesMut, tag: Tag) {
    let mut first = tag.class.bits();
    if tag.constructed {
        first |= 0x20;
    }
    if tag.number < 31 {
        buf.put_u8(first | u8::try_from(tag.number).unwrap_or(0));
    } else {
        buf.put_u8(first | 0x1F);
        let mut number = Vec::new();
        push_base128(&mut number, tag.number);
        buf.put_slice(&number);
    }
}

fn write_length(buf: &mut BytesMut, length: usize) {
    if length < 0x80 {
        buf.put_u8(u8::try_from(length).unwrap_or(0));
        return;
    }
    let bytes = (length as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    buf.put_u8(0x80 | u8::try_from(bytes.len() - skip).unwrap_or(0));
    buf.put_slice(&bytes[skip..]);
}

fn push_base128(out: &mut Vec<u8>, mut value: u32) {
    let mut tmp = [0u8; 5];
    let mut i = tmp.len();
    loop {
        i -= 1;
        tmp[i] = u8::try_from(value & 0x7F).unwrap_or(0);
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    let last = tmp.len() - 1;
    for (j, byte) in tmp.iter().enumerate().skip(i) {
        out.push(if j == last { *byte } else { byte | 0x80 });
    }
}
