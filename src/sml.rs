//! Smart Message Language (SML) decoder.
//!
//! SML frames are a bytewise recursive TLV encoding: the upper nibble of
//! each byte tags the element (sequence, octet string, unsigned int, signed
//! int, boolean), the lower nibble is a length. Used by the `port` handler
//! to pull OBIS-coded readings out of a smart meter's optical output.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SmlError {
    #[error("SML parsing - data missing")]
    DataMissing,
    #[error("SML parsing - unknown type/length byte")]
    UnknownType,
    #[error("SML parsing - no end of message indicator")]
    NoEndOfMessage,
}

/// One node of the tree produced by [`SmlFile::parse`].
#[derive(Clone, Debug, PartialEq)]
pub enum SmlNode {
    Null,
    String(Vec<u8>),
    Integer(i64),
    Boolean(bool),
    Sequence(Vec<SmlNode>),
}

impl SmlNode {
    fn as_sequence(&self) -> Option<&[SmlNode]> {
        match self {
            SmlNode::Sequence(items) => Some(items),
            _ => None,
        }
    }

    fn as_string(&self) -> Option<&[u8]> {
        match self {
            SmlNode::String(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Display for SmlNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_node(f: &mut fmt::Formatter<'_>, node: &SmlNode, depth: usize) -> fmt::Result {
            let pad = " ".repeat(depth * 3);
            match node {
                SmlNode::Sequence(items) => {
                    writeln!(f, "{pad}SEQUENCE")?;
                    for item in items {
                        write_node(f, item, depth + 1)?;
                    }
                    Ok(())
                }
                SmlNode::Null => writeln!(f, "{pad}NULL"),
                SmlNode::String(bytes) => writeln!(f, "{pad}STRING 0x{}", hex::encode(bytes)),
                SmlNode::Integer(n) => writeln!(f, "{pad}INTEGER {n}"),
                SmlNode::Boolean(b) => writeln!(f, "{pad}BOOLEAN {b}"),
            }
        }
        write_node(f, self, 0)
    }
}

/// A parsed SML datagram.
#[derive(Clone, Debug, Default)]
pub struct SmlFile {
    root: Vec<SmlNode>,
}

impl SmlFile {
    /// Decodes `content` into an object tree. On failure the file is left
    /// empty; the caller typically just retries on the next chunk of bytes
    /// once more data has arrived.
    pub fn parse(content: &[u8]) -> Result<SmlFile, SmlError> {
        let mut pos = 0usize;
        let mut root = Vec::new();
        while pos < content.len() {
            root.push(parse_item(content, &mut pos)?);
            if pos >= content.len() || content[pos] != 0x00 {
                return Err(SmlError::NoEndOfMessage);
            }
            pos += 1;
        }
        Ok(SmlFile { root })
    }

    /// Depth-first search for a sequence whose first element is the octet
    /// string `needle` (an OBIS code). Mirrors a smart meter datagram's
    /// `(obisCode, ..., value)` shape.
    pub fn search_sequence(&self, needle: &[u8]) -> Option<&[SmlNode]> {
        fn search<'a>(node: &'a SmlNode, needle: &[u8]) -> Option<&'a [SmlNode]> {
            let items = node.as_sequence()?;
            if !items.is_empty() && items[0].as_string() == Some(needle) {
                return Some(items);
            }
            for item in items {
                if let Some(found) = search(item, needle) {
                    return Some(found);
                }
            }
            None
        }
        for node in &self.root {
            if let Some(found) = search(node, needle) {
                return Some(found);
            }
        }
        None
    }

    pub fn nodes(&self) -> &[SmlNode] {
        &self.root
    }
}

impl fmt::Display for SmlFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.root {
            write!(f, "{node}")?;
        }
        Ok(())
    }
}

fn parse_item(content: &[u8], pos: &mut usize) -> Result<SmlNode, SmlError> {
    if *pos >= content.len() {
        return Err(SmlError::DataMissing);
    }
    let byte = content[*pos];
    let len = (byte & 0x0F) as usize;
    match byte & 0xF0 {
        0x70 => {
            *pos += 1;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(parse_item(content, pos)?);
            }
            Ok(SmlNode::Sequence(items))
        }
        0x00 => {
            if len == 0 {
                *pos += 1;
                return Ok(SmlNode::Null);
            }
            if *pos + len > content.len() {
                return Err(SmlError::DataMissing);
            }
            let node = if len == 1 {
                SmlNode::Null
            } else {
                SmlNode::String(content[*pos + 1..*pos + len].to_vec())
            };
            *pos += len;
            Ok(node)
        }
        0x60 => {
            if *pos + len > content.len() {
                return Err(SmlError::DataMissing);
            }
            let mut n: i64 = 0;
            for i in 1..len {
                n = n * 256 + content[*pos + i] as i64;
            }
            *pos += len;
            Ok(SmlNode::Integer(n))
        }
        0x50 => {
            if *pos + len > content.len() {
                return Err(SmlError::DataMissing);
            }
            let mut n: i64 = 0;
            let mut factor: i64 = 1;
            for i in 1..len {
                n = n * 256 + content[*pos + i] as i64;
                factor *= 256;
            }
            if len > 1 && content[*pos + 1] & 0x80 != 0 {
                n -= factor;
            }
            *pos += len;
            Ok(SmlNode::Integer(n))
        }
        0x40 => {
            if *pos + len > content.len() {
                return Err(SmlError::DataMissing);
            }
            let b = content[*pos + 1] != 0x00;
            *pos += len;
            Ok(SmlNode::Boolean(b))
        }
        _ => Err(SmlError::UnknownType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_sequence_with_string_and_integer() {
        // 0x72: sequence of 2; 0x02 "A" (len 2 -> 1 payload byte "A"); 0x62 unsigned int of len 2 -> 1 byte value 5; 0x00 end
        let bytes = [0x72, 0x02, b'A', 0x62, 0x05, 0x00];
        let file = SmlFile::parse(&bytes).unwrap();
        assert_eq!(file.nodes().len(), 1);
        let seq = file.nodes()[0].as_sequence().unwrap();
        assert_eq!(seq[0], SmlNode::String(vec![b'A']));
        assert_eq!(seq[1], SmlNode::Integer(5));
    }

    #[test]
    fn decodes_negative_signed_integer() {
        // 0x52 signed int len 2 -> 1 payload byte 0xFF (== -1 two's complement)
        let bytes = [0x71, 0x52, 0xFF, 0x00];
        let file = SmlFile::parse(&bytes).unwrap();
        let seq = file.nodes()[0].as_sequence().unwrap();
        assert_eq!(seq[0], SmlNode::Integer(-1));
    }

    #[test]
    fn missing_end_marker_is_an_error() {
        // same payload as the first test, minus the trailing 0x00
        let bytes = [0x72, 0x02, b'A', 0x62, 0x05];
        assert_eq!(SmlFile::parse(&bytes), Err(SmlError::NoEndOfMessage));
    }

    #[test]
    fn truncated_data_is_an_error() {
        let bytes = [0x62, 0x01];
        assert_eq!(SmlFile::parse(&bytes), Err(SmlError::DataMissing));
    }

    #[test]
    fn embedded_empty_null_tag_advances_past_itself() {
        // sequence of 2: a zero-length null (0x00), then an unsigned int 0x62 0x05
        let bytes = [0x72, 0x00, 0x62, 0x05, 0x00];
        let file = SmlFile::parse(&bytes).unwrap();
        let seq = file.nodes()[0].as_sequence().unwrap();
        assert_eq!(seq[0], SmlNode::Null);
        assert_eq!(seq[1], SmlNode::Integer(5));
    }

    #[test]
    fn search_sequence_finds_obis_code() {
        // sequence containing ["1-0:1.8.0", 1234]
        let obis = b"1-0:1.8.0";
        let mut bytes = vec![0x72, (0x00 | (obis.len() as u8 + 1))];
        bytes.extend_from_slice(obis);
        bytes.push(0x62);
        bytes.push(0x04);
        bytes.push(0x00);
        let file = SmlFile::parse(&bytes).unwrap();
        let found = file.search_sequence(obis).unwrap();
        assert_eq!(found[1], SmlNode::Integer(4));
    }
}
