//! Endian-aware binary reader over the capture byte stream
//!
//! Wraps any `Read` source, sniffing the first four bytes for the
//! compression signature: when present the remainder is inflated
//! transparently, otherwise the sniffed bytes are replayed. All primitive
//! reads honor the file endianness selected once the header's endianness
//! byte is known. String bodies are length-prefixed, optionally XOR-masked,
//! and wide (UTF-16) strings are transcoded to UTF-8 at this boundary.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::DeflateDecoder;
use std::io::{self, Read};

/// Four-byte signature marking a deflate-compressed capture body.
pub const COMPRESSION_SIGNATURE: u32 = 0x2323_4646;

/// Strings at or above this length are treated as truncated: the read
/// yields an empty string and only the length prefix is consumed.
pub const MAX_STRING_LEN: u32 = 1024;

pub struct BinReader<'a> {
    src: Box<dyn Read + 'a>,
    big_endian: bool,
    compressed: bool,
    position: u64,
}

impl<'a> BinReader<'a> {
    /// Sniff the compression signature and build the reader. The stream
    /// starts in little-endian mode; [`BinReader::set_big_endian`] switches
    /// once the header's endianness byte has been read.
    pub fn new(mut reader: impl Read + 'a) -> io::Result<Self> {
        let mut head = [0u8; 4];
        let mut got = 0;
        while got < head.len() {
            let n = reader.read(&mut head[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }

        let compressed = got == 4
            && (LittleEndian::read_u32(&head) == COMPRESSION_SIGNATURE
                || BigEndian::read_u32(&head) == COMPRESSION_SIGNATURE);

        let src: Box<dyn Read + 'a> = if compressed {
            Box::new(DeflateDecoder::new(reader))
        } else {
            Box::new(io::Cursor::new(head[..got].to_vec()).chain(reader))
        };

        Ok(Self { src, big_endian: false, compressed, position: 0 })
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    #[must_use]
    pub fn big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn set_big_endian(&mut self, big_endian: bool) {
        self.big_endian = big_endian;
    }

    /// Bytes consumed so far (after decompression, excluding the signature).
    #[must_use]
    pub fn tell(&self) -> u64 {
        self.position
    }

    fn fill(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.src.read_exact(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.fill(&mut b)?;
        Ok(b[0])
    }

    /// Read one byte, distinguishing a clean end of stream (`None`) from a
    /// successful read. Used at record boundaries.
    pub fn try_read_u8(&mut self) -> io::Result<Option<u8>> {
        let mut b = [0u8; 1];
        loop {
            match self.src.read(&mut b) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.position += 1;
                    return Ok(Some(b[0]));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        let mut b = [0u8; 2];
        self.fill(&mut b)?;
        Ok(if self.big_endian { BigEndian::read_u16(&b) } else { LittleEndian::read_u16(&b) })
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        let mut b = [0u8; 4];
        self.fill(&mut b)?;
        Ok(if self.big_endian { BigEndian::read_u32(&b) } else { LittleEndian::read_u32(&b) })
    }

    pub fn read_u64(&mut self) -> io::Result<u64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(if self.big_endian { BigEndian::read_u64(&b) } else { LittleEndian::read_u64(&b) })
    }

    /// Read a pointer-sized value, zero-extending 32-bit pointers.
    pub fn read_ptr(&mut self, wide: bool) -> io::Result<u64> {
        if wide {
            self.read_u64()
        } else {
            self.read_u32().map(u64::from)
        }
    }

    /// Length-prefixed UTF-8 string with an optional XOR mask over the
    /// body bytes. Returns the string and the bytes consumed.
    pub fn read_narrow_string(&mut self, xor: u8) -> io::Result<(String, u64)> {
        let len = self.read_u32()?;
        if len >= MAX_STRING_LEN {
            return Ok((String::new(), 4));
        }

        let mut buf = vec![0u8; len as usize];
        self.fill(&mut buf)?;
        if xor != 0 {
            for b in &mut buf {
                *b ^= xor;
            }
        }
        Ok((String::from_utf8_lossy(&buf).into_owned(), 4 + u64::from(len)))
    }

    /// Length-prefixed UTF-16 string, transcoded to UTF-8. The XOR mask is
    /// applied per byte before the code units are assembled.
    pub fn read_wide_string(&mut self, xor: u8) -> io::Result<(String, u64)> {
        let len = self.read_u32()?;
        if len >= MAX_STRING_LEN {
            return Ok((String::new(), 4));
        }

        let mut bytes = vec![0u8; len as usize * 2];
        self.fill(&mut bytes)?;
        if xor != 0 {
            for b in &mut bytes {
                *b ^= xor;
            }
        }

        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| {
                let pair = [pair[0], pair[1]];
                if self.big_endian {
                    u16::from_be_bytes(pair)
                } else {
                    u16::from_le_bytes(pair)
                }
            })
            .collect();
        Ok((String::from_utf16_lossy(&units), 4 + u64::from(len) * 2))
    }
}
