//! Header block compression
//!
//! Name/value blocks travel as zlib streams primed with a fixed dictionary. Each direction of
//! a tunnel keeps one context for its whole lifetime, so blocks must pass through it in wire
//! order.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::frame::FrameError;

/// Upper bound on an inflated header block
pub const MAX_HEADER_BLOCK: usize = 256 * 1024;

/// Dictionary both peers prime their zlib contexts with
pub const HEADER_DICTIONARY: &[u8] = b"\x00\x00\x00\x07options\x00\x00\x00\x04head\x00\x00\x00\x04post\
    \x00\x00\x00\x03put\x00\x00\x00\x06delete\x00\x00\x00\x05trace\
    \x00\x00\x00\x06accept\x00\x00\x00\x0eaccept-charset\
    \x00\x00\x00\x0faccept-encoding\x00\x00\x00\x0faccept-language\
    \x00\x00\x00\x0daccept-ranges\x00\x00\x00\x03age\x00\x00\x00\x05allow\
    \x00\x00\x00\x0dauthorization\x00\x00\x00\x0dcache-control\
    \x00\x00\x00\x0aconnection\x00\x00\x00\x0ccontent-base\
    \x00\x00\x00\x10content-encoding\x00\x00\x00\x10content-language\
    \x00\x00\x00\x0econtent-length\x00\x00\x00\x10content-location\
    \x00\x00\x00\x0bcontent-md5\x00\x00\x00\x0dcontent-range\
    \x00\x00\x00\x0ccontent-type\x00\x00\x00\x04date\x00\x00\x00\x04etag\
    \x00\x00\x00\x06expect\x00\x00\x00\x07expires\x00\x00\x00\x04from\
    \x00\x00\x00\x04host\x00\x00\x00\x08if-match\x00\x00\x00\x11if-modified-since\
    \x00\x00\x00\x0dif-none-match\x00\x00\x00\x08if-range\
    \x00\x00\x00\x13if-unmodified-since\x00\x00\x00\x0dlast-modified\
    \x00\x00\x00\x08location\x00\x00\x00\x0cmax-forwards\x00\x00\x00\x06pragma\
    \x00\x00\x00\x12proxy-authenticate\x00\x00\x00\x13proxy-authorization\
    \x00\x00\x00\x05range\x00\x00\x00\x07referer\x00\x00\x00\x0bretry-after\
    \x00\x00\x00\x06server\x00\x00\x00\x02te\x00\x00\x00\x07trailer\
    \x00\x00\x00\x11transfer-encoding\x00\x00\x00\x07upgrade\
    \x00\x00\x00\x0auser-agent\x00\x00\x00\x04vary\x00\x00\x00\x03via\
    \x00\x00\x00\x07warning\x00\x00\x00\x10www-authenticate\x00\x00\x00\x06method\
    \x00\x00\x00\x03get\x00\x00\x00\x06status\x00\x00\x00\x06200 OK\
    \x00\x00\x00\x07version\x00\x00\x00\x08HTTP/1.1\x00\x00\x00\x03url\
    \x00\x00\x00\x06public\x00\x00\x00\x0aset-cookie\x00\x00\x00\x0akeep-alive\
    \x00\x00\x00\x06origin\
    10010120120220520630030230330430530630740240540640740840941041141241341441541641\
    7502504505203 Non-Authoritative Information204 No Content301 Moved Permanently40\
    0 Bad Request401 Unauthorized403 Forbidden404 Not Found500 Internal Server Error\
    501 Not Implemented503 Service UnavailableJan Feb Mar Apr May Jun Jul Aug Sept O\
    ct Nov Dec 00:00:00 Mon, Tue, Wed, Thu, Fri, Sat, Sun, GMTchunked,text/html,imag\
    e/png,image/jpg,image/gif,application/xml,application/xhtml+xml,text/plain,text/\
    javascript,publicprivatemax-age=gzip,deflate,sdchcharset=utf-8charset=iso-8859-1\
    ,utf-,*,enq=0.";

fn compression_error(err: impl std::fmt::Display) -> FrameError {
    FrameError::Compression(err.to_string())
}

/// Compression context for outgoing header blocks
#[derive(Debug)]
pub struct HeaderDeflater {
    compress: Compress,
    primed: bool,
}

impl Default for HeaderDeflater {
    fn default() -> Self {
        Self {
            compress: Compress::new(Compression::default(), true),
            primed: false,
        }
    }
}

impl HeaderDeflater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compress one block and sync-flush it so the peer can inflate it without waiting
    pub fn deflate(&mut self, block: &[u8]) -> Result<Vec<u8>, FrameError> {
        if !self.primed {
            self.compress
                .set_dictionary(HEADER_DICTIONARY)
                .map_err(compression_error)?;
            self.primed = true;
        }

        let start = self.compress.total_in();
        let mut out = Vec::with_capacity(block.len() / 2 + 64);
        loop {
            let consumed = (self.compress.total_in() - start) as usize;
            self.compress
                .compress_vec(&block[consumed..], &mut out, FlushCompress::Sync)
                .map_err(compression_error)?;

            let consumed = (self.compress.total_in() - start) as usize;
            if consumed == block.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(out.capacity().max(64));
        }
    }
}

/// Decompression context for incoming header blocks
#[derive(Debug)]
pub struct HeaderInflater {
    decompress: Decompress,
}

impl Default for HeaderInflater {
    fn default() -> Self {
        Self {
            decompress: Decompress::new(true),
        }
    }
}

impl HeaderInflater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inflate one sync-flushed block; the dictionary is supplied when the stream asks for it
    pub fn inflate(&mut self, block: &[u8]) -> Result<Vec<u8>, FrameError> {
        let start = self.decompress.total_in();
        let mut out = Vec::with_capacity((block.len() * 4).max(256));
        loop {
            let consumed = (self.decompress.total_in() - start) as usize;
            let produced = out.len();

            let status = match self.decompress.decompress_vec(
                &block[consumed..],
                &mut out,
                FlushDecompress::Sync,
            ) {
                Ok(status) => status,
                Err(e) if e.needs_dictionary().is_some() => {
                    self.decompress
                        .set_dictionary(HEADER_DICTIONARY)
                        .map_err(compression_error)?;
                    continue;
                }
                Err(e) => return Err(compression_error(e)),
            };

            let now_consumed = (self.decompress.total_in() - start) as usize;
            if status == Status::StreamEnd
                || (now_consumed == block.len() && out.len() < out.capacity())
            {
                return Ok(out);
            }
            if out.len() > MAX_HEADER_BLOCK {
                return Err(FrameError::TooLarge(out.len()));
            }
            if now_consumed == consumed && out.len() == produced && out.len() < out.capacity() {
                return Err(FrameError::Compression(
                    "header block ended mid-stream".to_string(),
                ));
            }
            out.reserve(out.capacity());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two consecutive SYN_REPLY header blocks from one zlib context primed with the dictionary
    const FIRST_BLOCK: &[u8] = &[
        0x78, 0xbb, 0xe3, 0xc6, 0xa7, 0xc2, 0x02, 0xe5, 0x0e, 0x50, 0x7a, 0xb4, 0xc2, 0x92,
        0x48, 0x39, 0xac, 0xb0, 0xa4, 0x52, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff,
    ];
    const SECOND_BLOCK: &[u8] = &[
        0xc2, 0xd4, 0x20, 0x60, 0x0c, 0x8d, 0x37, 0x5f, 0xa4, 0x1c, 0x8f, 0x4d, 0x2b, 0x00,
        0x00, 0x00, 0xff, 0xff,
    ];

    fn plain_block(headers: &[(&str, &str)]) -> Vec<u8> {
        let mut out = (headers.len() as u32).to_be_bytes().to_vec();
        for (name, value) in headers {
            out.extend_from_slice(&(name.len() as u32).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(value.len() as u32).to_be_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        out
    }

    #[test]
    fn test_dictionary_shape() {
        assert_eq!(HEADER_DICTIONARY.len(), 1423);
        assert_eq!(&HEADER_DICTIONARY[..11], b"\x00\x00\x00\x07options");
        assert!(HEADER_DICTIONARY.ends_with(b",*,enq=0."));
    }

    #[test]
    fn test_inflates_known_blocks_in_one_context() {
        let mut inflater = HeaderInflater::new();

        assert_eq!(
            inflater.inflate(FIRST_BLOCK).unwrap(),
            plain_block(&[(":status", "200 OK"), (":version", "HTTP/1.1")])
        );
        assert_eq!(
            inflater.inflate(SECOND_BLOCK).unwrap(),
            plain_block(&[(":status", "304 Not Modified"), (":version", "HTTP/1.1")])
        );
    }

    #[test]
    fn test_continuation_block_needs_shared_context() {
        let mut fresh = HeaderInflater::new();
        assert!(fresh.inflate(SECOND_BLOCK).is_err());
    }

    #[test]
    fn test_deflate_emits_dictionary_stream() {
        let mut deflater = HeaderDeflater::new();
        let block = plain_block(&[(":method", "GET"), (":path", "/")]);
        let first = deflater.deflate(&block).unwrap();

        // zlib header with FDICT set, then the dictionary's adler32
        assert_eq!(first[0], 0x78);
        assert_ne!(first[1] & 0x20, 0);
        assert_eq!(&first[2..6], &[0xe3, 0xc6, 0xa7, 0xc2]);
        assert!(first.ends_with(&[0x00, 0x00, 0xff, 0xff]));
        assert!(!first.windows(7).any(|w| w == b":method"));

        // The repeat leans on the shared window instead of starting a new stream
        let second = deflater.deflate(&block).unwrap();
        assert!(second.len() < first.len());

        let mut inflater = HeaderInflater::new();
        assert_eq!(inflater.inflate(&first).unwrap(), block);
        assert_eq!(inflater.inflate(&second).unwrap(), block);
    }

    #[test]
    fn test_rejects_garbage() {
        let mut inflater = HeaderInflater::new();
        assert!(matches!(
            inflater.inflate(&[0x00, 0x00, 0x00, 0x01, 0x00]),
            Err(FrameError::Compression(_))
        ));
    }
}
