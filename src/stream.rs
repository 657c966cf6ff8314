//! Segmented AEAD streams
//!
//! Turns AES-GCM, which authenticates one message at a time, into a cipher
//! for byte streams of any length using the STREAM construction with a
//! big-endian 32-bit counter (`aead::stream::*BE32`).
//!
//! The plaintext is cut into segments of [`SEGMENT_LEN`] bytes. Segment `i`
//! is sealed under the 96-bit AES-GCM nonce
//!
//! ```text
//! nonce (7 bytes) || i as u32 big-endian (4 bytes) || last flag (1 byte)
//! ```
//!
//! where the flag is `0x01` on the final segment and `0x00` otherwise, and
//! no associated data is used. Each sealed segment is the segment ciphertext
//! followed by its 16-byte tag. The final segment may be full or short, and
//! an empty plaintext still yields one (empty) final segment, so dropping,
//! reordering or splicing segments is always caught.
//!
//! Both readers look one byte ahead to learn whether the segment they just
//! read is the last one, which keeps the on-wire format free of length
//! fields.

use std::io::{self, Read, Seek, SeekFrom, Write};

use aead::generic_array::GenericArray;
use aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use tracing::trace;
use zeroize::Zeroize;

use crate::error::{ErrorCategory, ErrorKind, VaultError};
use crate::keys::AeadCipher;

/// Length of the per-vault stream nonce in bytes.
pub const NONCE_LEN: usize = 7;

/// Plaintext bytes per segment.
pub const SEGMENT_LEN: usize = 16 * 1024;

/// Length of the AES-GCM tag appended to every segment.
pub const TAG_LEN: usize = 16;

/// Length of a full sealed segment on the wire.
pub const SEALED_SEGMENT_LEN: usize = SEGMENT_LEN + TAG_LEN;

/// The per-vault nonce prefix.
pub type StreamNonce = [u8; NONCE_LEN];

/// Exact ciphertext length produced for `plaintext_len` bytes of input.
pub fn sealed_len(plaintext_len: u64) -> u64 {
    let segments = if plaintext_len == 0 {
        1
    } else {
        plaintext_len.div_ceil(SEGMENT_LEN as u64)
    };
    plaintext_len + segments * TAG_LEN as u64
}

enum Sealer {
    Aes128(EncryptorBE32<Aes128Gcm>),
    Aes256(EncryptorBE32<Aes256Gcm>),
}

impl Sealer {
    fn new(cipher: &AeadCipher, nonce: &StreamNonce) -> Self {
        match cipher {
            AeadCipher::Aes128(aead) => Sealer::Aes128(EncryptorBE32::from_aead(
                aead.clone(),
                GenericArray::from_slice(&nonce[..]),
            )),
            AeadCipher::Aes256(aead) => Sealer::Aes256(EncryptorBE32::from_aead(
                aead.clone(),
                GenericArray::from_slice(&nonce[..]),
            )),
        }
    }

    fn seal_next(&mut self, segment: &mut Vec<u8>) -> aead::Result<()> {
        match self {
            Sealer::Aes128(stream) => stream.encrypt_next_in_place(&[], segment),
            Sealer::Aes256(stream) => stream.encrypt_next_in_place(&[], segment),
        }
    }

    fn seal_last(self, segment: &mut Vec<u8>) -> aead::Result<()> {
        match self {
            Sealer::Aes128(stream) => stream.encrypt_last_in_place(&[], segment),
            Sealer::Aes256(stream) => stream.encrypt_last_in_place(&[], segment),
        }
    }
}

enum Opener {
    Aes128(DecryptorBE32<Aes128Gcm>),
    Aes256(DecryptorBE32<Aes256Gcm>),
}

impl Opener {
    fn new(cipher: &AeadCipher, nonce: &StreamNonce) -> Self {
        match cipher {
            AeadCipher::Aes128(aead) => Opener::Aes128(DecryptorBE32::from_aead(
                aead.clone(),
                GenericArray::from_slice(&nonce[..]),
            )),
            AeadCipher::Aes256(aead) => Opener::Aes256(DecryptorBE32::from_aead(
                aead.clone(),
                GenericArray::from_slice(&nonce[..]),
            )),
        }
    }

    fn open_next(&mut self, segment: &mut Vec<u8>) -> aead::Result<()> {
        match self {
            Opener::Aes128(stream) => stream.decrypt_next_in_place(&[], segment),
            Opener::Aes256(stream) => stream.decrypt_next_in_place(&[], segment),
        }
    }

    fn open_last(self, segment: &mut Vec<u8>) -> aead::Result<()> {
        match self {
            Opener::Aes128(stream) => stream.decrypt_last_in_place(&[], segment),
            Opener::Aes256(stream) => stream.decrypt_last_in_place(&[], segment),
        }
    }
}

/// Fill `buf` from `reader` until it is full or the reader is exhausted.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Cuts a reader into fixed-size chunks and knows which one is last.
struct Chunker<R> {
    inner: R,
    chunk_len: usize,
    lookahead: Option<u8>,
}

impl<R: Read> Chunker<R> {
    fn new(inner: R, chunk_len: usize) -> Self {
        Self {
            inner,
            chunk_len,
            lookahead: None,
        }
    }

    /// Replaces the contents of `buf` with the next chunk. Returns true when
    /// the chunk is the final one (which may be empty).
    fn next_chunk(&mut self, buf: &mut Vec<u8>) -> io::Result<bool> {
        buf.clear();
        buf.resize(self.chunk_len, 0);

        let mut filled = 0;
        if let Some(byte) = self.lookahead.take() {
            buf[0] = byte;
            filled = 1;
        }
        filled += read_full(&mut self.inner, &mut buf[filled..])?;
        buf.truncate(filled);

        if filled < self.chunk_len {
            return Ok(true);
        }

        let mut probe = [0u8; 1];
        if read_full(&mut self.inner, &mut probe)? == 0 {
            return Ok(true);
        }
        self.lookahead = Some(probe[0]);
        Ok(false)
    }
}

fn counter_exhausted() -> io::Error {
    VaultError::with_kind(
        ErrorCategory::User,
        ErrorKind::InternalInvariant,
        "stream segment counter exhausted; input too large for one vault",
    )
    .into_io()
}

fn stream_aborted() -> io::Error {
    VaultError::with_kind(
        ErrorCategory::Internal,
        ErrorKind::Io,
        "encrypted stream aborted by an earlier error; output is incomplete",
    )
    .into_io()
}

fn authentication_failed(segment: u64) -> io::Error {
    VaultError::with_kind(
        ErrorCategory::User,
        ErrorKind::AuthenticationFailed,
        format!(
            "segment {segment} failed authentication; wrong key, or truncated or tampered-with data"
        ),
    )
    .into_io()
}

/// Pull-model encryption: reading yields the sealed form of `inner`.
///
/// Any error, including one from `inner`, is sticky: the bytes of the
/// segment being built are lost, so carrying on would emit a stream that
/// authenticates but is missing data. Only [`EncryptingReader::rewind`]
/// starts over.
pub struct EncryptingReader<R> {
    chunks: Chunker<R>,
    cipher: AeadCipher,
    nonce: StreamNonce,
    // None once the final segment has been sealed.
    sealer: Option<Sealer>,
    segment: Vec<u8>,
    pos: usize,
    index: u64,
    failed: bool,
}

impl<R: Read> EncryptingReader<R> {
    pub fn new(inner: R, cipher: AeadCipher, nonce: StreamNonce) -> Self {
        let sealer = Sealer::new(&cipher, &nonce);
        Self {
            chunks: Chunker::new(inner, SEGMENT_LEN),
            cipher,
            nonce,
            sealer: Some(sealer),
            segment: Vec::with_capacity(SEALED_SEGMENT_LEN),
            pos: 0,
            index: 0,
            failed: false,
        }
    }

    pub fn nonce(&self) -> &StreamNonce {
        &self.nonce
    }

    pub fn get_ref(&self) -> &R {
        &self.chunks.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.chunks.inner
    }

    fn seal_segment(&mut self) -> io::Result<()> {
        let Some(mut sealer) = self.sealer.take() else {
            return Ok(());
        };
        let last = match self.chunks.next_chunk(&mut self.segment) {
            Ok(last) => last,
            Err(e) => {
                self.segment.zeroize();
                self.pos = 0;
                self.failed = true;
                return Err(e);
            }
        };
        let plain_len = self.segment.len();

        let sealed = if last {
            sealer.seal_last(&mut self.segment)
        } else {
            let result = sealer.seal_next(&mut self.segment);
            self.sealer = Some(sealer);
            result
        };
        if sealed.is_err() {
            self.segment.zeroize();
            self.pos = 0;
            self.sealer = None;
            self.failed = true;
            return Err(counter_exhausted());
        }

        trace!(segment = self.index, plain_len, last, "sealed segment");
        self.index += 1;
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read + Seek> EncryptingReader<R> {
    /// Seek the source back to its start and restart the segment counter.
    ///
    /// The same plaintext under the same key and nonce seals to the same
    /// bytes, so re-reading does not reuse a nonce on different data.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.chunks.inner.seek(SeekFrom::Start(0))?;
        self.chunks.lookahead = None;
        self.sealer = Some(Sealer::new(&self.cipher, &self.nonce));
        self.segment.clear();
        self.pos = 0;
        self.index = 0;
        self.failed = false;
        Ok(())
    }
}

impl<R: Read> Read for EncryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.failed {
            return Err(stream_aborted());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.segment.len() {
            if self.sealer.is_none() {
                return Ok(0);
            }
            self.seal_segment()?;
        }
        let n = buf.len().min(self.segment.len() - self.pos);
        buf[..n].copy_from_slice(&self.segment[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Push-model encryption: bytes written are sealed into `inner`.
///
/// A segment is only sealed once it is known not to be the last, so
/// [`EncryptingWriter::finish`] must be called to emit the final segment.
/// Dropping the writer without finishing leaves a stream that will fail
/// authentication. As with [`EncryptingReader`], the first error is sticky.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    sealer: Sealer,
    pending: Vec<u8>,
    index: u64,
    failed: bool,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn new(inner: W, cipher: &AeadCipher, nonce: &StreamNonce) -> Self {
        Self {
            inner,
            sealer: Sealer::new(cipher, nonce),
            pending: Vec::with_capacity(2 * SEGMENT_LEN),
            index: 0,
            failed: false,
        }
    }

    /// Seal the final segment, flush, and hand back the sink.
    pub fn finish(mut self) -> io::Result<W> {
        if self.failed {
            return Err(stream_aborted());
        }
        let mut segment = std::mem::take(&mut self.pending);
        let plain_len = segment.len();
        self.sealer
            .seal_last(&mut segment)
            .map_err(|_| counter_exhausted())?;
        trace!(segment = self.index, plain_len, last = true, "sealed segment");
        self.inner.write_all(&segment)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failed {
            return Err(stream_aborted());
        }
        // `pending` never holds more than one segment between calls.
        let room = 2 * SEGMENT_LEN - self.pending.len();
        let n = buf.len().min(room);
        self.pending.extend_from_slice(&buf[..n]);

        while self.pending.len() > SEGMENT_LEN {
            let mut segment: Vec<u8> = self.pending.drain(..SEGMENT_LEN).collect();
            if self.sealer.seal_next(&mut segment).is_err() {
                segment.zeroize();
                self.failed = true;
                return Err(counter_exhausted());
            }
            trace!(segment = self.index, plain_len = SEGMENT_LEN, last = false, "sealed segment");
            self.index += 1;
            if let Err(e) = self.inner.write_all(&segment) {
                self.failed = true;
                return Err(e);
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Pull-model decryption of a stream produced by [`EncryptingReader`] or
/// [`EncryptingWriter`].
///
/// A segment is released only after its tag verifies. The first failure is
/// sticky: the failing segment's bytes are wiped and every later read
/// returns the same authentication error.
pub struct DecryptingReader<R> {
    chunks: Chunker<R>,
    opener: Option<Opener>,
    segment: Vec<u8>,
    pos: usize,
    index: u64,
    failed: bool,
}

impl<R: Read> DecryptingReader<R> {
    pub fn new(inner: R, cipher: &AeadCipher, nonce: &StreamNonce) -> Self {
        Self {
            chunks: Chunker::new(inner, SEALED_SEGMENT_LEN),
            opener: Some(Opener::new(cipher, nonce)),
            segment: Vec::with_capacity(SEALED_SEGMENT_LEN),
            pos: 0,
            index: 0,
            failed: false,
        }
    }

    fn open_segment(&mut self) -> io::Result<()> {
        let last = match self.chunks.next_chunk(&mut self.segment) {
            Ok(last) => last,
            Err(e) => {
                self.segment.clear();
                self.pos = 0;
                return Err(e);
            }
        };
        let sealed_len = self.segment.len();

        let opened = match self.opener.take() {
            Some(opener) if last => opener.open_last(&mut self.segment),
            Some(mut opener) => {
                let result = opener.open_next(&mut self.segment);
                self.opener = Some(opener);
                result
            }
            None => return Ok(()),
        };

        if opened.is_err() {
            self.segment.zeroize();
            self.pos = 0;
            self.opener = None;
            self.failed = true;
            return Err(authentication_failed(self.index));
        }

        trace!(segment = self.index, sealed_len, last, "opened segment");
        self.index += 1;
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.failed {
            return Err(authentication_failed(self.index));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        // Opened segments can be empty, so keep going until there is data
        // or the final segment has been consumed.
        while self.pos == self.segment.len() {
            if self.opener.is_none() {
                return Ok(0);
            }
            self.open_segment()?;
        }
        let n = buf.len().min(self.segment.len() - self.pos);
        buf[..n].copy_from_slice(&self.segment[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
