//! Chunked AES-256-GCM stream wrappers.
//!
//! The encryptor reads plaintext, emits the fixed header once, then one
//! authenticated frame per chunk. The decryptor consumes frames and fails
//! hard on the first bad tag. The chunk index and a final-chunk flag are
//! bound into the associated data, so chunks cannot be reordered and the
//! stream cannot be silently truncated.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use super::{Header, CHUNK_SIZE, NONCE_LEN, TAG_LEN};
use crate::crypto::keys::KEY_LEN;

/// Per-chunk nonce: the header nonce with the chunk index folded into the
/// trailing eight bytes.
fn chunk_nonce(base: &[u8; NONCE_LEN], index: u64) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    let ctr = index.to_be_bytes();
    for (n, c) in nonce[4..].iter_mut().zip(ctr.iter()) {
        *n ^= c;
    }
    nonce
}

/// Associated data: chunk index plus final-chunk flag.
fn chunk_aad(index: u64, is_final: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = is_final as u8;
    aad
}

fn crypto_err(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("encryption: {}", msg))
}

/// Encrypting AsyncRead stage. Output: header, then framed ciphertext.
pub struct EncryptingReader<R> {
    inner: R,
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_LEN],
    chunk_index: u64,
    plain: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    inner_eof: bool,
    finished: bool,
}

impl<R: AsyncRead + Unpin> EncryptingReader<R> {
    pub fn new(inner: R, key: &[u8; KEY_LEN], header: Header) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Self {
            inner,
            cipher,
            base_nonce: header.nonce,
            chunk_index: 0,
            plain: Vec::with_capacity(CHUNK_SIZE),
            out: header.encode().to_vec(),
            out_pos: 0,
            inner_eof: false,
            finished: false,
        }
    }

    fn encrypt_chunk(&mut self, is_final: bool) -> io::Result<()> {
        let nonce = chunk_nonce(&self.base_nonce, self.chunk_index);
        let aad = chunk_aad(self.chunk_index, is_final);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &self.plain,
                    aad: &aad,
                },
            )
            .map_err(|_| crypto_err("chunk encryption failed"))?;
        self.chunk_index += 1;
        self.plain.clear();

        self.out.clear();
        self.out_pos = 0;
        self.out
            .extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        self.out.extend_from_slice(&ciphertext);
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EncryptingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            // Drain pending output first.
            if self.out_pos < self.out.len() {
                let n = buf.remaining().min(self.out.len() - self.out_pos);
                let start = self.out_pos;
                buf.put_slice(&self.out[start..start + n]);
                self.out_pos += n;
                return Poll::Ready(Ok(()));
            }
            if self.finished {
                return Poll::Ready(Ok(()));
            }

            // Fill the plaintext chunk buffer.
            while !self.inner_eof && self.plain.len() < CHUNK_SIZE {
                let mut tmp = [0u8; 64 * 1024];
                let want = tmp.len().min(CHUNK_SIZE - self.plain.len());
                let mut tmp_buf = ReadBuf::new(&mut tmp[..want]);
                match Pin::new(&mut self.inner).poll_read(cx, &mut tmp_buf) {
                    Poll::Ready(Ok(())) => {
                        let filled = tmp_buf.filled();
                        if filled.is_empty() {
                            self.inner_eof = true;
                        } else {
                            let filled = filled.to_vec();
                            self.plain.extend_from_slice(&filled);
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            let is_final = self.inner_eof;
            self.encrypt_chunk(is_final)?;
            if is_final {
                self.finished = true;
            }
        }
    }
}

/// Decrypting AsyncRead stage. The caller has already consumed and parsed
/// the header; this stage sees only framed ciphertext.
pub struct DecryptingReader<R> {
    inner: R,
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_LEN],
    chunk_index: u64,
    in_buf: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    inner_eof: bool,
    saw_final: bool,
}

impl<R: AsyncRead + Unpin> DecryptingReader<R> {
    pub fn new(inner: R, key: &[u8; KEY_LEN], header: &Header) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Self {
            inner,
            cipher,
            base_nonce: header.nonce,
            chunk_index: 0,
            in_buf: Vec::new(),
            out: Vec::new(),
            out_pos: 0,
            inner_eof: false,
            saw_final: false,
        }
    }

    /// Length of the frame at the head of `in_buf`, if fully buffered.
    fn buffered_frame_len(&self) -> io::Result<Option<usize>> {
        if self.in_buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.in_buf[0], self.in_buf[1], self.in_buf[2], self.in_buf[3]])
            as usize;
        if len < TAG_LEN || len > CHUNK_SIZE + TAG_LEN {
            return Err(crypto_err("invalid frame length"));
        }
        if self.in_buf.len() < 4 + len {
            return Ok(None);
        }
        Ok(Some(len))
    }

    fn decrypt_frame(&mut self, len: usize) -> io::Result<()> {
        if self.saw_final {
            return Err(crypto_err("data after final chunk"));
        }
        let frame = &self.in_buf[4..4 + len];
        let nonce = chunk_nonce(&self.base_nonce, self.chunk_index);

        // The final flag is part of the AAD, not the frame, so try the
        // non-final AAD first and the final AAD second; exactly one can
        // authenticate.
        let plain = {
            let attempt = |is_final: bool| {
                self.cipher.decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: frame,
                        aad: &chunk_aad(self.chunk_index, is_final),
                    },
                )
            };
            match attempt(false) {
                Ok(p) => (p, false),
                Err(_) => match attempt(true) {
                    Ok(p) => (p, true),
                    Err(_) => return Err(crypto_err("authentication tag mismatch")),
                },
            }
        };

        let (plain, is_final) = plain;
        self.saw_final = is_final;
        self.chunk_index += 1;
        self.in_buf.drain(..4 + len);
        self.out = plain;
        self.out_pos = 0;
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.out_pos < self.out.len() {
                let n = buf.remaining().min(self.out.len() - self.out_pos);
                let start = self.out_pos;
                buf.put_slice(&self.out[start..start + n]);
                self.out_pos += n;
                return Poll::Ready(Ok(()));
            }

            if let Some(len) = self.buffered_frame_len()? {
                self.decrypt_frame(len)?;
                continue;
            }

            if self.inner_eof {
                if !self.in_buf.is_empty() {
                    return Poll::Ready(Err(crypto_err("truncated frame")));
                }
                if !self.saw_final {
                    return Poll::Ready(Err(crypto_err("stream ended before final chunk")));
                }
                return Poll::Ready(Ok(()));
            }

            let mut tmp = [0u8; 64 * 1024];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut self.inner).poll_read(cx, &mut tmp_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = tmp_buf.filled();
                    if filled.is_empty() {
                        self.inner_eof = true;
                    } else {
                        let filled = filled.to_vec();
                        self.in_buf.extend_from_slice(&filled);
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{is_encrypted, Header, HEADER_LEN, SALT_LEN};
    use tokio::io::AsyncReadExt;

    fn test_header() -> Header {
        Header::new([5u8; NONCE_LEN], [0u8; SALT_LEN])
    }

    async fn encrypt_all(data: &[u8], key: &[u8; KEY_LEN]) -> Vec<u8> {
        let mut enc = EncryptingReader::new(data, key, test_header());
        let mut out = Vec::new();
        enc.read_to_end(&mut out).await.unwrap();
        out
    }

    async fn decrypt_all(data: &[u8], key: &[u8; KEY_LEN]) -> io::Result<Vec<u8>> {
        let header = Header::parse(&data[..HEADER_LEN]).unwrap();
        let mut dec = DecryptingReader::new(&data[HEADER_LEN..], key, &header);
        let mut out = Vec::new();
        dec.read_to_end(&mut out).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_round_trip_small() {
        // The canonical plaintext: 63 bytes of ASCII.
        let plain: Vec<u8> = b"TEST BACKUP DATA - UNENCRYPTED\n"
            .iter()
            .chain(b"TEST BACKUP DATA - UNENCRYPTED\n ".iter())
            .copied()
            .collect();
        let key = [0x2au8; KEY_LEN];

        let encrypted = encrypt_all(&plain, &key).await;
        assert!(is_encrypted(&encrypted));
        assert_eq!(decrypt_all(&encrypted, &key).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn test_round_trip_multi_chunk() {
        // Spans several chunks with a non-aligned tail.
        let plain: Vec<u8> = (0..(2 * CHUNK_SIZE + 12345))
            .map(|i| (i % 253) as u8)
            .collect();
        let key = [0x11u8; KEY_LEN];

        let encrypted = encrypt_all(&plain, &key).await;
        assert_eq!(decrypt_all(&encrypted, &key).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn test_round_trip_exact_chunk_boundary() {
        let plain = vec![9u8; CHUNK_SIZE];
        let key = [3u8; KEY_LEN];
        let encrypted = encrypt_all(&plain, &key).await;
        assert_eq!(decrypt_all(&encrypted, &key).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn test_round_trip_empty() {
        let key = [1u8; KEY_LEN];
        let encrypted = encrypt_all(&[], &key).await;
        assert_eq!(decrypt_all(&encrypted, &key).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_wrong_key_fails_authentication() {
        let plain = b"sensitive dump".to_vec();
        let encrypted = encrypt_all(&plain, &[7u8; KEY_LEN]).await;
        let err = decrypt_all(&encrypted, &[8u8; KEY_LEN]).await.unwrap_err();
        assert!(err.to_string().contains("authentication"));
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_is_rejected() {
        let plain = vec![0x5au8; 4096];
        let key = [6u8; KEY_LEN];
        let mut encrypted = encrypt_all(&plain, &key).await;
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(decrypt_all(&encrypted, &key).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_rejected() {
        let plain = vec![0x5au8; CHUNK_SIZE + 100];
        let key = [6u8; KEY_LEN];
        let encrypted = encrypt_all(&plain, &key).await;

        // Drop the entire final frame: every remaining tag still verifies,
        // but the final-chunk flag never appears.
        let first_frame_len = u32::from_be_bytes([
            encrypted[HEADER_LEN],
            encrypted[HEADER_LEN + 1],
            encrypted[HEADER_LEN + 2],
            encrypted[HEADER_LEN + 3],
        ]) as usize;
        let cut = HEADER_LEN + 4 + first_frame_len;
        let err = decrypt_all(&encrypted[..cut], &key).await.unwrap_err();
        assert!(err.to_string().contains("final chunk"));
    }

    #[tokio::test]
    async fn test_reordered_chunks_are_rejected() {
        let plain = vec![0xc3u8; 2 * CHUNK_SIZE];
        let key = [4u8; KEY_LEN];
        let encrypted = encrypt_all(&plain, &key).await;

        // Swap the first two frames; the chunk index in the AAD no longer
        // matches.
        let f1_len = u32::from_be_bytes([
            encrypted[HEADER_LEN],
            encrypted[HEADER_LEN + 1],
            encrypted[HEADER_LEN + 2],
            encrypted[HEADER_LEN + 3],
        ]) as usize;
        let f1_end = HEADER_LEN + 4 + f1_len;
        let f2_len = u32::from_be_bytes([
            encrypted[f1_end],
            encrypted[f1_end + 1],
            encrypted[f1_end + 2],
            encrypted[f1_end + 3],
        ]) as usize;
        let f2_end = f1_end + 4 + f2_len;

        let mut swapped = encrypted[..HEADER_LEN].to_vec();
        swapped.extend_from_slice(&encrypted[f1_end..f2_end]);
        swapped.extend_from_slice(&encrypted[HEADER_LEN..f1_end]);
        swapped.extend_from_slice(&encrypted[f2_end..]);

        assert!(decrypt_all(&swapped, &key).await.is_err());
    }
}
