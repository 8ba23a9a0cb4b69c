// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! On-disk page framing.
//!
//! A spill file is a sequence of self-delimiting frames:
//!
//! ```text
//! frame := marker(u8) | row_count(u32 LE) | uncompressed_len(u32 LE)
//!          | payload_len(u32 LE) | payload
//! ```
//!
//! The payload is the Arrow IPC stream encoding of one page, optionally
//! lz4-compressed and then optionally AEAD-sealed (random nonce
//! prepended). The marker byte records which of the two transforms were
//! applied, so a reader needs nothing beyond the page schema and, for
//! encrypted files, the writer's ephemeral key.

use std::io::{Cursor, Read, Write};

use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

use floe_common::{FloeError, Result};

/// Frame marker bit: payload is lz4-compressed.
pub const MARKER_COMPRESSED: u8 = 1 << 0;
/// Frame marker bit: payload is AEAD-sealed.
pub const MARKER_ENCRYPTED: u8 = 1 << 1;

const MARKER_MASK: u8 = MARKER_COMPRESSED | MARKER_ENCRYPTED;

/// marker + row count + uncompressed length + payload length
pub const FRAME_HEADER_LEN: usize = 13;

const NONCE_LEN: usize = 12;

/// Page codec bound to one spiller: fixed transform configuration and,
/// when encrypting, an ephemeral key that lives exactly as long as the
/// spill file it protects.
pub struct PageSerde {
    compression: bool,
    cipher: Option<ChaCha20Poly1305>,
}

struct EncodedFrame {
    marker: u8,
    row_count: u32,
    uncompressed_len: u32,
    payload: Vec<u8>,
}

impl PageSerde {
    pub fn new(compression: bool, encryption: bool) -> Self {
        let cipher = encryption.then(|| {
            let key = ChaCha20Poly1305::generate_key(&mut OsRng);
            ChaCha20Poly1305::new(&key)
        });
        Self {
            compression,
            cipher,
        }
    }

    /// Append one framed page to `out`, returning the frame's size in
    /// bytes. `direct` skips the intermediate whole-frame staging
    /// buffer; output is identical either way.
    pub fn write_page<W: Write>(
        &self,
        out: &mut W,
        page: &RecordBatch,
        direct: bool,
    ) -> Result<u64> {
        let frame = self.encode_frame(page)?;
        let payload_len = u32::try_from(frame.payload.len()).map_err(|_| {
            FloeError::Internal(format!(
                "encoded page of {} bytes exceeds the frame size limit",
                frame.payload.len()
            ))
        })?;
        if direct {
            out.write_all(&[frame.marker])?;
            out.write_all(&frame.row_count.to_le_bytes())?;
            out.write_all(&frame.uncompressed_len.to_le_bytes())?;
            out.write_all(&payload_len.to_le_bytes())?;
            out.write_all(&frame.payload)?;
        } else {
            let mut staged = Vec::with_capacity(FRAME_HEADER_LEN + frame.payload.len());
            staged.push(frame.marker);
            staged.extend_from_slice(&frame.row_count.to_le_bytes());
            staged.extend_from_slice(&frame.uncompressed_len.to_le_bytes());
            staged.extend_from_slice(&payload_len.to_le_bytes());
            staged.extend_from_slice(&frame.payload);
            out.write_all(&staged)?;
        }
        Ok((FRAME_HEADER_LEN + frame.payload.len()) as u64)
    }

    /// Decode the next frame from `input`. Returns `Ok(None)` at a clean
    /// end of stream; anything structurally inconsistent is
    /// [`FloeError::SpillCorruption`].
    pub fn read_page<R: Read>(
        &self,
        input: &mut R,
        schema: &SchemaRef,
    ) -> Result<Option<RecordBatch>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if !read_frame_header(input, &mut header)? {
            return Ok(None);
        }
        let marker = header[0];
        if marker & !MARKER_MASK != 0 {
            return Err(FloeError::SpillCorruption(format!(
                "unknown page codec marker bits {marker:#04x}"
            )));
        }
        let row_count = u32::from_le_bytes(header[1..5].try_into().unwrap());
        let uncompressed_len = u32::from_le_bytes(header[5..9].try_into().unwrap()) as usize;
        let payload_len = u32::from_le_bytes(header[9..13].try_into().unwrap()) as usize;

        let mut payload = vec![0u8; payload_len];
        input.read_exact(&mut payload).map_err(|e| {
            FloeError::SpillCorruption(format!("truncated page payload: {e}"))
        })?;

        if marker & MARKER_ENCRYPTED != 0 {
            let Some(cipher) = &self.cipher else {
                return Err(FloeError::SpillCorruption(
                    "page is marked encrypted but the spiller holds no key".to_string(),
                ));
            };
            if payload.len() < NONCE_LEN {
                return Err(FloeError::SpillCorruption(
                    "encrypted page is shorter than its nonce".to_string(),
                ));
            }
            let (nonce, sealed) = payload.split_at(NONCE_LEN);
            payload = cipher
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|_| {
                    FloeError::SpillCorruption(
                        "page failed authenticated decryption".to_string(),
                    )
                })?;
        }

        if marker & MARKER_COMPRESSED != 0 {
            payload = lz4_flex::block::decompress_size_prepended(&payload).map_err(|e| {
                FloeError::SpillCorruption(format!("page failed decompression: {e}"))
            })?;
        }

        if payload.len() != uncompressed_len {
            return Err(FloeError::SpillCorruption(format!(
                "page length mismatch: header says {uncompressed_len} bytes, decoded {}",
                payload.len()
            )));
        }

        let page = decode_ipc(&payload)?;
        if page.num_rows() != row_count as usize {
            return Err(FloeError::SpillCorruption(format!(
                "page row count mismatch: header says {row_count}, decoded {}",
                page.num_rows()
            )));
        }
        if page.schema().as_ref() != schema.as_ref() {
            return Err(FloeError::SpillCorruption(
                "page schema does not match the spiller schema".to_string(),
            ));
        }
        Ok(Some(page))
    }

    fn encode_frame(&self, page: &RecordBatch) -> Result<EncodedFrame> {
        let ipc = encode_ipc(page)?;
        let uncompressed_len = u32::try_from(ipc.len()).map_err(|_| {
            FloeError::Internal(format!(
                "encoded page of {} bytes exceeds the frame size limit",
                ipc.len()
            ))
        })?;
        let row_count = u32::try_from(page.num_rows()).map_err(|_| {
            FloeError::Internal(format!(
                "page of {} rows exceeds the frame row limit",
                page.num_rows()
            ))
        })?;

        let mut marker = 0u8;
        let mut payload = ipc;
        if self.compression {
            payload = lz4_flex::block::compress_prepend_size(&payload);
            marker |= MARKER_COMPRESSED;
        }
        if let Some(cipher) = &self.cipher {
            let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
            let sealed = cipher.encrypt(&nonce, payload.as_slice()).map_err(|_| {
                FloeError::Internal("page encryption failed".to_string())
            })?;
            let mut framed = Vec::with_capacity(NONCE_LEN + sealed.len());
            framed.extend_from_slice(&nonce);
            framed.extend_from_slice(&sealed);
            payload = framed;
            marker |= MARKER_ENCRYPTED;
        }

        Ok(EncodedFrame {
            marker,
            row_count,
            uncompressed_len,
            payload,
        })
    }
}

impl std::fmt::Debug for PageSerde {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSerde")
            .field("compression", &self.compression)
            .field("encryption", &self.cipher.is_some())
            .finish()
    }
}

/// Returns `Ok(false)` on a clean end of stream, errors on a frame cut
/// off mid-header.
fn read_frame_header<R: Read>(
    input: &mut R,
    header: &mut [u8; FRAME_HEADER_LEN],
) -> Result<bool> {
    if input.read(&mut header[..1])? == 0 {
        return Ok(false);
    }
    input.read_exact(&mut header[1..]).map_err(|e| {
        FloeError::SpillCorruption(format!("truncated page header: {e}"))
    })?;
    Ok(true)
}

fn encode_ipc(page: &RecordBatch) -> Result<Vec<u8>> {
    let mut writer = StreamWriter::try_new(Vec::new(), page.schema().as_ref())?;
    writer.write(page)?;
    writer.finish()?;
    Ok(writer.into_inner()?)
}

fn decode_ipc(bytes: &[u8]) -> Result<RecordBatch> {
    let mut reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| FloeError::SpillCorruption(format!("invalid page encoding: {e}")))?;
    reader
        .next()
        .transpose()
        .map_err(|e| FloeError::SpillCorruption(format!("invalid page encoding: {e}")))?
        .ok_or_else(|| {
            FloeError::SpillCorruption("page frame contains no batch".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{BinaryArray, Float64Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn test_page() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("score", DataType::Float64, false),
            Field::new("blob", DataType::Binary, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![42, 45, 45, 45])),
                Arc::new(Float64Array::from(vec![43.0, 43.0, 43.0, 43.0])),
                Arc::new(BinaryArray::from_opt_vec(vec![
                    Some(b"alpha".as_ref()),
                    None,
                    Some(b"".as_ref()),
                    Some(b"gamma-delta".as_ref()),
                ])),
            ],
        )
        .unwrap()
    }

    fn roundtrip(compression: bool, encryption: bool, direct: bool) {
        let serde = PageSerde::new(compression, encryption);
        let page = test_page();
        let schema = page.schema();

        let mut file = Vec::new();
        serde.write_page(&mut file, &page, direct).unwrap();
        serde.write_page(&mut file, &page, direct).unwrap();

        let expected_marker = (compression as u8 * MARKER_COMPRESSED)
            | (encryption as u8 * MARKER_ENCRYPTED);
        assert_eq!(file[0], expected_marker);

        let mut cursor = Cursor::new(file.as_slice());
        let first = serde.read_page(&mut cursor, &schema).unwrap().unwrap();
        let second = serde.read_page(&mut cursor, &schema).unwrap().unwrap();
        assert_eq!(first, page);
        assert_eq!(second, page);
        assert!(serde.read_page(&mut cursor, &schema).unwrap().is_none());
    }

    #[test]
    fn roundtrip_all_codec_combinations() {
        for compression in [false, true] {
            for encryption in [false, true] {
                for direct in [false, true] {
                    roundtrip(compression, encryption, direct);
                }
            }
        }
    }

    #[test]
    fn unknown_marker_bits_are_corruption() {
        let serde = PageSerde::new(false, false);
        let page = test_page();
        let schema = page.schema();

        let mut file = Vec::new();
        serde.write_page(&mut file, &page, false).unwrap();
        file[0] |= 0x80;

        let err = serde
            .read_page(&mut Cursor::new(file.as_slice()), &schema)
            .unwrap_err();
        assert!(matches!(err, FloeError::SpillCorruption(_)), "{err}");
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let serde = PageSerde::new(false, false);
        let page = test_page();
        let schema = page.schema();

        let mut file = Vec::new();
        serde.write_page(&mut file, &page, false).unwrap();
        file.truncate(file.len() - 7);

        let err = serde
            .read_page(&mut Cursor::new(file.as_slice()), &schema)
            .unwrap_err();
        assert!(matches!(err, FloeError::SpillCorruption(_)), "{err}");
    }

    #[test]
    fn truncated_header_is_corruption() {
        let serde = PageSerde::new(false, false);
        let page = test_page();
        let schema = page.schema();

        let mut file = Vec::new();
        serde.write_page(&mut file, &page, false).unwrap();
        file.truncate(FRAME_HEADER_LEN - 4);

        let err = serde
            .read_page(&mut Cursor::new(file.as_slice()), &schema)
            .unwrap_err();
        assert!(matches!(err, FloeError::SpillCorruption(_)), "{err}");
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let serde = PageSerde::new(false, true);
        let page = test_page();
        let schema = page.schema();

        let mut file = Vec::new();
        serde.write_page(&mut file, &page, false).unwrap();
        let last = file.len() - 1;
        file[last] ^= 0xff;

        let err = serde
            .read_page(&mut Cursor::new(file.as_slice()), &schema)
            .unwrap_err();
        assert!(matches!(err, FloeError::SpillCorruption(_)), "{err}");
    }

    #[test]
    fn encrypted_frame_without_key_is_rejected() {
        let writer_serde = PageSerde::new(false, true);
        let reader_serde = PageSerde::new(false, false);
        let page = test_page();
        let schema = page.schema();

        let mut file = Vec::new();
        writer_serde.write_page(&mut file, &page, false).unwrap();

        let err = reader_serde
            .read_page(&mut Cursor::new(file.as_slice()), &schema)
            .unwrap_err();
        assert!(matches!(err, FloeError::SpillCorruption(_)), "{err}");
    }

    #[test]
    fn direct_and_staged_output_are_identical_modulo_nonce() {
        // without encryption the two write modes must be byte-identical
        let serde = PageSerde::new(true, false);
        let page = test_page();

        let mut staged = Vec::new();
        let mut direct = Vec::new();
        serde.write_page(&mut staged, &page, false).unwrap();
        serde.write_page(&mut direct, &page, true).unwrap();
        assert_eq!(staged, direct);
    }
}
