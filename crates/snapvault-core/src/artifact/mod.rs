//! The on-wire session artifact: a steganographic container that reads as
//! an ordinary PNG up to the sentinel, followed by the keystream-obscured
//! payload.
//!
//! ```text
//! [ cover PNG bytes ][ "FHDR" ][ XOR(zip{ manifest.json, images/NNNN.png }, key) ]
//! ```
//!
//! The keystream is the passphrase repeated; this is obfuscation plus a
//! shared secret, NOT authenticated encryption. The format is kept
//! bit-compatible with existing remotes; deployments that need real
//! confidentiality must wrap the store in an encrypting layer.

pub mod thumbnail;

use std::io::{Cursor, Read, Write};

use chrono::Utc;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use snapvault_types::{Checksum, Result, SnapError};

use crate::meta::MetaIndex;
use crate::session::Session;

/// Marker separating the cover image from the payload.
pub const SENTINEL: &[u8; 4] = b"FHDR";

/// Zip entry holding the session JSON.
const SESSION_ENTRY: &str = "manifest.json";
/// Zip entry prefix for externalized window images.
const IMAGES_PREFIX: &str = "images/";

/// Encoder/decoder for session artifacts, bound to a passphrase.
pub struct Codec {
    key: Vec<u8>,
}

impl Codec {
    pub fn new(passphrase: &str) -> Self {
        Self {
            key: passphrase.as_bytes().to_vec(),
        }
    }

    /// Encode a session into the full artifact byte layout.
    pub fn encode(&self, session: &Session) -> Result<Vec<u8>> {
        let cover = self.build_cover(session)?;
        let payload = self.build_payload(session)?;

        let mut body = Vec::with_capacity(cover.len() + SENTINEL.len() + payload.len());
        body.extend_from_slice(&cover);
        body.extend_from_slice(SENTINEL);
        let mut ciphertext = payload;
        self.apply_keystream(&mut ciphertext);
        body.extend_from_slice(&ciphertext);
        Ok(body)
    }

    /// Decode an artifact back into a session.
    pub fn decode(&self, body: &[u8]) -> Result<Session> {
        let start = find_sentinel(body).ok_or_else(|| {
            SnapError::CorruptArtifact("sentinel not found in artifact".into())
        })?;
        let mut payload = body[start + SENTINEL.len()..].to_vec();
        self.apply_keystream(&mut payload);

        // An invalid archive after keystream removal almost always means a
        // wrong passphrase rather than a damaged file.
        let mut archive = ZipArchive::new(Cursor::new(payload))
            .map_err(|_| SnapError::DecryptionFailed)?;

        let mut session_json = Vec::new();
        {
            let mut entry = archive
                .by_name(SESSION_ENTRY)
                .map_err(|_| SnapError::CorruptArtifact(format!("missing {SESSION_ENTRY}")))?;
            entry.read_to_end(&mut session_json)?;
        }

        let mut session: Session = serde_json::from_slice(&session_json)
            .map_err(|e| SnapError::SchemaMismatch(format!("session JSON: {e}")))?;

        // Reattach externalized images by window position.
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| SnapError::CorruptArtifact(format!("zip entry {i}: {e}")))?;
            let name = entry.name().to_string();
            let Some(stem) = name
                .strip_prefix(IMAGES_PREFIX)
                .and_then(|rest| rest.strip_suffix(".png"))
            else {
                continue;
            };
            let index: usize = stem.parse().map_err(|_| {
                SnapError::CorruptArtifact(format!("unexpected image entry '{name}'"))
            })?;
            let mut png = Vec::new();
            entry.read_to_end(&mut png)?;
            match session.windows.get_mut(index) {
                Some(window) => window.image_png = Some(png),
                None => {
                    return Err(SnapError::CorruptArtifact(format!(
                        "image entry '{name}' has no matching window"
                    )))
                }
            }
        }

        Ok(session)
    }

    /// Derive the metadata index for an artifact, ready to upload next to
    /// it: the session's metadata block with size and image count filled
    /// in, sealed.
    pub fn derive_index(&self, body: &[u8], filename: &str) -> Result<MetaIndex> {
        let session = self.decode(body)?;
        let mut metadata = session.metadata.clone();
        metadata.file_size = body.len() as u64;
        metadata.image_count = session.windows.len() as u32;
        if metadata.created_at.is_none() {
            metadata.created_at = Some(session.created_at);
        }
        let mut index = MetaIndex::new(filename, metadata);
        index.seal()?;
        Ok(index)
    }

    /// Digest of the full artifact bytes, used to verify bodies during
    /// repair and rebuild.
    pub fn body_checksum(body: &[u8]) -> Checksum {
        Checksum::of_bytes(body)
    }

    /// XOR with the passphrase bytes cycled; a second application undoes
    /// the first. Empty key leaves data untouched.
    fn apply_keystream(&self, data: &mut [u8]) {
        if self.key.is_empty() {
            return;
        }
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= self.key[i % self.key.len()];
        }
    }

    /// Cover PNG: thumbnail collage of the session's images, or a blank
    /// tile for image-less sessions. Undecodable embedded images are
    /// skipped with a warning rather than failing the save.
    fn build_cover(&self, session: &Session) -> Result<Vec<u8>> {
        let mut images = Vec::new();
        for (i, window) in session.windows.iter().enumerate() {
            let Some(png) = &window.image_png else {
                continue;
            };
            match image::load_from_memory(png) {
                Ok(img) => images.push(img),
                Err(e) => {
                    tracing::warn!("skipping undecodable image in window {i}: {e}");
                }
            }
        }
        match thumbnail::collage(&images)? {
            Some(png) => Ok(png),
            None => thumbnail::blank_cover(),
        }
    }

    /// The deflated zip payload: session JSON with image payloads
    /// externalized into `images/NNNN.png` entries.
    fn build_payload(&self, session: &Session) -> Result<Vec<u8>> {
        let mut stripped = session.clone();
        let mut images = Vec::new();
        for (i, window) in stripped.windows.iter_mut().enumerate() {
            if let Some(png) = window.image_png.take() {
                images.push((i, png));
            }
        }
        let session_json = serde_json::to_vec_pretty(&stripped)?;

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file(SESSION_ENTRY, options)
            .map_err(|e| SnapError::Fatal(format!("zip write: {e}")))?;
        zip.write_all(&session_json)?;

        for (i, png) in images {
            zip.start_file(format!("{IMAGES_PREFIX}{i:04}.png"), options)
                .map_err(|e| SnapError::Fatal(format!("zip write: {e}")))?;
            zip.write_all(&png)?;
        }

        let cursor = zip
            .finish()
            .map_err(|e| SnapError::Fatal(format!("zip finish: {e}")))?;
        Ok(cursor.into_inner())
    }
}

/// Position of the first sentinel occurrence, scanning from the front the
/// way a decoder that only knows "PNG then marker" has to.
fn find_sentinel(body: &[u8]) -> Option<usize> {
    body.windows(SENTINEL.len())
        .position(|window| window == SENTINEL)
}

/// Synthesize a best-effort index for a body that cannot be decoded
/// (wrong key unavailable, pre-metadata artifact). Mirrors what the
/// rebuild path falls back to.
pub fn fallback_index(filename: &str, file_size: u64) -> Result<MetaIndex> {
    let mut index = MetaIndex::new(
        filename,
        crate::meta::SessionMeta {
            name: String::new(),
            desc: "Metadata not available".into(),
            created_at: Some(Utc::now()),
            file_size,
            ..Default::default()
        },
    );
    index.seal()?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::SessionMeta;
    use crate::session::{SessionWindow, WindowGeometry};

    fn sample_session(images: usize) -> Session {
        let mut session = Session::new(SessionMeta {
            name: "Test".into(),
            tags: vec!["t1".into()],
            ..Default::default()
        });
        for i in 0..images {
            let png = thumbnail::encode_png(&image::DynamicImage::ImageRgb8(
                image::RgbImage::from_pixel(64, 48, image::Rgb([i as u8 * 40, 80, 120])),
            ))
            .unwrap();
            session.windows.push(SessionWindow {
                geometry: WindowGeometry {
                    x: i as i32 * 10,
                    y: 0,
                    width: 64,
                    height: 48,
                },
                scale: 1.0,
                image_png: Some(png),
                draw_history: vec![serde_json::json!({"tool": "pen", "points": [i]})],
            });
        }
        session
    }

    #[test]
    fn round_trip_preserves_session() {
        let codec = Codec::new("hunter2");
        let session = sample_session(3);
        let body = codec.encode(&session).unwrap();
        let decoded = codec.decode(&body).unwrap();
        // Byte-equal after canonicalization.
        assert_eq!(
            serde_json::to_vec(&decoded).unwrap(),
            serde_json::to_vec(&session).unwrap()
        );
    }

    #[test]
    fn artifact_opens_with_png_magic() {
        let codec = Codec::new("k");
        let body = codec.encode(&sample_session(1)).unwrap();
        assert!(body.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[test]
    fn wrong_key_is_decryption_failure() {
        let codec = Codec::new("right-key");
        let body = codec.encode(&sample_session(1)).unwrap();
        let err = Codec::new("wrong-key").decode(&body).unwrap_err();
        assert!(matches!(err, SnapError::DecryptionFailed));
    }

    #[test]
    fn missing_sentinel_is_corrupt() {
        let codec = Codec::new("k");
        let err = codec.decode(&[0x89, 0x50, 0x4E, 0x47, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, SnapError::CorruptArtifact(_)));
    }

    #[test]
    fn empty_key_round_trips() {
        let codec = Codec::new("");
        let session = sample_session(0);
        let body = codec.encode(&session).unwrap();
        let decoded = codec.decode(&body).unwrap();
        assert_eq!(decoded.metadata, session.metadata);
    }

    #[test]
    fn derive_index_fills_size_and_count() {
        let codec = Codec::new("k");
        let session = sample_session(2);
        let body = codec.encode(&session).unwrap();
        let index = codec
            .derive_index(&body, "20250621114615_test.fastshot")
            .unwrap();
        assert_eq!(index.filename, "20250621114615_test.fastshot");
        assert_eq!(index.metadata.image_count, 2);
        assert_eq!(index.metadata.file_size, body.len() as u64);
        assert!(index.checksum_valid());
    }

    #[test]
    fn legacy_session_without_metadata_decodes_with_defaults() {
        // A hand-built artifact whose JSON predates the metadata block.
        let codec = Codec::new("k");
        let legacy_json = br#"{"windows": []}"#;
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file(SESSION_ENTRY, SimpleFileOptions::default())
            .unwrap();
        zip.write_all(legacy_json).unwrap();
        let mut payload = zip.finish().unwrap().into_inner();
        codec.apply_keystream(&mut payload);

        let mut body = thumbnail::blank_cover().unwrap();
        body.extend_from_slice(SENTINEL);
        body.extend_from_slice(&payload);

        let session = codec.decode(&body).unwrap();
        assert!(session.windows.is_empty());
        assert_eq!(session.metadata, SessionMeta::default());
    }
}
