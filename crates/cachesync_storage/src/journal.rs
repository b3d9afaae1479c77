//! Checksummed frame journal.
//!
//! Frame layout (little endian):
//!
//! ```text
//! +------------+------------+-----------------+
//! | len: u32   | crc32: u32 | payload (len B) |
//! +------------+------------+-----------------+
//! ```
//!
//! A crash can leave a partially written frame at the tail. Replay drops such
//! a tail and rewrites the journal without it. A bad frame followed by valid
//! data is real corruption and is reported as an error.

use crate::backend::JournalBackend;
use crate::error::{StorageError, StorageResult};

/// Size of the per-frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Frames read back when a journal is opened.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JournalReplay {
    /// Valid frame payloads in write order.
    pub frames: Vec<Vec<u8>>,
    /// Number of torn tail bytes that were discarded.
    pub discarded_bytes: u64,
}

/// An append-only journal of checksummed frames.
pub struct Journal {
    backend: Box<dyn JournalBackend>,
    frame_count: usize,
    sync_on_append: bool,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("frame_count", &self.frame_count)
            .field("sync_on_append", &self.sync_on_append)
            .finish()
    }
}

impl Journal {
    /// Opens a journal over `backend` and replays its frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or if a frame in the
    /// middle of the journal fails its checksum.
    pub fn open(mut backend: Box<dyn JournalBackend>) -> StorageResult<(Self, JournalReplay)> {
        let bytes = backend.load()?;
        let (frames, valid_len) = decode_frames(&bytes)?;

        let discarded_bytes = (bytes.len() - valid_len) as u64;
        if discarded_bytes > 0 {
            backend.replace(&bytes[..valid_len])?;
            backend.sync()?;
        }

        let journal = Self {
            backend,
            frame_count: frames.len(),
            sync_on_append: true,
        };
        Ok((
            journal,
            JournalReplay {
                frames,
                discarded_bytes,
            },
        ))
    }

    /// Controls whether every append is followed by a durable sync.
    pub fn set_sync_on_append(&mut self, value: bool) {
        self.sync_on_append = value;
    }

    /// Appends one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is too large or the write fails.
    pub fn append(&mut self, payload: &[u8]) -> StorageResult<()> {
        let frame = encode_frame(payload)?;
        self.backend.append(&frame)?;
        if self.sync_on_append {
            self.backend.sync()?;
        }
        self.frame_count += 1;
        Ok(())
    }

    /// Replaces the whole journal with the given frames.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload is too large or the write fails.
    pub fn rewrite(&mut self, payloads: &[Vec<u8>]) -> StorageResult<()> {
        let mut buf = Vec::new();
        for payload in payloads {
            buf.extend_from_slice(&encode_frame(payload)?);
        }
        self.backend.replace(&buf)?;
        self.backend.sync()?;
        self.frame_count = payloads.len();
        Ok(())
    }

    /// Number of frames currently in the journal.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Size of the journal in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> StorageResult<u64> {
        self.backend.size()
    }
}

fn encode_frame(payload: &[u8]) -> StorageResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::FrameTooLarge { len: payload.len() })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&compute_crc32(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decodes frames, returning them with the length of the valid prefix.
fn decode_frames(bytes: &[u8]) -> StorageResult<(Vec<Vec<u8>>, usize)> {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        if offset + FRAME_HEADER_SIZE > bytes.len() {
            break;
        }
        let header = &bytes[offset..offset + FRAME_HEADER_SIZE];
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let start = offset + FRAME_HEADER_SIZE;
        let end = match start.checked_add(len) {
            Some(end) if end <= bytes.len() => end,
            _ => break,
        };

        let payload = &bytes[start..end];
        if compute_crc32(payload) != crc {
            if end == bytes.len() {
                break;
            }
            return Err(StorageError::Corrupted {
                offset: offset as u64,
                reason: "checksum mismatch".into(),
            });
        }

        frames.push(payload.to_vec());
        offset = end;
    }

    Ok((frames, offset))
}

/// Computes the CRC32 (IEEE) checksum of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBackend;
    use proptest::prelude::*;

    fn open(backend: &InMemoryBackend) -> (Journal, JournalReplay) {
        Journal::open(Box::new(backend.clone())).unwrap()
    }

    #[test]
    fn empty_journal_replays_nothing() {
        let backend = InMemoryBackend::new();
        let (journal, replay) = open(&backend);
        assert_eq!(journal.frame_count(), 0);
        assert!(replay.frames.is_empty());
        assert_eq!(replay.discarded_bytes, 0);
    }

    #[test]
    fn frames_survive_reopen() {
        let backend = InMemoryBackend::new();
        {
            let (mut journal, _) = open(&backend);
            journal.append(b"one").unwrap();
            journal.append(b"").unwrap();
            journal.append(b"three").unwrap();
            assert_eq!(journal.frame_count(), 3);
        }

        let (journal, replay) = open(&backend);
        assert_eq!(journal.frame_count(), 3);
        assert_eq!(
            replay.frames,
            vec![b"one".to_vec(), Vec::new(), b"three".to_vec()]
        );
    }

    #[test]
    fn torn_tail_is_dropped_and_truncated() {
        let backend = InMemoryBackend::new();
        {
            let (mut journal, _) = open(&backend);
            journal.append(b"complete").unwrap();
        }
        let mut bytes = backend.data();
        let good_len = bytes.len();
        bytes.extend_from_slice(&encode_frame(b"half written").unwrap()[..10]);

        let torn = InMemoryBackend::with_data(bytes);
        let (_, replay) = open(&torn);
        assert_eq!(replay.frames, vec![b"complete".to_vec()]);
        assert_eq!(replay.discarded_bytes, 10);
        assert_eq!(torn.data().len(), good_len);
    }

    #[test]
    fn bad_checksum_on_last_frame_is_a_torn_tail() {
        let mut bytes = encode_frame(b"first").unwrap();
        let mut last = encode_frame(b"second").unwrap();
        let n = last.len();
        last[n - 1] ^= 0xFF;
        bytes.extend_from_slice(&last);

        let (_, replay) = open(&InMemoryBackend::with_data(bytes));
        assert_eq!(replay.frames, vec![b"first".to_vec()]);
    }

    #[test]
    fn bad_checksum_in_the_middle_is_corruption() {
        let mut first = encode_frame(b"first").unwrap();
        first[FRAME_HEADER_SIZE] ^= 0xFF;
        first.extend_from_slice(&encode_frame(b"second").unwrap());

        let result = Journal::open(Box::new(InMemoryBackend::with_data(first)));
        assert!(matches!(result, Err(StorageError::Corrupted { offset: 0, .. })));
    }

    #[test]
    fn rewrite_replaces_all_frames() {
        let backend = InMemoryBackend::new();
        {
            let (mut journal, _) = open(&backend);
            for i in 0..10u8 {
                journal.append(&[i]).unwrap();
            }
            journal.rewrite(&[b"snapshot".to_vec()]).unwrap();
            assert_eq!(journal.frame_count(), 1);
        }

        let (_, replay) = open(&backend);
        assert_eq!(replay.frames, vec![b"snapshot".to_vec()]);
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    proptest! {
        #[test]
        fn any_prefix_replays_a_prefix_of_frames(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
            cut in 0usize..1024,
        ) {
            let mut bytes = Vec::new();
            for payload in &payloads {
                bytes.extend_from_slice(&encode_frame(payload).unwrap());
            }
            let cut = cut.min(bytes.len());
            bytes.truncate(cut);

            let (_, replay) = Journal::open(Box::new(InMemoryBackend::with_data(bytes))).unwrap();
            prop_assert!(replay.frames.len() <= payloads.len());
            prop_assert_eq!(&replay.frames[..], &payloads[..replay.frames.len()]);
        }
    }
}
