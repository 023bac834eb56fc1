//! Metadata at the start of every payload chunk.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use utils::allocator::align_up;

use crate::config::CHUNK_MEMORY_ALIGNMENT;
use crate::error::ChunkSettingsError;

pub const CHUNK_HEADER_VERSION: u8 = 1;

const HEADER_SIZE: u32 = size_of::<ChunkHeader>() as u32;
const BACK_OFFSET_SIZE: usize = size_of::<u32>();

/// Payload requirements of a chunk and the chunk size they need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSettings {
    user_payload_size: u32,
    user_payload_alignment: u32,
    required_chunk_size: u32,
}

impl ChunkSettings {
    pub fn create(
        user_payload_size: u32,
        user_payload_alignment: u32,
    ) -> Result<Self, ChunkSettingsError> {
        if !user_payload_alignment.is_power_of_two() {
            return Err(ChunkSettingsError::AlignmentNotPowerOfTwo(
                user_payload_alignment,
            ));
        }

        // Chunks start CHUNK_MEMORY_ALIGNMENT aligned, so does the end of the
        // header. Larger payload alignments may need up to the difference as
        // padding.
        let padding = user_payload_alignment.saturating_sub(CHUNK_MEMORY_ALIGNMENT);
        let required =
            u64::from(HEADER_SIZE) + u64::from(padding) + u64::from(user_payload_size);
        let required_chunk_size = u32::try_from(required).map_err(|_| {
            ChunkSettingsError::RequiredChunkSizeExceedsMaxChunkSize {
                payload_size: user_payload_size,
                alignment: user_payload_alignment,
            }
        })?;

        Ok(Self {
            user_payload_size,
            user_payload_alignment,
            required_chunk_size,
        })
    }

    pub fn user_payload_size(&self) -> u32 {
        self.user_payload_size
    }

    pub fn user_payload_alignment(&self) -> u32 {
        self.user_payload_alignment
    }

    pub fn required_chunk_size(&self) -> u32 {
        self.required_chunk_size
    }
}

/// Fixed 32 byte header. Every field is set when the chunk is handed out and
/// only the sequence number changes afterwards.
///
/// The offset from the header to the user payload is stored both as the last
/// field of the header and in the 4 bytes right before the payload, so the
/// header can be found from a bare payload pointer.
#[repr(C)]
#[derive(Debug)]
pub struct ChunkHeader {
    version: u8,
    _reserved: [u8; 3],
    chunk_size: u32,
    sequence_number: AtomicU64,
    user_payload_size: u32,
    user_payload_alignment: u32,
    _reserved2: u32,
    user_payload_offset: u32,
}

const _: () = assert!(size_of::<ChunkHeader>() == 32);
const _: () = assert!(std::mem::align_of::<ChunkHeader>() <= CHUNK_MEMORY_ALIGNMENT as usize);

impl ChunkHeader {
    /// Writes a header for `settings` at the start of `chunk` together with the
    /// back offset in front of the payload.
    ///
    /// # Safety
    /// `chunk` must point to `chunk_size` writable bytes aligned to
    /// [`CHUNK_MEMORY_ALIGNMENT`] and `chunk_size` must be at least
    /// `settings.required_chunk_size()`.
    pub(crate) unsafe fn emplace(
        chunk: NonNull<u8>,
        chunk_size: u32,
        settings: &ChunkSettings,
    ) -> NonNull<ChunkHeader> {
        debug_assert!(chunk_size >= settings.required_chunk_size());
        debug_assert_eq!(chunk.as_ptr() as usize % CHUNK_MEMORY_ALIGNMENT as usize, 0);

        let chunk_addr = chunk.as_ptr() as usize;
        let payload_addr = align_up(
            chunk_addr + HEADER_SIZE as usize,
            settings.user_payload_alignment() as usize,
        );
        let offset = payload_addr - chunk_addr;

        let header = chunk.cast::<ChunkHeader>();
        header.as_ptr().write(ChunkHeader {
            version: CHUNK_HEADER_VERSION,
            _reserved: [0; 3],
            chunk_size,
            sequence_number: AtomicU64::new(0),
            user_payload_size: settings.user_payload_size(),
            user_payload_alignment: settings.user_payload_alignment(),
            _reserved2: 0,
            user_payload_offset: offset as u32,
        });
        // without padding this lands on `user_payload_offset` itself
        chunk
            .as_ptr()
            .add(offset - BACK_OFFSET_SIZE)
            .cast::<u32>()
            .write_unaligned(offset as u32);

        header
    }

    /// Recovers the header of a chunk from its payload.
    ///
    /// # Safety
    /// `user_payload` must have been obtained from [`ChunkHeader::user_payload`]
    /// of a header that is still alive.
    pub unsafe fn from_user_payload(user_payload: NonNull<u8>) -> NonNull<ChunkHeader> {
        let back_offset = user_payload
            .as_ptr()
            .sub(BACK_OFFSET_SIZE)
            .cast::<u32>()
            .read_unaligned();
        NonNull::new_unchecked(user_payload.as_ptr().sub(back_offset as usize)).cast()
    }

    pub fn user_payload(&self) -> NonNull<u8> {
        let header = (self as *const Self).cast::<u8>().cast_mut();
        unsafe { NonNull::new_unchecked(header.add(self.user_payload_offset as usize)) }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn user_payload_size(&self) -> u32 {
        self.user_payload_size
    }

    pub fn user_payload_alignment(&self) -> u32 {
        self.user_payload_alignment
    }

    pub fn user_payload_offset(&self) -> u32 {
        self.user_payload_offset
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number.load(Ordering::Relaxed)
    }

    pub fn set_sequence_number(&self, sequence_number: u64) {
        self.sequence_number.store(sequence_number, Ordering::Relaxed);
    }
}
