//! Block descriptors, block-size selection and staged block ids.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::TransferError;
use crate::config::TransferConfig;

/// Digits in a block id before encoding; wide enough for any block count
/// the size rules accept.
const BLOCK_ID_DIGITS: usize = 6;

/// One contiguous slice of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Position in the transfer, starting at 0.
    pub index: usize,
    /// Absolute offset in the remote object.
    pub offset: u64,
    pub length: u32,
}

impl Block {
    /// Offset one past the last byte of the block.
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.length)
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Staged-block id for `index`: base64 of the zero-padded decimal index.
///
/// All ids of a transfer have the same length.
pub fn block_id(index: usize) -> String {
    STANDARD.encode(format!("{index:0width$}", width = BLOCK_ID_DIGITS))
}

fn block_count(length: u64, block_size: usize) -> u64 {
    length.div_ceil(block_size as u64)
}

/// Block size for downloading `length` bytes.
pub fn download_block_size(length: u64, config: &TransferConfig) -> Result<usize, TransferError> {
    let size = config.download_block_size;
    if size == 0 {
        return Err(TransferError::Argument("download block size is zero".into()));
    }
    if block_count(length, size) > config.max_download_blocks {
        return Err(TransferError::CapacityExceeded {
            length,
            block_size: size,
            max_blocks: config.max_download_blocks,
        });
    }
    Ok(size)
}

/// Block size for uploading `length` bytes.
///
/// Starts at the initial size and grows by one step until the block count
/// fits the limit.
pub fn upload_block_size(length: u64, config: &TransferConfig) -> Result<usize, TransferError> {
    let mut size = config.upload_initial_block_size;
    if size == 0 {
        return Err(TransferError::Argument("upload block size is zero".into()));
    }
    while block_count(length, size) > config.max_upload_blocks {
        let next = size + config.upload_block_step;
        if config.upload_block_step == 0 || next > config.upload_max_block_size {
            return Err(TransferError::CapacityExceeded {
                length,
                block_size: config.upload_max_block_size,
                max_blocks: config.max_upload_blocks,
            });
        }
        size = next;
    }
    Ok(size)
}

/// Splits `[initial_offset, initial_offset + total_length)` into blocks of
/// `block_size`; the last block carries the remainder.
pub fn partition(initial_offset: u64, total_length: u64, block_size: usize) -> Vec<Block> {
    let step = block_size as u64;
    let count = block_count(total_length, block_size) as usize;
    let mut blocks = Vec::with_capacity(count);
    let mut done = 0u64;
    while done < total_length {
        let length = step.min(total_length - done) as u32;
        blocks.push(Block {
            index: blocks.len(),
            offset: initial_offset + done,
            length,
        });
        done += u64::from(length);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn ten_mib_download_uses_three_blocks() {
        let config = TransferConfig::default();
        let size = download_block_size(10 * MIB, &config).unwrap();
        assert_eq!(size, 4 * MIB as usize);

        let blocks = partition(0, 10 * MIB, size);
        let spans: Vec<_> = blocks.iter().map(|b| (b.offset, b.length)).collect();
        assert_eq!(
            spans,
            vec![
                (0, 4 * MIB as u32),
                (4 * MIB, 4 * MIB as u32),
                (8 * MIB, 2 * MIB as u32)
            ]
        );
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let config = TransferConfig {
            download_block_size: 0,
            upload_initial_block_size: 0,
            ..TransferConfig::default()
        };
        assert!(matches!(
            download_block_size(10, &config),
            Err(TransferError::Argument(_))
        ));
        assert!(matches!(
            upload_block_size(10, &config),
            Err(TransferError::Argument(_))
        ));
    }

    #[test]
    fn zero_step_cannot_grow_blocks() {
        let config = TransferConfig {
            upload_block_step: 0,
            max_upload_blocks: 10,
            ..TransferConfig::default()
        };
        assert!(upload_block_size(10 * MIB, &config).is_ok());
        assert!(matches!(
            upload_block_size(100 * MIB, &config),
            Err(TransferError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn hundred_mib_upload_uses_one_mib_blocks() {
        let config = TransferConfig::default();
        let size = upload_block_size(100 * MIB, &config).unwrap();
        assert_eq!(size, MIB as usize);
        assert_eq!(partition(0, 100 * MIB, size).len(), 100);
    }

    #[test]
    fn upload_block_size_grows_in_steps() {
        let config = TransferConfig::default();
        // One byte more than 49_999 full blocks of 1 MiB.
        let size = upload_block_size(49_999 * MIB + 1, &config).unwrap();
        assert_eq!(size, 2 * MIB as usize);
    }

    #[test]
    fn upload_too_large_is_rejected() {
        let config = TransferConfig::default();
        let err = upload_block_size(49_999 * 4 * MIB + 1, &config).unwrap_err();
        assert!(matches!(err, TransferError::CapacityExceeded { .. }));
    }

    #[test]
    fn download_too_large_is_rejected() {
        let config = TransferConfig::default();
        assert!(download_block_size(50_000 * 4 * MIB, &config).is_ok());
        let err = download_block_size(50_000 * 4 * MIB + 1, &config).unwrap_err();
        assert!(matches!(err, TransferError::CapacityExceeded { .. }));
    }

    #[test]
    fn partition_honours_initial_offset() {
        let blocks = partition(100, 10, 4);
        assert_eq!(blocks.first().unwrap().offset, 100);
        assert_eq!(blocks.last().unwrap().end(), 110);
    }

    #[test]
    fn empty_length_has_no_blocks() {
        assert!(partition(0, 0, 4).is_empty());
    }

    #[test]
    fn block_ids_share_length_and_encode_index() {
        assert_eq!(block_id(0), STANDARD.encode("000000"));
        assert_eq!(block_id(0).len(), block_id(49_998).len());
        assert_ne!(block_id(1), block_id(10));
    }

    proptest! {
        #[test]
        fn partition_covers_range_exactly(
            start in 0u64..1_000_000,
            length in 0u64..5_000_000,
            block_size in 1usize..70_000,
        ) {
            let blocks = partition(start, length, block_size);
            let mut cursor = start;
            for (i, block) in blocks.iter().enumerate() {
                prop_assert_eq!(block.index, i);
                prop_assert_eq!(block.offset, cursor);
                prop_assert!(block.length > 0);
                prop_assert!(block.len() <= block_size);
                cursor = block.end();
            }
            prop_assert_eq!(cursor, start + length);
        }
    }
}
