use crate::{MAX_PART_SIZE, MIB, MIN_PART_SIZE, TransferError};

/// Validates a part or range size.
///
/// Rejects:
/// - Sizes below 1 MiB or above 4 GiB
/// - Sizes that are not a whole number of MiB
/// - MiB counts that are not a power of two
pub fn validate_part_size(part_size: u64) -> Result<(), TransferError> {
    if part_size < MIN_PART_SIZE {
        return Err(TransferError::Config(format!(
            "part size {part_size} is below the minimum of {MIN_PART_SIZE} bytes"
        )));
    }
    if part_size > MAX_PART_SIZE {
        return Err(TransferError::Config(format!(
            "part size {part_size} exceeds the maximum of {MAX_PART_SIZE} bytes"
        )));
    }
    if part_size % MIB != 0 || !(part_size / MIB).is_power_of_two() {
        return Err(TransferError::Config(format!(
            "part size {part_size} is not a power-of-two multiple of 1 MiB"
        )));
    }
    Ok(())
}

/// Validates a worker-pool size.
pub fn validate_concurrency(concurrency: usize) -> Result<(), TransferError> {
    if concurrency == 0 {
        return Err(TransferError::Config(
            "concurrency must be at least 1".into(),
        ));
    }
    Ok(())
}
