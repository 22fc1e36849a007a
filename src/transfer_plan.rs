// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

/// Split of a transfer into FIFO-sized chunks plus an overflow remainder.
///
/// The overflow chunk is always issued as its own transaction, even when
/// it is zero bytes long.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransferPlan {
    /// Size of each aligned chunk, equal to the FIFO depth.
    pub chunk_size: usize,
    /// Number of whole aligned chunks.
    pub chunks: usize,
    /// Length of the trailing overflow chunk, less than `chunk_size`.
    pub overflow: usize,
}

impl TransferPlan {
    /// Plan `length` bytes against a FIFO of `chunk_size` bytes.
    ///
    /// Panics if `chunk_size` is zero.
    pub fn new(length: usize, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "TransferPlan: chunk_size must be non-zero");
        let plan = TransferPlan {
            chunk_size,
            chunks: length / chunk_size,
            overflow: length % chunk_size,
        };
        log::debug!("Transfer plan for {} bytes: {:?}", length, plan);
        plan
    }

    /// Number of bytes covered by the aligned chunks.
    pub fn aligned_len(&self) -> usize {
        self.chunks * self.chunk_size
    }

    /// Total number of bytes in the plan.
    pub fn total(&self) -> usize {
        self.aligned_len() + self.overflow
    }
}

#[test]
fn test_transfer_plan() {
    // Empty transfer is a lone zero-length overflow.
    assert_eq!(TransferPlan::new(0, 128),
               TransferPlan { chunk_size: 128, chunks: 0, overflow: 0 });
    // Just under one FIFO is all overflow.
    assert_eq!(TransferPlan::new(127, 128),
               TransferPlan { chunk_size: 128, chunks: 0, overflow: 127 });
    // Exactly one FIFO leaves a zero-length overflow.
    assert_eq!(TransferPlan::new(128, 128),
               TransferPlan { chunk_size: 128, chunks: 1, overflow: 0 });
    assert_eq!(TransferPlan::new(129, 128),
               TransferPlan { chunk_size: 128, chunks: 1, overflow: 1 });
    // 1388 = 10 * 128 + 108.
    let plan = TransferPlan::new(1388, 128);
    assert_eq!(plan.aligned_len(), 1280);
    assert_eq!(plan.overflow, 108);
}

#[test]
fn test_transfer_plan_sums() {
    for n in (0..2048).chain(63_999_000..64_000_000) {
        let plan = TransferPlan::new(n, 128);
        assert_eq!(plan.total(), n);
        assert!(plan.overflow < plan.chunk_size);
    }
}
