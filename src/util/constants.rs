//! Numeric constants shared across the crate.

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// Bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// Bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes in a gigabyte
pub const LOG_BYTES_IN_GBYTE: u8 = 30;
/// Bytes in a gigabyte
pub const BYTES_IN_GBYTE: usize = 1 << LOG_BYTES_IN_GBYTE;

/// The number of cells in one mark-stack segment. A visitor's local stack is a
/// chain of segments; donation to the shared tier moves whole segments so the
/// shared lock is touched once per segment, not once per cell.
pub const MARK_STACK_SEGMENT_SIZE: usize = 256;

/// How many cells a visitor keeps to itself before it considers donating a
/// segment to idle markers during parallel draining.
pub const MARK_STACK_DONATION_THRESHOLD: usize = 2 * MARK_STACK_SEGMENT_SIZE;
