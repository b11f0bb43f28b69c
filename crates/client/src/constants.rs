pub const PROGRESS_BAR_STEPS: u64 = 1_000; // Report every 0.1%

pub const EXIT_ERROR: i32 = 1;
pub const EXIT_CANCELLED: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;
