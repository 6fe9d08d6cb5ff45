pub const SYSTEM_AUTHOR: &str = "System";

pub const GUEST_AUTHOR_PREFIX: &str = "Guest (";

pub const RATING_PROMPT: &str = "Thank you for using our support! Please rate us 1-5 stars.";

pub const RESOLVED_NOTICE: &str = "This ticket has been marked as resolved. If you need further assistance, please submit a new ticket.";

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 100;

pub const DEFAULT_FEED_CAPACITY: usize = 1024;
pub const MIN_FEED_CAPACITY: usize = 16;
