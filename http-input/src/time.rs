pub trait TimeSource {
    // Current time as unix seconds
    fn current_time(&self) -> u64;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> u64 {
        let seconds = time::OffsetDateTime::now_utc().unix_timestamp();
        u64::try_from(seconds).unwrap_or_default()
    }
}

/// Always returns the same instant, for tests and replays.
#[derive(Clone)]
pub struct FixedTime {
    pub time: u64,
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> u64 {
        self.time
    }
}
