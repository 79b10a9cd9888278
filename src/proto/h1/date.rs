use std::cell::RefCell;
use std::time::{Duration, SystemTime};

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

/// Appends the current HTTP-date, re-rendered at most once per second.
pub(crate) fn extend(dst: &mut Vec<u8>) {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check();
        dst.extend_from_slice(cache.value.as_bytes());
    })
}

struct CachedDate {
    value: String,
    next_update: SystemTime,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> Self {
        let mut cache = CachedDate {
            value: String::with_capacity(DATE_VALUE_LENGTH),
            next_update: SystemTime::UNIX_EPOCH,
        };
        cache.check();
        cache
    }

    fn check(&mut self) {
        let now = SystemTime::now();
        if now >= self.next_update {
            self.value = httpdate::fmt_http_date(now);
            debug_assert_eq!(self.value.len(), DATE_VALUE_LENGTH);
            self.next_update = now + Duration::from_secs(1);
        }
    }
}
