//! Cached `Date` header value.
//!
//! Formatting an HTTP date on every response is wasted work under load; the
//! service keeps the formatted value in an [`ArcSwap`] and refreshes it at
//! most every 500 ms, on demand, from whichever response thread notices it
//! is stale.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::HeaderValue;
use once_cell::sync::Lazy;

const REFRESH_AFTER: Duration = Duration::from_millis(500);

pub(crate) struct DateService {
    current: ArcSwap<Stamped>,
}

struct Stamped {
    value: Bytes,
    at: Instant,
}

static DATE_SERVICE: Lazy<DateService> = Lazy::new(DateService::new);

impl DateService {
    pub(crate) fn global() -> &'static DateService {
        &DATE_SERVICE
    }

    fn new() -> Self {
        Self { current: ArcSwap::from_pointee(Stamped::now()) }
    }

    pub(crate) fn header_value(&self) -> HeaderValue {
        let stamped = self.current.load();
        let value = if stamped.at.elapsed() > REFRESH_AFTER {
            let fresh = Arc::new(Stamped::now());
            let value = fresh.value.clone();
            self.current.store(fresh);
            value
        } else {
            stamped.value.clone()
        };

        HeaderValue::from_maybe_shared(value).expect("formatted http date is a valid header value")
    }
}

impl Stamped {
    fn now() -> Self {
        let mut buf = faf_http_date::get_date_buff_no_key();
        faf_http_date::get_date_no_key(&mut buf);
        Self { value: Bytes::from_owner(buf), at: Instant::now() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_a_plausible_http_date() {
        let value = DateService::global().header_value();
        let text = value.to_str().unwrap();

        // e.g. "Sat, 01 Aug 2026 12:00:00 GMT"
        assert!(text.ends_with("GMT"), "unexpected date format: {text}");
        assert_eq!(&text[3..5], ", ");
    }

    #[test]
    fn consecutive_values_are_cached() {
        let a = DateService::global().header_value();
        let b = DateService::global().header_value();
        assert_eq!(a, b);
    }
}
