// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Cached `Date:` header value.
//!
//! Formatting an RFC 7231 IMF-fixdate for every response is measurable
//! overhead under load, so the reactor refreshes one process-wide string
//! once per second and every response reads it back. All reads happen on
//! the reactor thread, so a plain `RefCell` is enough.

use std::cell::RefCell;
use std::time::SystemTime;

/// Refresh period of the cached date string, in milliseconds.
pub const DATE_REFRESH_INTERVAL_MS: u64 = 1_000;

pub struct DateCache {
    text: RefCell<String>,
}

impl DateCache {
    /// Creates the cache, formatted for the current instant.
    pub fn new() -> DateCache {
        DateCache {
            text: RefCell::new(httpdate::fmt_http_date(SystemTime::now())),
        }
    }

    /// Re-formats the cached string. Driven by a 1 s interval timer.
    pub fn refresh(&self) {
        *self.text.borrow_mut() = httpdate::fmt_http_date(SystemTime::now());
    }

    /// Appends the cached date to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.text.borrow().as_bytes());
    }

    /// Copies the cached date out as an owned string.
    pub fn current(&self) -> String {
        self.text.borrow().clone()
    }
}

impl Default for DateCache {
    fn default() -> DateCache {
        DateCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::DateCache;

    #[test]
    fn formats_imf_fixdate() {
        let cache = DateCache::new();
        let date = cache.current();
        // "Sun, 06 Nov 1994 08:49:37 GMT"
        assert_eq!(date.len(), 29);
        assert!(date.ends_with(" GMT"));
        assert_eq!(&date[3..5], ", ");
    }

    #[test]
    fn write_to_appends() {
        let cache = DateCache::new();
        let mut out = b"Date: ".to_vec();
        cache.write_to(&mut out);
        assert!(out.len() > 6);
        cache.refresh();
        assert_eq!(cache.current().len(), 29);
    }
}
