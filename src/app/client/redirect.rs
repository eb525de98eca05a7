//! Redirect bookkeeping
//!
//! Redirects are followed by the engine, not by the HTTP client, so that a
//! cycle is reported as an error instead of being chased until a client
//! limit trips.

use std::collections::HashSet;

use url::Url;

use crate::constants::http;
use crate::errors::{NetworkErrorCode, TransferError, TransferResult};

/// Visited URLs and hop count of one download attempt
#[derive(Debug, Clone)]
pub struct RedirectTracker {
    visited: HashSet<Url>,
    hops: usize,
    max_hops: usize,
}

impl RedirectTracker {
    pub fn new(origin: &Url, max_hops: usize) -> Self {
        let mut visited = HashSet::new();
        visited.insert(origin.clone());
        Self {
            visited,
            hops: 0,
            max_hops,
        }
    }

    /// Forget previous hops and start again from `origin`
    pub fn reset(&mut self, origin: &Url) {
        self.visited.clear();
        self.visited.insert(origin.clone());
        self.hops = 0;
    }

    pub fn hops(&self) -> usize {
        self.hops
    }

    /// Record a hop to `target`
    ///
    /// Revisiting any URL of this attempt or exceeding the hop bound is a
    /// network error with the redirect-loop code.
    pub fn follow(&mut self, target: &Url) -> TransferResult<()> {
        if self.visited.contains(target) {
            return Err(TransferError::network(
                NetworkErrorCode::RedirectLoop,
                format!("Redirect loop detected at {}", target),
            ));
        }
        if self.hops >= self.max_hops {
            return Err(TransferError::network(
                NetworkErrorCode::RedirectLoop,
                format!("Too many redirects ({}) ending at {}", self.hops, target),
            ));
        }
        self.hops += 1;
        self.visited.insert(target.clone());
        Ok(())
    }
}

impl Default for RedirectTracker {
    fn default() -> Self {
        Self {
            visited: HashSet::new(),
            hops: 0,
            max_hops: http::MAX_REDIRECTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_two_hop_cycle_back_to_origin_is_error() {
        let origin = url("http://a.example/file");
        let mut tracker = RedirectTracker::new(&origin, 10);

        assert!(tracker.follow(&url("http://b.example/file")).is_ok());
        let error = tracker.follow(&origin).unwrap_err();
        assert!(matches!(
            error,
            TransferError::Network {
                code: NetworkErrorCode::RedirectLoop,
                ..
            }
        ));
    }

    #[test]
    fn test_hop_bound() {
        let origin = url("http://a.example/0");
        let mut tracker = RedirectTracker::new(&origin, 3);
        for i in 1..=3 {
            tracker.follow(&url(&format!("http://a.example/{}", i))).unwrap();
        }
        assert_eq!(tracker.hops(), 3);
        assert!(tracker.follow(&url("http://a.example/4")).is_err());
    }

    #[test]
    fn test_reset_forgets_history() {
        let origin = url("http://a.example/file");
        let mirror = url("http://b.example/file");
        let mut tracker = RedirectTracker::new(&origin, 10);
        tracker.follow(&mirror).unwrap();

        tracker.reset(&origin);
        assert_eq!(tracker.hops(), 0);
        assert!(tracker.follow(&mirror).is_ok());
    }
}
