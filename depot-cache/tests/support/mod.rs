//! Shared helpers for depot integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

/// Poll `condition` every few milliseconds until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future`, failing the test if it takes longer than `limit`.
pub async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    match tokio::time::timeout(limit, future).await {
        Ok(output) => output,
        Err(_) => panic!("operation did not finish within {:?}", limit),
    }
}

pub const PATIENCE: Duration = Duration::from_secs(5);
