// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::future::Future;
use std::time::Duration;

use async_io::Timer;
use futures::future::{select, Either};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed(pub Duration);

impl std::fmt::Display for Elapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timed out after {:?}", self.0)
    }
}

impl std::error::Error for Elapsed {}

/// Race `fut` against a timer. The losing future is dropped.
pub async fn with_timeout<F: Future>(dur: Duration, fut: F) -> Result<F::Output, Elapsed> {
    let fut = std::pin::pin!(fut);
    match select(fut, Timer::after(dur)).await {
        Either::Left((out, _)) => Ok(out),
        Either::Right(_) => Err(Elapsed(dur)),
    }
}

pub async fn sleep(dur: Duration) {
    Timer::after(dur).await;
}
