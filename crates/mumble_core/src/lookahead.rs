/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Ordered filter-map with a bounded look-ahead window.
//!
//! Up to `window` items of the source are being mapped at any time. Results
//! are emitted in source order, whatever order the tasks finish in; an item
//! whose mapping yields `None` is dropped. A task that panics is emitted as
//! its `JoinError` in the same position.

use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

pub fn filter_map_ordered<S, F, Fut, T>(
    source: S,
    window: usize,
    mut f: F,
) -> mpsc::Receiver<Result<T, JoinError>>
where
    S: Stream + Send + Unpin + 'static,
    S::Item: Send + 'static,
    F: FnMut(S::Item) -> Fut + Send + 'static,
    Fut: Future<Output = Option<T>> + Send + 'static,
    T: Send + 'static,
{
    let window = window.max(1);
    let (tx, rx) = mpsc::channel(window);
    tokio::spawn(async move {
        let mut source = source;
        let mut in_flight: VecDeque<JoinHandle<Option<T>>> = VecDeque::with_capacity(window);
        let mut exhausted = false;
        loop {
            while !exhausted && in_flight.len() < window {
                match source.next().await {
                    Some(item) => in_flight.push_back(tokio::spawn(f(item))),
                    None => exhausted = true,
                }
            }
            let Some(head) = in_flight.pop_front() else { break };
            let out = match head.await {
                Ok(Some(value)) => Ok(value),
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            if tx.send(out).await.is_err() {
                // Receiver gone: nobody wants the rest.
                for h in in_flight {
                    h.abort();
                }
                return;
            }
        }
    });
    rx
}
