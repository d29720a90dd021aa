// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TEST_ECHO: answer with the request data after an optional delay.

use std::time::Duration;

use fabric_protocol::messages::EchoRequest;

use super::{Payload, RequestCancelled, WorkerRequest};

/// Longest uninterrupted sleep; cancellation is checked in between.
const SLICE: Duration = Duration::from_millis(100);

pub(super) async fn execute(
    request: &WorkerRequest,
    body: &EchoRequest,
) -> Result<bool, RequestCancelled> {
    let mut left = Duration::from_millis(body.delay);
    while !left.is_zero() {
        request.check_cancelled()?;
        let step = left.min(SLICE);
        tokio::time::sleep(step).await;
        left -= step;
    }
    request.check_cancelled()?;
    request.succeed(Payload::Echo(body.data.clone()));
    Ok(true)
}
