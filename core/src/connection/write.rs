//! Chunked characteristic writes.

use crate::config::WriteOptions;
use crate::device::Address;
use crate::error::RequestError;
use crate::request::{RequestResult, RequestValue};
use crate::transport::{CharacteristicRef, Transport};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, trace};

/// Split a payload into write chunks; an empty payload is one empty chunk
pub(crate) fn split(value: &[u8], size: usize) -> Vec<&[u8]> {
    if value.is_empty() {
        vec![value]
    } else {
        value.chunks(size.max(1)).collect()
    }
}

/// Write `value` chunk by chunk. Chunks are submitted strictly in order and
/// at least `package_write_delay` apart. With `wait_write_result` each
/// chunk's acknowledgment must arrive within `request_timeout` before the
/// next one is sent; without it the whole submission must finish within
/// `request_timeout`.
pub(crate) async fn write_chunked(
    transport: &dyn Transport,
    address: &Address,
    target: &CharacteristicRef,
    value: Vec<u8>,
    options: &WriteOptions,
    mtu: u16,
    request_timeout: Duration,
) -> RequestResult {
    if options.wait_write_result {
        return send_chunks(transport, address, target, value, options, mtu, request_timeout)
            .await;
    }
    let submission = send_chunks(transport, address, target, value, options, mtu, request_timeout);
    match timeout(request_timeout, submission).await {
        Ok(result) => result,
        Err(_) => {
            debug!("unacknowledged write to {} ran past its timeout", target);
            Err(RequestError::RequestTimeout)
        }
    }
}

async fn send_chunks(
    transport: &dyn Transport,
    address: &Address,
    target: &CharacteristicRef,
    value: Vec<u8>,
    options: &WriteOptions,
    mtu: u16,
    ack_timeout: Duration,
) -> RequestResult {
    let chunks = split(&value, options.effective_package_size(mtu));
    let total = chunks.len();

    let first_delay = options.request_write_delay();
    if !first_delay.is_zero() {
        sleep(first_delay).await;
    }

    let gap = options.package_write_delay();
    let mut last_sent: Option<Instant> = None;
    for (index, chunk) in chunks.iter().enumerate() {
        if let Some(at) = last_sent {
            if !gap.is_zero() {
                sleep_until(at + gap).await;
            }
        }

        let ack = transport.write_characteristic(address, target, chunk, options.write_type)?;
        last_sent = Some(Instant::now());

        if options.wait_write_result {
            match timeout(ack_timeout, ack).await {
                Ok(Ok(())) => trace!("chunk {}/{} acked on {}", index + 1, total, target),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(RequestError::RequestTimeout),
            }
        }
    }

    Ok(RequestValue::Written(value))
}
