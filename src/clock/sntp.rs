use std::time::Duration;

use tokio::net::UdpSocket;

use crate::error::{AppError, AppResult, SessionError};

use super::{Timestamp, system_now};

const PACKET_LEN: usize = 48;
/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01.
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;
/// LI = 0, VN = 3, Mode = 3 (client).
const CLIENT_HEADER: u8 = 0x1B;
const RECEIVE_TS_AT: usize = 32;
const TRANSMIT_TS_AT: usize = 40;

/// Simple SNTP client used to estimate the local clock offset.
#[derive(Debug, Clone)]
pub struct SntpSource {
    addr: String,
    timeout: Duration,
}

impl SntpSource {
    #[must_use]
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns the offset (server minus local) in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns an error when the server cannot be reached within the timeout
    /// or replies with a malformed packet.
    pub async fn query_offset(&self) -> AppResult<i64> {
        let io_err = |err: std::io::Error| {
            AppError::session(SessionError::TimeSourceIo {
                addr: self.addr.clone(),
                source: err,
            })
        };
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(io_err)?;
        socket.connect(&self.addr).await.map_err(io_err)?;

        let sent_at = system_now();
        socket
            .send(&encode_request(sent_at))
            .await
            .map_err(io_err)?;

        let mut reply = [0u8; PACKET_LEN];
        let len = match tokio::time::timeout(self.timeout, socket.recv(&mut reply)).await {
            Ok(result) => result.map_err(io_err)?,
            Err(_) => {
                return Err(AppError::session(SessionError::TimeSourceTimeout {
                    addr: self.addr.clone(),
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                }));
            }
        };
        let received_at = system_now();

        let (server_received, server_sent) = decode_reply(&reply, len).ok_or_else(|| {
            AppError::session(SessionError::TimeSourceInvalidReply {
                addr: self.addr.clone(),
                len,
            })
        })?;
        Ok(compute_offset_ms(
            sent_at,
            server_received,
            server_sent,
            received_at,
        ))
    }
}

pub(super) fn encode_request(sent_at: Timestamp) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = CLIENT_HEADER;
    let encoded = encode_ntp_timestamp(sent_at);
    for (slot, byte) in packet.iter_mut().skip(TRANSMIT_TS_AT).zip(encoded) {
        *slot = byte;
    }
    packet
}

pub(super) fn decode_reply(reply: &[u8], len: usize) -> Option<(Timestamp, Timestamp)> {
    if len < PACKET_LEN {
        return None;
    }
    let received = decode_ntp_timestamp(reply.get(RECEIVE_TS_AT..RECEIVE_TS_AT + 8)?)?;
    let sent = decode_ntp_timestamp(reply.get(TRANSMIT_TS_AT..TRANSMIT_TS_AT + 8)?)?;
    Some((received, sent))
}

fn encode_ntp_timestamp(time: Timestamp) -> [u8; 8] {
    let ms = time.as_millis();
    let secs = (ms / 1000).saturating_add(NTP_UNIX_OFFSET_SECS);
    let frac = ((ms % 1000) << 32) / 1000;
    let mut bytes = [0u8; 8];
    let secs_bytes = u32::try_from(secs & 0xFFFF_FFFF).unwrap_or(0).to_be_bytes();
    let frac_bytes = u32::try_from(frac & 0xFFFF_FFFF).unwrap_or(0).to_be_bytes();
    for (slot, byte) in bytes.iter_mut().zip(secs_bytes.into_iter().chain(frac_bytes)) {
        *slot = byte;
    }
    bytes
}

pub(super) fn decode_ntp_timestamp(bytes: &[u8]) -> Option<Timestamp> {
    let secs = u32::from_be_bytes(bytes.get(0..4)?.try_into().ok()?);
    let frac = u32::from_be_bytes(bytes.get(4..8)?.try_into().ok()?);
    let unix_secs = u64::from(secs).checked_sub(NTP_UNIX_OFFSET_SECS)?;
    let frac_ms = (u64::from(frac).saturating_mul(1000)) >> 32;
    Some(Timestamp::from_millis(
        unix_secs.saturating_mul(1000).saturating_add(frac_ms),
    ))
}

/// Standard SNTP offset: `((t2 - t1) + (t3 - t4)) / 2`.
pub(super) fn compute_offset_ms(
    sent_at: Timestamp,
    server_received: Timestamp,
    server_sent: Timestamp,
    received_at: Timestamp,
) -> i64 {
    let signed = |ts: Timestamp| i128::from(ts.as_millis());
    let offset = (signed(server_received) - signed(sent_at) + signed(server_sent)
        - signed(received_at))
        / 2;
    i64::try_from(offset).unwrap_or(0)
}
