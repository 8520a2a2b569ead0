//! Concrete [`crate::capability::FallbackSource`]: a static MPEG-TS filler
//! clip served in fixed-size chunks whenever a channel enters `Recovering`,
//! so subscribers keep receiving well-formed TS packets instead of silence
//! while the supervisor retries (SPEC_FULL.md §8 scenario 2/3).
//!
//! Grounded on the same MPEG-TS sync-byte shape `channel_stream`'s
//! `has_sync_byte` validates — every packet starts with `0x47` at a
//! 188-byte-aligned offset; it is the PID that distinguishes a real stream
//! from filler.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};

use crate::capability::{BoxFuture, ChannelId, FallbackSource};

const TS_PACKET_LEN: usize = 188;
/// MPEG-TS reserves PID 0x1FFF for null (stuffing) packets; decoders and
/// muxers downstream are required to discard them, which is exactly the
/// "continuous bytes, no content" behavior filler needs.
const NULL_PID: u16 = 0x1FFF;
/// ~2s of filler at a typical 4Mbps mux rate per chunk handed to the ring
/// buffer on each `stream()` call.
const FILLER_PACKET_COUNT: usize = 512;

pub struct StaticFillerSource {
    chunk: Bytes,
    enabled: bool,
}

impl StaticFillerSource {
    /// Loads a pre-rendered filler clip from `path` (e.g. an "offline" slate
    /// muxed to MPEG-TS ahead of time) if given and readable; otherwise
    /// synthesizes a null-packet stream so the ring buffer still sees valid
    /// TS framing. `enabled` mirrors `SelfHealConfig::use_error_screen_fallback`.
    pub fn load(path: Option<&Path>, enabled: bool) -> Arc<Self> {
        let chunk = path
            .and_then(|path| match std::fs::read(path) {
                Ok(bytes) if bytes.len() >= TS_PACKET_LEN && bytes[0] == 0x47 => {
                    info!(path = %path.display(), "loaded filler clip");
                    Some(Bytes::from(bytes))
                }
                Ok(_) => {
                    warn!(path = %path.display(), "filler clip is not valid MPEG-TS, using synthesized null stream");
                    None
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "could not read filler clip, using synthesized null stream");
                    None
                }
            })
            .unwrap_or_else(|| synthesize_null_packets(FILLER_PACKET_COUNT));

        Arc::new(Self { chunk, enabled })
    }
}

impl FallbackSource for StaticFillerSource {
    fn stream(&self, _channel_id: ChannelId) -> BoxFuture<'_, Option<Bytes>> {
        Box::pin(async move { self.enabled.then(|| self.chunk.clone()) })
    }
}

fn synthesize_null_packets(count: usize) -> Bytes {
    let mut buf = Vec::with_capacity(count * TS_PACKET_LEN);
    for _ in 0..count {
        buf.push(0x47);
        buf.push((NULL_PID >> 8) as u8 & 0x1F);
        buf.push((NULL_PID & 0xFF) as u8);
        buf.push(0x10); // no scrambling, payload only, continuity counter 0
        buf.resize(buf.len() + (TS_PACKET_LEN - 4), 0xFF);
    }
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_source_yields_nothing() {
        let source = StaticFillerSource::load(None, false);
        assert!(source.stream(1).await.is_none());
    }

    #[tokio::test]
    async fn enabled_source_yields_valid_ts_framing() {
        let source = StaticFillerSource::load(None, true);
        let bytes = source.stream(1).await.unwrap();
        assert_eq!(bytes.len() % TS_PACKET_LEN, 0);
        for chunk in bytes.chunks(TS_PACKET_LEN) {
            assert_eq!(chunk[0], 0x47);
        }
    }

    #[test]
    fn missing_clip_path_falls_back_to_synthesized_stream() {
        let bytes = synthesize_null_packets(4);
        assert_eq!(bytes.len(), 4 * TS_PACKET_LEN);
    }
}
