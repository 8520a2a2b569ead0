//! Narrow capability interfaces that break the resolver/channel-manager/
//! session-manager cyclic reference the source has (see SPEC_FULL.md §9).
//! The self-healing loop and the HTTP surface depend on these traits, never
//! on the concrete `ChannelManager`/`SessionManager` types, so each side's
//! dependency is reduced to the minimum it actually needs.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

pub type ChannelId = i32;

/// Boxed future alias so the capability traits below stay object-safe
/// (`Arc<dyn ChannelControl>` etc.) without pulling in an `async-trait`
/// dependency the teacher's stack doesn't carry.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ChannelControl: Send + Sync {
    fn stop_channel(&self, channel_id: ChannelId) -> BoxFuture<'_, ()>;
    fn restart_channel(&self, channel_id: ChannelId) -> BoxFuture<'_, ()>;
}

pub trait SessionControl: Send + Sync {
    fn close_all(&self, channel_id: ChannelId) -> BoxFuture<'_, ()>;
}

/// A byte source the self-healing loop can attach to a channel's ring
/// buffer while a disruptive fix is in progress, so subscribers keep
/// seeing continuous video.
pub trait FallbackSource: Send + Sync {
    fn stream(&self, channel_id: ChannelId) -> BoxFuture<'_, Option<Bytes>>;
}
