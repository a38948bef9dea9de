//! # Audio Module
//!
//! Per-guild playback sessions for Open Tilawa.
//!
//! ## Architecture
//!
//! ### [`registry`] - Session Registry
//! - One [`session::PlaybackSession`] per guild, created on the first enqueue
//! - Each session runs as its own task draining a mailbox in order
//! - Atomic insert/remove per guild; at most one live voice link per guild
//!
//! ### [`session`] - Playback State Machine
//! - `Idle`, `Playing` and `Paused`, with strict FIFO advancement
//! - Fetches run detached and report back as mailbox events
//! - Stale track-end events are discarded by play id
//!
//! ### [`queue`] - Track Queue
//! - Slots reserved in request order, filled when their download finishes
//!
//! ### [`voice_link`] - Voice Connection
//! - Transport seam over songbird ([`voice_link::VoiceTransport`])
//! - Single bounded reconnect attempt after the grace period
//!
//! ### [`idle`] - Idle Reaper
//! - Tears the session down once its channel has had no human listeners
//!   for the idle timeout
//!
//! ## Example
//!
//! ```rust,ignore
//! # use std::sync::Arc;
//! # use open_tilawa::audio::{registry::SessionRegistry, session::SessionSettings};
//! # use serenity::all::{ChannelId, GuildId, UserId};
//! # async fn example(registry: SessionRegistry) -> anyhow::Result<()> {
//! let guild_id = GuildId::new(123456789);
//! let channel = Some(ChannelId::new(42));
//!
//! registry.enqueue(guild_id, channel, UserId::new(7), "2:255").await?;
//! registry.pause(guild_id).await?;
//! registry.resume(guild_id).await?;
//! registry.skip(guild_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod idle;
pub mod queue;
pub mod registry;
pub mod session;
pub mod voice_link;
