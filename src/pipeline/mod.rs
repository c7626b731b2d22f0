//! Pipeline stages for archive-to-e-ink conversion.
//!
//! Each submodule implements one step. The [`crate::scheduler`] drives
//! them: it pulls from the source, fans pages out to workers that run
//! codec and transform, and feeds the results back in order to the sink.
//!
//! ## Data Flow
//!
//! ```text
//! source ──▶ codec::decode ──▶ transform ──▶ codec::encode ──▶ sink
//! (zip/dir)   (image crate)   (split/resize/   (png/jpeg)     (cbz/dir)
//!                              levels/dither)
//! ```
//!
//! 1. [`source`]   : sniff the container and stream page entries in natural order
//! 2. [`codec`]    : probe headers, decode, encode; blocking work
//! 3. [`transform`]: split spreads, fit to the screen, tune levels
//! 4. [`dither`]   : reduce gray depth (ordered or error diffusion)
//! 5. [`sink`]     : stage output and promote it atomically on success

pub mod codec;
pub mod dither;
pub mod sink;
pub mod source;
pub mod transform;
