//! `clamma-sampler` - temperature / top-p token sampling with the
//! xorshift64* PRNG.

pub mod rng;
pub mod sampler;

pub use rng::Xorshift64Star;
pub use sampler::{Sampler, SamplerParams};
