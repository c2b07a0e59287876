//! Normalizing flow mapping posterior latents to the prior space

mod coupling;

pub use coupling::{ResidualCouplingBlock, ResidualCouplingLayer};
