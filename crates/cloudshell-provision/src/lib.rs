pub mod artifact;
pub mod extract;
pub mod pipeline;
pub mod release;
pub mod setup;
pub mod tool;
pub mod triplet;

pub use pipeline::Provisioner;
