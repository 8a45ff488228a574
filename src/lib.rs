pub mod config;
pub mod mesh;
pub mod peer;
pub mod protocol;
pub mod relay;
