pub mod annotations;
pub mod client;

pub use client::KubeClient;
